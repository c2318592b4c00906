//! Capability interfaces a host can program against.
//!
//! Each trait covers one facet of a script runtime so hosts that only need,
//! say, event dispatch do not depend on the rest. [`DomainSession`] implements
//! all of them by delegating to its inherent methods.

use std::sync::Arc;

use scriptdomain_api::{AsyncResultId, CallStatus, RefHandle, SessionId};

use crate::debug::DebugEventListener;
use crate::error::BridgeError;
use crate::marshal::{CallMeta, Payload};
use crate::pending::ExportOutcome;
use crate::reference::RefRemoval;
use crate::session::{DomainSession, ResourceContext, SessionState};

/// Identity and lifecycle shared by every runtime
pub trait ScriptRuntime {
    fn instance_id(&self) -> SessionId;
    fn name(&self) -> &str;
    /// The resource this runtime belongs to
    fn parent_resource(&self) -> &ResourceContext;
    fn state(&self) -> SessionState;
    fn destroy(&self) -> Result<(), BridgeError>;
}

pub trait TickRuntime: ScriptRuntime {
    fn tick(&self, meta: CallMeta) -> Result<(), BridgeError>;
    fn schedule_tick(&self, time_ms: u64) -> Result<bool, BridgeError>;
}

pub trait EventRuntime: ScriptRuntime {
    fn trigger_event(
        &self,
        name: &str,
        args: &[u8],
        source: &str,
        meta: CallMeta,
    ) -> Result<bool, BridgeError>;
}

pub trait RefRuntime: ScriptRuntime {
    fn call_ref(&self, handle: RefHandle, args: &[u8], meta: CallMeta)
        -> Result<Payload, BridgeError>;
    fn duplicate_ref(&self, handle: RefHandle) -> Result<RefHandle, BridgeError>;
    fn remove_ref(&self, handle: RefHandle) -> Result<RefRemoval, BridgeError>;
    fn canonicalize_ref(&self, handle: RefHandle) -> Result<String, BridgeError>;
}

pub trait ExportRuntime: ScriptRuntime {
    fn register_export(&self, export: &str, private_id: u64, binding: u64)
        -> Result<(), BridgeError>;
    fn invoke_external_export(
        &self,
        resource: &str,
        export: &str,
        args: &[u8],
    ) -> Result<ExportOutcome, BridgeError>;
    fn deliver_async_result(
        &self,
        async_id: AsyncResultId,
        status: CallStatus,
        payload: Payload,
        meta: CallMeta,
    ) -> Result<(), BridgeError>;
}

pub trait MemInfoRuntime: ScriptRuntime {
    fn memory_usage(&self) -> Result<i64, BridgeError>;
}

pub trait ProfilerRuntime: ScriptRuntime {
    fn start_profiling(&self) -> Result<(), BridgeError>;
    fn stop_profiling(&self) -> Result<(), BridgeError>;
}

pub trait DebugRuntime: ScriptRuntime {
    fn set_debug_listener(&self, listener: Option<Arc<dyn DebugEventListener>>);
    fn set_script_identifier(&self, file_name: &str, script_id: i32);
    fn set_breakpoints(&self, script_id: i32, definition: &str) -> Result<(), BridgeError>;
}

impl ScriptRuntime for DomainSession {
    fn instance_id(&self) -> SessionId {
        DomainSession::instance_id(self)
    }

    fn name(&self) -> &str {
        DomainSession::name(self)
    }

    fn parent_resource(&self) -> &ResourceContext {
        self.resource()
    }

    fn state(&self) -> SessionState {
        DomainSession::state(self)
    }

    fn destroy(&self) -> Result<(), BridgeError> {
        self.stop()
    }
}

impl TickRuntime for DomainSession {
    fn tick(&self, meta: CallMeta) -> Result<(), BridgeError> {
        DomainSession::tick(self, meta)
    }

    fn schedule_tick(&self, time_ms: u64) -> Result<bool, BridgeError> {
        DomainSession::schedule_tick(self, time_ms)
    }
}

impl EventRuntime for DomainSession {
    fn trigger_event(
        &self,
        name: &str,
        args: &[u8],
        source: &str,
        meta: CallMeta,
    ) -> Result<bool, BridgeError> {
        DomainSession::trigger_event(self, name, args, source, meta)
    }
}

impl RefRuntime for DomainSession {
    fn call_ref(
        &self,
        handle: RefHandle,
        args: &[u8],
        meta: CallMeta,
    ) -> Result<Payload, BridgeError> {
        DomainSession::call_ref(self, handle, args, meta)
    }

    fn duplicate_ref(&self, handle: RefHandle) -> Result<RefHandle, BridgeError> {
        DomainSession::duplicate_ref(self, handle)
    }

    fn remove_ref(&self, handle: RefHandle) -> Result<RefRemoval, BridgeError> {
        DomainSession::remove_ref(self, handle)
    }

    fn canonicalize_ref(&self, handle: RefHandle) -> Result<String, BridgeError> {
        DomainSession::canonicalize_ref(self, handle)
    }
}

impl ExportRuntime for DomainSession {
    fn register_export(
        &self,
        export: &str,
        private_id: u64,
        binding: u64,
    ) -> Result<(), BridgeError> {
        DomainSession::register_export(self, export, private_id, binding)
    }

    fn invoke_external_export(
        &self,
        resource: &str,
        export: &str,
        args: &[u8],
    ) -> Result<ExportOutcome, BridgeError> {
        DomainSession::invoke_external_export(self, resource, export, args)
    }

    fn deliver_async_result(
        &self,
        async_id: AsyncResultId,
        status: CallStatus,
        payload: Payload,
        meta: CallMeta,
    ) -> Result<(), BridgeError> {
        DomainSession::deliver_async_result(self, async_id, status, payload, meta)
    }
}

impl MemInfoRuntime for DomainSession {
    fn memory_usage(&self) -> Result<i64, BridgeError> {
        DomainSession::memory_usage(self)
    }
}

impl ProfilerRuntime for DomainSession {
    fn start_profiling(&self) -> Result<(), BridgeError> {
        DomainSession::start_profiling(self)
    }

    fn stop_profiling(&self) -> Result<(), BridgeError> {
        DomainSession::stop_profiling(self)
    }
}

impl DebugRuntime for DomainSession {
    fn set_debug_listener(&self, listener: Option<Arc<dyn DebugEventListener>>) {
        DomainSession::set_debug_listener(self, listener)
    }

    fn set_script_identifier(&self, file_name: &str, script_id: i32) {
        DomainSession::set_script_identifier(self, file_name, script_id)
    }

    fn set_breakpoints(&self, script_id: i32, definition: &str) -> Result<(), BridgeError> {
        DomainSession::set_breakpoints(self, script_id, definition)
    }
}
