use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use scriptdomain_api::{AsyncResultId, CallStatus, RefHandle, SessionId};
use tracing::{debug, error, info, trace, warn};

use crate::error::BridgeError;
use crate::marshal::{CallMeta, EventCall, ExportCall, ExportReply, Operation, Payload, RefCall};
use crate::pending::{AsyncResult, ExportOutcome, PendingExport};
use crate::session::SessionShared;

bitflags! {
    /// Optional entry points an embedded context provides
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContextCapabilities: u32 {
        const MEMORY_USAGE = 0x01;
        const PROFILING = 0x02;
        const DEBUGGING = 0x04;
        const ASYNC_RESULT = 0x08;
    }
}

/// The script side of a session: one isolated execution context
///
/// Every method is a resolved entry point into the script engine. Errors and
/// panics are caught by the session and reported as call errors, so
/// implementations are free to use `?` on whatever their engine returns.
/// Optional entry points default to reporting themselves unavailable.
pub trait EmbeddedContext: Send {
    /// Optional entry points this context resolved
    fn capabilities(&self) -> ContextCapabilities {
        ContextCapabilities::empty()
    }

    /// Runs once after the context is created, before the session goes active
    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn tick(&mut self, meta: CallMeta) -> anyhow::Result<()>;

    /// Returns whether any handler accepted the event
    fn trigger_event(&mut self, event: &EventCall<'_>) -> anyhow::Result<bool>;

    fn call_ref(&mut self, call: &RefCall<'_>) -> anyhow::Result<Payload>;

    /// Returns a new engine ref aliasing the same object
    fn duplicate_ref(&mut self, engine_ref: i32) -> anyhow::Result<i32>;

    fn remove_ref(&mut self, engine_ref: i32) -> anyhow::Result<()>;

    fn invoke_export(&mut self, call: &ExportCall<'_>) -> anyhow::Result<ExportReply>;

    fn memory_usage(&mut self) -> anyhow::Result<i64> {
        Err(BridgeError::Unavailable(Operation::MemoryUsage).into())
    }

    fn start_profiling(&mut self) -> anyhow::Result<()> {
        Err(BridgeError::Unavailable(Operation::StartProfiling).into())
    }

    fn stop_profiling(&mut self) -> anyhow::Result<()> {
        Err(BridgeError::Unavailable(Operation::StopProfiling).into())
    }

    /// Hand the script the result of an export call it was waiting on
    fn async_result(&mut self, _async_id: AsyncResultId, _result: &AsyncResult) -> anyhow::Result<()> {
        Err(BridgeError::Unavailable(Operation::AsyncResult).into())
    }

    fn set_breakpoints(&mut self, _script_id: i32, _definition: &str) -> anyhow::Result<()> {
        Err(BridgeError::Unavailable(Operation::SetBreakpoints).into())
    }

    /// Release engine resources; called once when the session stops
    fn shutdown(&mut self) {}
}

/// Builds the embedded context for a session
///
/// Implementations resolve every entry point they need up front and fail if
/// any required one is missing.
pub trait ContextFactory {
    fn create_context(&self, bridge: HostBridge) -> anyhow::Result<Box<dyn EmbeddedContext>>;
}

impl<F> ContextFactory for F
where
    F: Fn(HostBridge) -> anyhow::Result<Box<dyn EmbeddedContext>>,
{
    fn create_context(&self, bridge: HostBridge) -> anyhow::Result<Box<dyn EmbeddedContext>> {
        self(bridge)
    }
}

/// Resolves exports that belong to other resources
pub trait ExportRouter: Send + Sync {
    fn route_export(
        &self,
        resource: &str,
        export: &str,
        args: &[u8],
    ) -> Result<ExportOutcome, BridgeError>;
}

/// Handle an embedded context uses to call back into its session
///
/// Everything here touches only thread-safe session state and never needs
/// the embedded context itself, so it is safe to use while a call into the
/// script is in flight.
#[derive(Clone)]
pub struct HostBridge {
    shared: Arc<SessionShared>,
}

impl HostBridge {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.id()
    }

    pub fn resource_name(&self) -> &str {
        self.shared.resource().name()
    }

    /// Ask the host to tick this session again no later than `time_ms`
    pub fn schedule_tick(&self, time_ms: u64) -> Result<bool, BridgeError> {
        self.shared.schedule_tick(time_ms)
    }

    /// Declare an export of this resource
    pub fn register_export(
        &self,
        export: &str,
        private_id: u64,
        binding: u64,
    ) -> Result<(), BridgeError> {
        self.shared.register_export(export, private_id, binding)
    }

    /// Complete an asynchronous export call started by this session
    pub fn deliver_async_result(
        &self,
        async_id: AsyncResultId,
        status: CallStatus,
        payload: Payload,
        meta: CallMeta,
    ) -> Result<(), BridgeError> {
        self.shared
            .deliver_async_result(async_id, status, payload, meta)
    }

    /// Wait on an export call that returned pending
    ///
    /// The result is handed to this session's context through
    /// [`EmbeddedContext::async_result`] on its next tick.
    pub fn await_result(&self, pending: PendingExport) -> Result<(), BridgeError> {
        self.shared.await_result(pending)
    }

    /// Hand an engine reference to the host, returning the handle it will use
    pub fn expose_ref(&self, engine_ref: i32) -> Result<RefHandle, BridgeError> {
        self.shared.expose_ref(engine_ref)
    }

    /// Render a handle as `resource:instance:handle`
    pub fn canonicalize_ref(&self, handle: RefHandle) -> Result<String, BridgeError> {
        self.shared.canonicalize_ref(handle)
    }

    /// Invoke an export while a call into this session is already in flight
    ///
    /// Local exports run through `invoke`, which must call into the context
    /// that is currently executing. Exports of other resources are routed
    /// through the host.
    pub fn invoke_external_export(
        &self,
        resource: &str,
        export: &str,
        args: &[u8],
        invoke: impl FnOnce(&ExportCall<'_>) -> anyhow::Result<ExportReply>,
    ) -> Result<ExportOutcome, BridgeError> {
        self.shared
            .invoke_export_with(resource, export, args, invoke)
    }

    /// Re-emit a script log line. Levels: 0 error, 1 warn, 2 info, 3 debug, other trace.
    pub fn log(&self, level: i32, message: &str) {
        let resource = self.resource_name();
        match level {
            0 => error!(target: "script", resource, "{}", message),
            1 => warn!(target: "script", resource, "{}", message),
            2 => info!(target: "script", resource, "{}", message),
            3 => debug!(target: "script", resource, "{}", message),
            _ => trace!(target: "script", resource, "{}", message),
        }
    }
}

impl fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBridge")
            .field("session", &self.shared.id())
            .field("resource", &self.resource_name())
            .finish()
    }
}
