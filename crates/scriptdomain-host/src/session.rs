//! Runtime domain sessions: one isolated script context per resource.
//!
//! A session is split in two. [`SessionShared`] holds everything that may be
//! touched while a script is running (references, exports, pending async
//! calls, the tick scheduler) behind short-lived locks, and is what the
//! embedded context reaches through its [`HostBridge`]. [`DomainSession`]
//! adds the embedded context itself, which only the thread holding the call
//! gate may borrow.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use scriptdomain_api::{AsyncResultId, CallStatus, RefHandle, SessionId};
use strum_macros::Display;
use tracing::{debug, error, info, warn};

use crate::context::{ContextCapabilities, ContextFactory, EmbeddedContext, ExportRouter, HostBridge};
use crate::debug::{DebugEvent, DebugEventListener};
use crate::error::BridgeError;
use crate::exports::{ExportBinding, ExportRegistry};
use crate::gate::CallGate;
use crate::marshal::{
    CallMeta, EventCall, ExportCall, ExportReply, Operation, Payload, RefCall, guarded,
};
use crate::pending::{
    AsyncResult, AwaitedResults, CallOrigin, ExportOutcome, PendingCalls, PendingExport,
};
use crate::reference::{RefRemoval, RefTable};
use crate::scheduler::{BookmarkHost, TickScheduler};

/// Instance ids are unique for the lifetime of the process
static NEXT_INSTANCE_ID: AtomicU32 = AtomicU32::new(1);

fn next_session_id() -> SessionId {
    SessionId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
}

/// Lifecycle of a session. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum SessionState {
    Uninitialized = 0,
    Active = 1,
    Stopped = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Uninitialized,
            1 => SessionState::Active,
            _ => SessionState::Stopped,
        }
    }
}

/// The resource a session belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceContext {
    name: String,
    path: Option<PathBuf>,
}

impl ResourceContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
        }
    }

    /// Attach the file the resource was loaded from
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

pub(crate) struct SessionShared {
    id: SessionId,
    name: String,
    resource: ResourceContext,
    state: AtomicU8,
    gate: CallGate,
    refs: Mutex<RefTable>,
    exports: Mutex<ExportRegistry>,
    pending: PendingCalls,
    /// Calls this session's script made into pending exports
    awaited: AwaitedResults,
    scheduler: TickScheduler,
    /// Last game time supplied by the host
    clock: AtomicU64,
    profiling: AtomicBool,
    router: RwLock<Option<Weak<dyn ExportRouter>>>,
    debug_listener: RwLock<Option<Arc<dyn DebugEventListener>>>,
    script_ids: Mutex<HashMap<String, i32>>,
}

impl SessionShared {
    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn resource(&self) -> &ResourceContext {
        &self.resource
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn ensure_active(&self) -> Result<(), BridgeError> {
        match self.state() {
            SessionState::Active => Ok(()),
            state => Err(BridgeError::InvalidState { state }),
        }
    }

    fn ensure_not_stopped(&self) -> Result<(), BridgeError> {
        match self.state() {
            SessionState::Stopped => Err(BridgeError::InvalidState {
                state: SessionState::Stopped,
            }),
            _ => Ok(()),
        }
    }

    fn observe(&self, meta: CallMeta) {
        self.clock.fetch_max(meta.game_time, Ordering::Relaxed);
    }

    fn current_meta(&self) -> CallMeta {
        CallMeta::new(
            self.clock.load(Ordering::Relaxed),
            self.profiling.load(Ordering::Relaxed),
        )
    }

    /// Scheduling on behalf of the script. A failure is also kept for the
    /// call in flight on this thread, which reports it to the host.
    pub(crate) fn schedule_tick(&self, time_ms: u64) -> Result<bool, BridgeError> {
        self.ensure_not_stopped()?;
        let result = self.scheduler.request(time_ms);
        if let Err(BridgeError::Initialization(fault)) = &result {
            if self.gate.held_by_current_thread() {
                self.scheduler.record_fault(fault.clone());
            }
        }
        result
    }

    pub(crate) fn register_export(
        &self,
        export: &str,
        private_id: u64,
        binding: u64,
    ) -> Result<(), BridgeError> {
        self.ensure_not_stopped()?;
        debug!(
            target: "runtime",
            "Resource {} registered export {} (private id {}, binding {})",
            self.resource.name(),
            export,
            private_id,
            binding
        );
        self.exports.lock().register(ExportBinding {
            resource: self.resource.name().to_string(),
            export: export.to_string(),
            private_id,
            binding,
        });
        Ok(())
    }

    pub(crate) fn expose_ref(&self, engine_ref: i32) -> Result<RefHandle, BridgeError> {
        self.ensure_not_stopped()?;
        self.refs.lock().insert(engine_ref).ok_or_else(|| {
            BridgeError::call(Operation::DuplicateRef, "reference table exhausted")
        })
    }

    fn resolve_ref(&self, handle: RefHandle) -> Result<i32, BridgeError> {
        self.refs
            .lock()
            .resolve(handle)
            .ok_or(BridgeError::InvalidReference(handle))
    }

    pub(crate) fn canonicalize_ref(&self, handle: RefHandle) -> Result<String, BridgeError> {
        self.resolve_ref(handle)?;
        Ok(format!("{}:{}:{}", self.resource.name(), self.id, handle))
    }

    pub(crate) fn deliver_async_result(
        &self,
        async_id: AsyncResultId,
        status: CallStatus,
        payload: Payload,
        meta: CallMeta,
    ) -> Result<(), BridgeError> {
        let result = AsyncResult {
            status,
            payload,
            game_time: meta.game_time,
            profiling: meta.profiling,
        };

        match self.pending.complete(async_id, Ok(result)) {
            Ok(origin) => {
                debug!(
                    target: "runtime",
                    "Async result {} completed {}:{} ({})",
                    async_id,
                    origin.resource,
                    origin.export,
                    status
                );
                Ok(())
            }
            Err(e) => {
                warn!(target: "runtime", "Ignoring async result for session {}: {}", self.id, e);
                Err(e)
            }
        }
    }

    pub(crate) fn await_result(&self, pending: PendingExport) -> Result<(), BridgeError> {
        self.ensure_not_stopped()?;
        debug!(
            target: "runtime",
            "Resource {} awaiting async result {}",
            self.resource.name(),
            pending.async_id()
        );
        self.awaited.push(pending);
        Ok(())
    }

    pub(crate) fn invoke_export_with(
        &self,
        resource: &str,
        export: &str,
        args: &[u8],
        invoke: impl FnOnce(&ExportCall<'_>) -> anyhow::Result<ExportReply>,
    ) -> Result<ExportOutcome, BridgeError> {
        self.ensure_active()?;

        if resource != self.resource.name() {
            return self.route_export(resource, export, args);
        }

        let binding = self
            .exports
            .lock()
            .resolve(resource, export)
            .cloned()
            .ok_or_else(|| BridgeError::ExportNotFound {
                resource: resource.to_string(),
                export: export.to_string(),
            })?;

        let meta = self.current_meta();
        // Opened before the call so a result delivered from inside it is not lost
        let (async_id, receiver) = self.pending.open(CallOrigin {
            resource: binding.resource.clone(),
            export: binding.export.clone(),
            game_time: meta.game_time,
        });

        let call = ExportCall {
            private_id: binding.private_id,
            binding: binding.binding,
            args,
            async_id,
            meta,
        };

        match guarded(Operation::InvokeExport, || invoke(&call)) {
            Ok(ExportReply::Ready(payload)) => {
                self.pending.discard(async_id);
                Ok(ExportOutcome::Ready(payload))
            }
            Ok(ExportReply::Pending) => {
                debug!(target: "runtime", "Export {}:{} pending as {}", resource, export, async_id);
                Ok(ExportOutcome::Pending(PendingExport::new(async_id, receiver)))
            }
            Ok(ExportReply::Failed { status, diagnostic }) => {
                self.pending.discard(async_id);
                Err(BridgeError::Call {
                    operation: Operation::InvokeExport,
                    status,
                    diagnostic: diagnostic.unwrap_or_else(|| status.to_string()),
                })
            }
            Err(e) => {
                self.pending.discard(async_id);
                Err(e)
            }
        }
    }

    fn route_export(
        &self,
        resource: &str,
        export: &str,
        args: &[u8],
    ) -> Result<ExportOutcome, BridgeError> {
        let router = self.router.read().as_ref().and_then(Weak::upgrade);
        match router {
            Some(router) => router.route_export(resource, export, args),
            None => Err(BridgeError::ExportNotFound {
                resource: resource.to_string(),
                export: export.to_string(),
            }),
        }
    }

    fn emit(&self, event: DebugEvent) {
        let listener = self.debug_listener.read().clone();
        if let Some(listener) = listener {
            listener.on_debug_event(self.id, &event);
        }
    }

    fn report_fault(&self, operation: Operation, err: &BridgeError) {
        match err {
            BridgeError::Call { diagnostic, .. } => {
                error!(
                    target: "runtime",
                    "Resource {} faulted during {}: {}",
                    self.resource.name(),
                    operation,
                    diagnostic
                );
                self.emit(DebugEvent::Fault {
                    operation,
                    diagnostic: diagnostic.clone(),
                });
            }
            other => {
                debug!(target: "runtime", "{} on session {} failed: {}", operation, self.id, other);
            }
        }
    }
}

/// One isolated script execution context bound to a resource
pub struct DomainSession {
    shared: Arc<SessionShared>,
    context: Mutex<Option<Box<dyn EmbeddedContext>>>,
}

impl DomainSession {
    /// Create an uninitialized session; call [`DomainSession::initialize`] next
    pub fn new(resource: ResourceContext, bookmarks: Arc<dyn BookmarkHost>) -> Self {
        let id = next_session_id();
        let shared = SessionShared {
            id,
            name: format!("ScriptDomain_{}", id),
            resource,
            state: AtomicU8::new(SessionState::Uninitialized as u8),
            gate: CallGate::new(),
            refs: Mutex::new(RefTable::new()),
            exports: Mutex::new(ExportRegistry::new()),
            pending: PendingCalls::new(),
            awaited: AwaitedResults::new(),
            scheduler: TickScheduler::new(id, bookmarks),
            clock: AtomicU64::new(0),
            profiling: AtomicBool::new(false),
            router: RwLock::new(None),
            debug_listener: RwLock::new(None),
            script_ids: Mutex::new(HashMap::new()),
        };

        Self {
            shared: Arc::new(shared),
            context: Mutex::new(None),
        }
    }

    /// Create and initialize a session in one step
    pub fn create(
        resource: ResourceContext,
        bookmarks: Arc<dyn BookmarkHost>,
        factory: &dyn ContextFactory,
    ) -> Result<Self, BridgeError> {
        let session = Self::new(resource, bookmarks);
        session.initialize(factory)?;
        Ok(session)
    }

    /// Build the embedded context and make the session active
    pub fn initialize(&self, factory: &dyn ContextFactory) -> Result<(), BridgeError> {
        let _ticket = self.shared.gate.enter()?;

        let state = self.shared.state();
        if state != SessionState::Uninitialized {
            return Err(BridgeError::InvalidState { state });
        }

        let bridge = HostBridge::new(self.shared.clone());
        let mut context = guarded(Operation::Initialize, || factory.create_context(bridge))
            .map_err(|e| self.initialization_failed(e))?;
        guarded(Operation::Initialize, || context.init())
            .and_then(|()| match self.shared.scheduler.take_fault() {
                Some(fault) => Err(BridgeError::Initialization(fault)),
                None => Ok(()),
            })
            .map_err(|e| self.initialization_failed(e))?;

        // A stop requested while the context was being built wins
        if self
            .shared
            .state
            .compare_exchange(
                SessionState::Uninitialized as u8,
                SessionState::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            context.shutdown();
            return Err(BridgeError::SessionStopped);
        }
        *self.context.lock() = Some(context);

        info!(
            target: "runtime",
            "Started {} for resource {}",
            self.shared.name,
            self.shared.resource.name()
        );
        self.shared.emit(DebugEvent::Started {
            resource: self.shared.resource.name().to_string(),
            name: self.shared.name.clone(),
        });
        Ok(())
    }

    fn initialization_failed(&self, err: BridgeError) -> BridgeError {
        let diagnostic = err.diagnostic();
        error!(
            target: "runtime",
            "Failed to initialize {} for resource {}: {}",
            self.shared.name,
            self.shared.resource.name(),
            diagnostic
        );
        match err {
            BridgeError::Initialization(_) => err,
            _ => BridgeError::Initialization(diagnostic),
        }
    }

    /// Run `call` against the embedded context under the call gate
    fn with_context<T>(
        &self,
        operation: Operation,
        call: impl FnOnce(&mut dyn EmbeddedContext) -> Result<T, BridgeError>,
    ) -> Result<T, BridgeError> {
        let _ticket = self.shared.gate.enter()?;
        self.shared.ensure_active()?;

        let result = {
            // The gate admits only this thread, so a held lock means reentry
            let Some(mut slot) = self.context.try_lock() else {
                return Err(BridgeError::Reentrancy(format!(
                    "{} re-entered {} while its script is running",
                    operation, self.shared.name
                )));
            };

            let result = match slot.as_mut() {
                Some(context) => call(context.as_mut()),
                None => Err(BridgeError::InvalidState {
                    state: self.shared.state(),
                }),
            };

            // A stop requested from inside the call tears the context down now
            if self.shared.state() == SessionState::Stopped {
                if let Some(mut context) = slot.take() {
                    context.shutdown();
                }
            }
            result
        };

        if let Some(fault) = self.shared.scheduler.take_fault() {
            return Err(BridgeError::Initialization(fault));
        }
        if let Err(ref err) = result {
            self.shared.report_fault(operation, err);
        }
        result
    }

    // ===== Identity =====

    pub fn instance_id(&self) -> SessionId {
        self.shared.id
    }

    /// Generated `ScriptDomain_<id>` name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The resource that owns this session
    pub fn resource(&self) -> &ResourceContext {
        &self.shared.resource
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Optional entry points of the embedded context, empty unless active
    pub fn capabilities(&self) -> ContextCapabilities {
        self.context
            .try_lock()
            .and_then(|slot| slot.as_ref().map(|context| context.capabilities()))
            .unwrap_or_default()
    }

    /// Handle for calling back into this session from script-side code
    pub fn bridge(&self) -> HostBridge {
        HostBridge::new(self.shared.clone())
    }

    /// Route exports of other resources through `router`
    pub fn set_export_router(&self, router: Weak<dyn ExportRouter>) {
        *self.shared.router.write() = Some(router);
    }

    // ===== Ticks =====

    /// Give the script control at `meta.game_time`
    ///
    /// A wake time that has been reached is cleared on entry; requests made
    /// while the script runs are registered once, at their minimum, when it
    /// returns.
    ///
    /// Results of pending exports the script is waiting on are handed to it
    /// before the tick itself.
    pub fn tick(&self, meta: CallMeta) -> Result<(), BridgeError> {
        self.with_context(Operation::Tick, |context| {
            self.shared.observe(meta);
            self.shared.scheduler.begin_tick(meta.game_time);
            let result = self
                .forward_async_results(context, meta)
                .and_then(|()| guarded(Operation::Tick, || context.tick(meta)));
            let flushed = self.shared.scheduler.end_tick();
            result?;
            flushed.map(|_| ())
        })
    }

    /// Deliver every awaited result that has arrived, reporting the first failure
    fn forward_async_results(
        &self,
        context: &mut dyn EmbeddedContext,
        meta: CallMeta,
    ) -> Result<(), BridgeError> {
        let completed = self.shared.awaited.take_completed();
        if completed.is_empty() {
            return Ok(());
        }

        if !context.capabilities().contains(ContextCapabilities::ASYNC_RESULT) {
            warn!(
                target: "runtime",
                "Resource {} cannot take async results, dropping {}",
                self.shared.resource.name(),
                completed.len()
            );
            return Ok(());
        }

        let mut first_error = None;
        for (async_id, completion) in completed {
            let result = completion.unwrap_or_else(|e| AsyncResult::from_error(&e, meta));
            debug!(target: "runtime", "Forwarding async result {} ({})", async_id, result.status);
            if let Err(e) = guarded(Operation::AsyncResult, || context.async_result(async_id, &result)) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Ask to be ticked again no later than `time_ms`
    ///
    /// Returns whether a new bookmark was registered.
    pub fn schedule_tick(&self, time_ms: u64) -> Result<bool, BridgeError> {
        let _ticket = self.shared.gate.enter()?;
        self.shared.ensure_not_stopped()?;
        self.shared.scheduler.request(time_ms)
    }

    /// Wake time currently registered with the bookmark host
    pub fn scheduled_tick(&self) -> Option<u64> {
        self.shared.scheduler.scheduled()
    }

    // ===== Events =====

    /// Deliver a named event; returns whether the script handled it
    pub fn trigger_event(
        &self,
        name: &str,
        args: &[u8],
        source: &str,
        meta: CallMeta,
    ) -> Result<bool, BridgeError> {
        self.with_context(Operation::TriggerEvent, |context| {
            self.shared.observe(meta);
            let event = EventCall {
                name,
                args,
                source,
                meta,
            };
            guarded(Operation::TriggerEvent, || context.trigger_event(&event))
        })
    }

    // ===== References =====

    pub fn call_ref(
        &self,
        handle: RefHandle,
        args: &[u8],
        meta: CallMeta,
    ) -> Result<Payload, BridgeError> {
        self.with_context(Operation::CallRef, |context| {
            let engine_ref = self.shared.resolve_ref(handle)?;
            self.shared.observe(meta);
            let call = RefCall {
                engine_ref,
                args,
                meta,
            };
            guarded(Operation::CallRef, || context.call_ref(&call))
        })
    }

    /// Issue a new handle aliasing the same script object
    pub fn duplicate_ref(&self, handle: RefHandle) -> Result<RefHandle, BridgeError> {
        self.with_context(Operation::DuplicateRef, |context| {
            let engine_ref = self.shared.resolve_ref(handle)?;
            let duplicate = guarded(Operation::DuplicateRef, || context.duplicate_ref(engine_ref))?;
            self.shared.expose_ref(duplicate)
        })
    }

    /// Release a handle. Removing a handle twice is reported, not an error.
    pub fn remove_ref(&self, handle: RefHandle) -> Result<RefRemoval, BridgeError> {
        self.with_context(Operation::RemoveRef, |context| {
            let removed = self.shared.refs.lock().remove(handle);
            let Some(engine_ref) = removed else {
                warn!(
                    target: "runtime",
                    "Resource {} removed unknown or released reference {}",
                    self.shared.resource.name(),
                    handle
                );
                return Ok(RefRemoval::AlreadyReleased);
            };
            guarded(Operation::RemoveRef, || context.remove_ref(engine_ref))?;
            Ok(RefRemoval::Released)
        })
    }

    /// Render a live handle as `resource:instance:handle`
    pub fn canonicalize_ref(&self, handle: RefHandle) -> Result<String, BridgeError> {
        self.shared.canonicalize_ref(handle)
    }

    pub fn live_refs(&self) -> usize {
        self.shared.refs.lock().live_count()
    }

    // ===== Exports =====

    pub fn register_export(
        &self,
        export: &str,
        private_id: u64,
        binding: u64,
    ) -> Result<(), BridgeError> {
        let _ticket = self.shared.gate.enter()?;
        self.shared.register_export(export, private_id, binding)
    }

    /// Names of the exports this resource registered
    pub fn exports(&self) -> Vec<String> {
        let registry = self.shared.exports.lock();
        registry
            .exports_of(self.shared.resource.name())
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Invoke an export by resource and name
    ///
    /// When the export completes asynchronously the outcome is pending and
    /// carries the async result id; no result buffer is available yet.
    pub fn invoke_external_export(
        &self,
        resource: &str,
        export: &str,
        args: &[u8],
    ) -> Result<ExportOutcome, BridgeError> {
        if resource != self.shared.resource.name() {
            self.shared.ensure_active()?;
            return self.shared.route_export(resource, export, args);
        }

        self.with_context(Operation::InvokeExport, |context| {
            self.shared
                .invoke_export_with(resource, export, args, |call| context.invoke_export(call))
        })
    }

    /// Complete a pending export call. Safe to call from any thread.
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

    pub fn pending_async_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Pending exports of other calls this session's script is waiting on
    pub fn awaited_async_results(&self) -> usize {
        self.shared.awaited.len()
    }

    // ===== Introspection =====

    pub fn memory_usage(&self) -> Result<i64, BridgeError> {
        self.with_context(Operation::MemoryUsage, |context| {
            if !context.capabilities().contains(ContextCapabilities::MEMORY_USAGE) {
                return Err(BridgeError::Unavailable(Operation::MemoryUsage));
            }
            guarded(Operation::MemoryUsage, || context.memory_usage())
        })
    }

    pub fn start_profiling(&self) -> Result<(), BridgeError> {
        self.with_context(Operation::StartProfiling, |context| {
            if !context.capabilities().contains(ContextCapabilities::PROFILING) {
                return Err(BridgeError::Unavailable(Operation::StartProfiling));
            }
            guarded(Operation::StartProfiling, || context.start_profiling())?;
            self.shared.profiling.store(true, Ordering::Relaxed);
            Ok(())
        })
    }

    pub fn stop_profiling(&self) -> Result<(), BridgeError> {
        self.with_context(Operation::StopProfiling, |context| {
            if !context.capabilities().contains(ContextCapabilities::PROFILING) {
                return Err(BridgeError::Unavailable(Operation::StopProfiling));
            }
            guarded(Operation::StopProfiling, || context.stop_profiling())?;
            self.shared.profiling.store(false, Ordering::Relaxed);
            Ok(())
        })
    }

    pub fn is_profiling(&self) -> bool {
        self.shared.profiling.load(Ordering::Relaxed)
    }

    // ===== Debugging =====

    pub fn set_debug_listener(&self, listener: Option<Arc<dyn DebugEventListener>>) {
        *self.shared.debug_listener.write() = listener;
    }

    /// Associate a loaded script file with the id a debugger knows it by
    pub fn set_script_identifier(&self, file_name: &str, script_id: i32) {
        self.shared
            .script_ids
            .lock()
            .insert(file_name.to_string(), script_id);
    }

    pub fn script_identifier(&self, file_name: &str) -> Option<i32> {
        self.shared.script_ids.lock().get(file_name).copied()
    }

    pub fn set_breakpoints(&self, script_id: i32, definition: &str) -> Result<(), BridgeError> {
        self.with_context(Operation::SetBreakpoints, |context| {
            if !context.capabilities().contains(ContextCapabilities::DEBUGGING) {
                return Err(BridgeError::Unavailable(Operation::SetBreakpoints));
            }
            guarded(Operation::SetBreakpoints, || {
                context.set_breakpoints(script_id, definition)
            })?;
            self.shared.emit(DebugEvent::BreakpointsDefined {
                script_id,
                definition: definition.to_string(),
            });
            Ok(())
        })
    }

    // ===== Teardown =====

    /// Stop the session for good
    ///
    /// Invalidates every reference handle, fails every pending async call
    /// with `SessionStopped` and shuts the embedded context down. Stopping
    /// twice is a no-op.
    pub fn stop(&self) -> Result<(), BridgeError> {
        let _ticket = self.shared.gate.enter()?;

        let previous = self
            .shared
            .state
            .swap(SessionState::Stopped as u8, Ordering::SeqCst);
        if SessionState::from_u8(previous) == SessionState::Stopped {
            return Ok(());
        }

        let released_refs = self.shared.refs.lock().clear();
        let failed_calls = self.shared.pending.fail_all(BridgeError::SessionStopped);
        self.shared.awaited.clear();
        self.shared.exports.lock().clear();
        self.shared.scheduler.reset();
        self.shared.profiling.store(false, Ordering::Relaxed);

        // When a call on this thread is still inside the script, it drops the
        // context once it unwinds
        if let Some(mut slot) = self.context.try_lock() {
            if let Some(mut context) = slot.take() {
                context.shutdown();
            }
        }

        info!(
            target: "runtime",
            "Stopped {} for resource {} ({} reference(s) released, {} pending call(s) failed)",
            self.shared.name,
            self.shared.resource.name(),
            released_refs,
            failed_calls
        );
        self.shared.emit(DebugEvent::Stopped {
            released_refs,
            failed_calls,
        });
        Ok(())
    }
}

impl Drop for DomainSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
