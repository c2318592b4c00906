//! Host bridge for embedded script runtimes
//!
//! A [`DomainSession`] runs one isolated script context per resource and
//! exposes it to the host through a small set of capabilities: ticks, event
//! dispatch, reference invocation, exports, profiling and memory
//! introspection. [`DomainHost`] manages many sessions and drives them.

pub mod config;
pub mod context;
pub mod debug;
pub mod error;
pub mod exports;
mod gate;
pub mod host;
pub mod marshal;
pub mod pending;
pub mod reference;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod wasm;

pub use config::{ConfigError, RuntimeConfig, TickPolicy, WasmConfig};
pub use context::{ContextCapabilities, ContextFactory, EmbeddedContext, ExportRouter, HostBridge};
pub use debug::{DebugEvent, DebugEventListener};
pub use error::BridgeError;
pub use exports::{ExportBinding, ExportRegistry};
pub use host::DomainHost;
pub use marshal::{CallMeta, CallReply, EventCall, ExportCall, ExportReply, Operation, Payload, RefCall};
pub use pending::{AsyncCompletion, AsyncResult, ExportOutcome, PendingExport};
pub use reference::RefRemoval;
pub use runtime::{
    DebugRuntime, EventRuntime, ExportRuntime, MemInfoRuntime, ProfilerRuntime, RefRuntime,
    ScriptRuntime, TickRuntime,
};
pub use scheduler::{BookmarkError, BookmarkHost, BookmarkQueue};
pub use session::{DomainSession, ResourceContext, SessionState};
pub use wasm::{WasmContext, WasmModuleFactory, WasmRuntime};

pub use scriptdomain_api::{AsyncResultId, CallStatus, RefHandle, SessionId};
