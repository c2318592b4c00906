use scriptdomain_api::SessionId;

use crate::marshal::Operation;

/// Event reported to an attached debugger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    /// The session finished initializing
    Started { resource: String, name: String },
    /// A call into the script faulted
    Fault {
        operation: Operation,
        diagnostic: String,
    },
    /// Breakpoints were accepted by the embedded context
    BreakpointsDefined { script_id: i32, definition: String },
    /// The session reached its terminal state
    Stopped {
        released_refs: usize,
        failed_calls: usize,
    },
}

/// Receives debug events from a session
pub trait DebugEventListener: Send + Sync {
    fn on_debug_event(&self, session: SessionId, event: &DebugEvent);
}
