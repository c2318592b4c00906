use scriptdomain_api::{AsyncResultId, CallStatus, RefHandle};
use thiserror::Error;

use crate::marshal::Operation;
use crate::session::SessionState;

/// Every failure a session reports to its host
///
/// Faults raised inside the embedded context never cross the session as
/// panics; they arrive here as [`BridgeError::Call`] with a diagnostic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// The session cannot run: construction failed or the bookmark host is gone
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("session is {state}, expected active")]
    InvalidState { state: SessionState },

    #[error("invalid reference {0}")]
    InvalidReference(RefHandle),

    #[error("{operation} failed ({status}): {diagnostic}")]
    Call {
        operation: Operation,
        status: CallStatus,
        diagnostic: String,
    },

    #[error("export `{export}` not found on resource `{resource}`")]
    ExportNotFound { resource: String, export: String },

    #[error("stale async result {0}")]
    StaleAsyncResult(AsyncResultId),

    #[error("reentrancy violation: {0}")]
    Reentrancy(String),

    #[error("session stopped")]
    SessionStopped,

    #[error("{0} is not available in this runtime")]
    Unavailable(Operation),
}

impl BridgeError {
    /// Script fault with the generic call-error status
    pub fn call(operation: Operation, diagnostic: impl Into<String>) -> Self {
        BridgeError::Call {
            operation,
            status: CallStatus::CallError,
            diagnostic: diagnostic.into(),
        }
    }

    /// Status code reported across the boundary for this error
    pub fn status(&self) -> CallStatus {
        match self {
            BridgeError::Initialization(_) => CallStatus::InitializationError,
            BridgeError::InvalidState { .. } => CallStatus::InvalidState,
            BridgeError::InvalidReference(_) => CallStatus::InvalidReference,
            BridgeError::Call { status, .. } => *status,
            BridgeError::ExportNotFound { .. } => CallStatus::ExportNotFound,
            BridgeError::StaleAsyncResult(_) => CallStatus::StaleAsyncResult,
            BridgeError::Reentrancy(_) => CallStatus::ReentrancyViolation,
            BridgeError::SessionStopped => CallStatus::SessionStopped,
            BridgeError::Unavailable(_) => CallStatus::Unavailable,
        }
    }

    /// Diagnostic string handed to the host alongside the status
    pub fn diagnostic(&self) -> String {
        match self {
            BridgeError::Call { diagnostic, .. } => diagnostic.clone(),
            other => other.to_string(),
        }
    }
}
