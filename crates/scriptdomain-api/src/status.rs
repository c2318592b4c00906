use std::fmt;

/// Status code reported across the host/script boundary
///
/// Values are part of the guest ABI and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CallStatus {
    /// Call completed and any result buffer is valid
    Ok = 0,
    /// Call was accepted and its result will be delivered later
    Pending = 1,
    /// The session could not be constructed or lost a fatal collaborator
    InitializationError = 10,
    /// The session is not active
    InvalidState = 11,
    /// Unknown or already removed reference handle
    InvalidReference = 12,
    /// The script faulted while handling the call
    CallError = 13,
    /// No export is registered under the requested name
    ExportNotFound = 14,
    /// The async result id is unknown or was already consumed
    StaleAsyncResult = 15,
    /// The session is busy on another thread
    ReentrancyViolation = 16,
    /// The session stopped before the call completed
    SessionStopped = 17,
    /// The embedded context does not expose this capability
    Unavailable = 18,
}

impl CallStatus {
    /// Decode a raw status byte. Unknown codes are treated as script faults.
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => CallStatus::Ok,
            1 => CallStatus::Pending,
            10 => CallStatus::InitializationError,
            11 => CallStatus::InvalidState,
            12 => CallStatus::InvalidReference,
            13 => CallStatus::CallError,
            14 => CallStatus::ExportNotFound,
            15 => CallStatus::StaleAsyncResult,
            16 => CallStatus::ReentrancyViolation,
            17 => CallStatus::SessionStopped,
            18 => CallStatus::Unavailable,
            _ => CallStatus::CallError,
        }
    }

    /// Decode a status returned by a guest entry point as `i32`
    pub fn from_guest(code: i32) -> Self {
        u8::try_from(code)
            .map(Self::from_u8)
            .unwrap_or(CallStatus::CallError)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// `Ok` and `Pending` are the only non-failure statuses
    pub fn is_success(self) -> bool {
        matches!(self, CallStatus::Ok | CallStatus::Pending)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallStatus::Ok => "ok",
            CallStatus::Pending => "pending",
            CallStatus::InitializationError => "initialization error",
            CallStatus::InvalidState => "invalid state",
            CallStatus::InvalidReference => "invalid reference",
            CallStatus::CallError => "call error",
            CallStatus::ExportNotFound => "export not found",
            CallStatus::StaleAsyncResult => "stale async result",
            CallStatus::ReentrancyViolation => "reentrancy violation",
            CallStatus::SessionStopped => "session stopped",
            CallStatus::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}
