//! Request/response contract for calls across the script boundary.
//!
//! Every call into an embedded context carries opaque byte buffers plus a
//! [`CallMeta`]. Whatever the context does, the result is folded back into a
//! `Result<_, BridgeError>` here: errors and panics raised by the context are
//! caught and become [`BridgeError::Call`].

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use scriptdomain_api::{AsyncResultId, CallStatus};
use strum_macros::Display;

use crate::error::BridgeError;

/// Host-facing operation, used for diagnostics and fault attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    Initialize,
    Tick,
    TriggerEvent,
    CallRef,
    DuplicateRef,
    RemoveRef,
    InvokeExport,
    AsyncResult,
    MemoryUsage,
    StartProfiling,
    StopProfiling,
    SetBreakpoints,
}

/// Game time and profiling flag that accompany every call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallMeta {
    /// Monotonic host game time in milliseconds
    pub game_time: u64,
    /// Whether the host is collecting a profile for this call
    pub profiling: bool,
}

impl CallMeta {
    pub fn new(game_time: u64, profiling: bool) -> Self {
        Self {
            game_time,
            profiling,
        }
    }

    /// Meta for a call made with profiling disabled
    pub fn at(game_time: u64) -> Self {
        Self::new(game_time, false)
    }
}

/// Opaque, immutable byte buffer handed across the boundary
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Payload(Arc<[u8]>);

impl Payload {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload(bytes.into())
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload(bytes.into())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload(text.as_bytes().into())
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Named event delivered to a context
#[derive(Debug, Clone, Copy)]
pub struct EventCall<'a> {
    pub name: &'a str,
    pub args: &'a [u8],
    /// Originating actor, for attribution only
    pub source: &'a str,
    pub meta: CallMeta,
}

/// Invocation of an engine-side reference
#[derive(Debug, Clone, Copy)]
pub struct RefCall<'a> {
    /// Engine-side id; never the host handle
    pub engine_ref: i32,
    pub args: &'a [u8],
    pub meta: CallMeta,
}

/// Invocation of a registered export binding
#[derive(Debug, Clone, Copy)]
pub struct ExportCall<'a> {
    pub private_id: u64,
    pub binding: u64,
    pub args: &'a [u8],
    /// Id the context must use if it completes the call later
    pub async_id: AsyncResultId,
    pub meta: CallMeta,
}

/// What an export binding produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportReply {
    /// Result is available now
    Ready(Payload),
    /// Result will arrive through `deliver_async_result` with the call's async id
    Pending,
    /// The export ran and reported a failure status
    Failed {
        status: CallStatus,
        diagnostic: Option<String>,
    },
}

/// Wire form of a finished call: status plus either result or diagnostic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReply {
    pub status: CallStatus,
    pub payload: Option<Payload>,
    pub diagnostic: Option<String>,
}

impl CallReply {
    pub fn ok(payload: Payload) -> Self {
        Self {
            status: CallStatus::Ok,
            payload: Some(payload),
            diagnostic: None,
        }
    }

    pub fn from_error(err: &BridgeError) -> Self {
        Self {
            status: err.status(),
            payload: None,
            diagnostic: Some(err.diagnostic()),
        }
    }

    pub fn from_result(result: Result<Payload, BridgeError>) -> Self {
        match result {
            Ok(payload) => Self::ok(payload),
            Err(err) => Self::from_error(&err),
        }
    }
}

/// Run one call into an embedded context, converting every fault into a
/// [`BridgeError`]
///
/// Errors already expressed as `BridgeError` (for example a reentrancy
/// rejection raised by the context through its host bridge) pass through
/// unchanged; anything else becomes a call error carrying the full context
/// chain.
pub(crate) fn guarded<T>(
    operation: Operation,
    call: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T, BridgeError> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(match err.downcast::<BridgeError>() {
            Ok(bridge_err) => bridge_err,
            Err(err) => BridgeError::call(operation, format!("{err:#}")),
        }),
        Err(panic) => Err(BridgeError::call(
            operation,
            format!("script panicked: {}", panic_message(panic.as_ref())),
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_passes_values_through() {
        let value = guarded(Operation::Tick, || Ok(7));
        assert_eq!(value, Ok(7));
    }

    #[test]
    fn test_guarded_converts_errors() {
        let result: Result<(), _> = guarded(Operation::CallRef, || {
            Err(anyhow::anyhow!("inner").context("outer"))
        });
        match result {
            Err(BridgeError::Call {
                operation,
                diagnostic,
                ..
            }) => {
                assert_eq!(operation, Operation::CallRef);
                assert_eq!(diagnostic, "outer: inner");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_guarded_keeps_bridge_errors() {
        let result: Result<(), _> = guarded(Operation::InvokeExport, || {
            Err(BridgeError::Reentrancy("busy".into()).into())
        });
        assert_eq!(result, Err(BridgeError::Reentrancy("busy".into())));
    }

    #[test]
    fn test_guarded_catches_panics() {
        let result: Result<(), _> = guarded(Operation::TriggerEvent, || panic!("script blew up"));
        let err = result.unwrap_err();
        assert_eq!(err.status(), CallStatus::CallError);
        assert!(err.diagnostic().contains("script blew up"));
    }

    #[test]
    fn test_call_reply_from_error() {
        let reply = CallReply::from_result(Err(BridgeError::SessionStopped));
        assert_eq!(reply.status, CallStatus::SessionStopped);
        assert!(reply.payload.is_none());
        assert_eq!(reply.diagnostic.as_deref(), Some("session stopped"));
    }
}
