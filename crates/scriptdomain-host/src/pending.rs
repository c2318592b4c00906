use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use scriptdomain_api::{AsyncResultId, CallStatus};
use tokio::sync::oneshot;

use crate::error::BridgeError;
use crate::marshal::{CallMeta, CallReply, Payload};

/// Result delivered for an asynchronous export call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncResult {
    pub status: CallStatus,
    pub payload: Payload,
    pub game_time: u64,
    pub profiling: bool,
}

impl AsyncResult {
    /// Result standing in for a call that failed before the script answered
    pub fn from_error(err: &BridgeError, meta: CallMeta) -> Self {
        Self {
            status: err.status(),
            payload: Payload::from(err.diagnostic().into_bytes()),
            game_time: meta.game_time,
            profiling: meta.profiling,
        }
    }

    /// A failed result carries its diagnostic as the payload
    pub fn into_reply(self) -> CallReply {
        if self.status.is_success() {
            return CallReply::ok(self.payload);
        }
        CallReply {
            status: self.status,
            payload: None,
            diagnostic: Some(String::from_utf8_lossy(self.payload.as_bytes()).into_owned()),
        }
    }
}

/// What the waiting caller eventually receives
pub type AsyncCompletion = Result<AsyncResult, BridgeError>;

/// Where an asynchronous call came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOrigin {
    pub resource: String,
    pub export: String,
    pub game_time: u64,
}

/// Result of invoking an export
#[derive(Debug)]
pub enum ExportOutcome {
    /// The export returned immediately
    Ready(Payload),
    /// The export will complete later; the result arrives through the handle
    Pending(PendingExport),
}

impl ExportOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, ExportOutcome::Pending(_))
    }

    pub fn async_id(&self) -> Option<AsyncResultId> {
        match self {
            ExportOutcome::Ready(_) => None,
            ExportOutcome::Pending(pending) => Some(pending.async_id()),
        }
    }

    pub fn into_ready(self) -> Option<Payload> {
        match self {
            ExportOutcome::Ready(payload) => Some(payload),
            ExportOutcome::Pending(_) => None,
        }
    }

    pub fn into_pending(self) -> Option<PendingExport> {
        match self {
            ExportOutcome::Ready(_) => None,
            ExportOutcome::Pending(pending) => Some(pending),
        }
    }
}

/// Caller's side of an export call that returned pending
#[derive(Debug)]
pub struct PendingExport {
    async_id: AsyncResultId,
    receiver: oneshot::Receiver<AsyncCompletion>,
}

impl PendingExport {
    pub(crate) fn new(async_id: AsyncResultId, receiver: oneshot::Receiver<AsyncCompletion>) -> Self {
        Self { async_id, receiver }
    }

    pub fn async_id(&self) -> AsyncResultId {
        self.async_id
    }

    /// Poll for the result without blocking
    ///
    /// Returns `None` while the call is still outstanding. The result is
    /// handed out once.
    pub fn try_result(&mut self) -> Option<AsyncCompletion> {
        match self.receiver.try_recv() {
            Ok(completion) => Some(completion),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(BridgeError::SessionStopped)),
        }
    }

    /// Wait for the result
    pub async fn wait(self) -> AsyncCompletion {
        self.receiver
            .await
            .unwrap_or(Err(BridgeError::SessionStopped))
    }

    /// Wait for the result from outside an async runtime
    pub fn blocking_wait(self) -> AsyncCompletion {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(BridgeError::SessionStopped))
    }
}

struct PendingCall {
    origin: CallOrigin,
    completion: oneshot::Sender<AsyncCompletion>,
}

/// Correlation table for export calls awaiting a later result
///
/// Results may be delivered from any thread. Ids come from a monotonic
/// counter starting at 1 and are never reused.
pub struct PendingCalls {
    next_id: AtomicU64,
    calls: Mutex<HashMap<AsyncResultId, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate an id and start waiting for its result
    pub fn open(&self, origin: CallOrigin) -> (AsyncResultId, oneshot::Receiver<AsyncCompletion>) {
        let id = AsyncResultId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (completion, receiver) = oneshot::channel();
        self.calls
            .lock()
            .insert(id, PendingCall { origin, completion });
        (id, receiver)
    }

    /// Stop waiting for a call that finished synchronously
    pub fn discard(&self, id: AsyncResultId) -> bool {
        self.calls.lock().remove(&id).is_some()
    }

    /// Complete a waiting call exactly once
    ///
    /// Returns the origin of the completed call. A caller that stopped
    /// listening does not make the delivery stale.
    pub fn complete(
        &self,
        id: AsyncResultId,
        completion: AsyncCompletion,
    ) -> Result<CallOrigin, BridgeError> {
        let call = self
            .calls
            .lock()
            .remove(&id)
            .ok_or(BridgeError::StaleAsyncResult(id))?;
        let _ = call.completion.send(completion);
        Ok(call.origin)
    }

    /// Fail every waiting call with the same error, returning how many there were
    pub fn fail_all(&self, error: BridgeError) -> usize {
        let drained: Vec<PendingCall> = self.calls.lock().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            let _ = call.completion.send(Err(error.clone()));
        }
        count
    }

    pub fn contains(&self, id: AsyncResultId) -> bool {
        self.calls.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending exports a script started and is waiting on
///
/// Completions are collected by the session that made the call and handed to
/// its script on that session's next tick.
#[derive(Default)]
pub struct AwaitedResults {
    waiting: Mutex<Vec<PendingExport>>,
}

impl AwaitedResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, pending: PendingExport) {
        self.waiting.lock().push(pending);
    }

    /// Remove and return every result that has arrived, in call order
    pub fn take_completed(&self) -> Vec<(AsyncResultId, AsyncCompletion)> {
        let mut waiting = self.waiting.lock();
        let mut completed = Vec::new();
        waiting.retain_mut(|pending| match pending.try_result() {
            Some(completion) => {
                completed.push((pending.async_id(), completion));
                false
            }
            None => true,
        });
        completed
    }

    /// Stop waiting, returning how many results were still outstanding
    pub fn clear(&self) -> usize {
        self.waiting.lock().drain(..).count()
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> CallOrigin {
        CallOrigin {
            resource: "res".to_string(),
            export: "fetch".to_string(),
            game_time: 10,
        }
    }

    fn result(payload: &str) -> AsyncResult {
        AsyncResult {
            status: CallStatus::Ok,
            payload: Payload::from(payload),
            game_time: 20,
            profiling: false,
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let pending = PendingCalls::new();
        let (a, _) = pending.open(origin());
        let (b, _) = pending.open(origin());
        pending.discard(a);
        let (c, _) = pending.open(origin());

        assert_eq!(a, AsyncResultId(1));
        assert!(b > a && c > b);
    }

    #[test]
    fn test_complete_exactly_once() {
        let pending = PendingCalls::new();
        let (id, mut receiver) = pending.open(origin());

        assert_eq!(pending.complete(id, Ok(result("done"))), Ok(origin()));
        assert_eq!(receiver.try_recv().unwrap(), Ok(result("done")));

        assert_eq!(
            pending.complete(id, Ok(result("again"))),
            Err(BridgeError::StaleAsyncResult(id))
        );
    }

    #[test]
    fn test_unknown_id_is_stale_and_leaves_others_alone() {
        let pending = PendingCalls::new();
        let (id, _receiver) = pending.open(origin());

        let stale = AsyncResultId(999);
        assert_eq!(
            pending.complete(stale, Ok(result("x"))),
            Err(BridgeError::StaleAsyncResult(stale))
        );
        assert!(pending.contains(id));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_dropped_receiver_still_consumes() {
        let pending = PendingCalls::new();
        let (id, receiver) = pending.open(origin());
        drop(receiver);

        assert!(pending.complete(id, Ok(result("late"))).is_ok());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_fail_all() {
        let pending = PendingCalls::new();
        let (_, mut first) = pending.open(origin());
        let (_, mut second) = pending.open(origin());

        assert_eq!(pending.fail_all(BridgeError::SessionStopped), 2);
        assert_eq!(first.try_recv().unwrap(), Err(BridgeError::SessionStopped));
        assert_eq!(second.try_recv().unwrap(), Err(BridgeError::SessionStopped));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_delivery_from_another_thread() {
        let pending = std::sync::Arc::new(PendingCalls::new());
        let (id, receiver) = pending.open(origin());

        let remote = pending.clone();
        std::thread::spawn(move || remote.complete(id, Ok(result("remote"))))
            .join()
            .unwrap()
            .unwrap();

        assert_eq!(receiver.blocking_recv().unwrap(), Ok(result("remote")));
    }

    #[test]
    fn test_awaited_results_hand_out_arrivals_only() {
        let pending = PendingCalls::new();
        let awaited = AwaitedResults::new();
        let (first, receiver) = pending.open(origin());
        awaited.push(PendingExport::new(first, receiver));
        let (second, receiver) = pending.open(origin());
        awaited.push(PendingExport::new(second, receiver));

        assert!(awaited.take_completed().is_empty());

        pending.complete(second, Ok(result("second"))).unwrap();
        assert_eq!(awaited.take_completed(), vec![(second, Ok(result("second")))]);
        assert_eq!(awaited.len(), 1);

        // A callee that goes away completes the wait with SessionStopped
        pending.fail_all(BridgeError::SessionStopped);
        assert_eq!(
            awaited.take_completed(),
            vec![(first, Err(BridgeError::SessionStopped))]
        );
        assert!(awaited.is_empty());
    }

    #[test]
    fn test_failed_result_reply_carries_diagnostic() {
        let err = BridgeError::call(crate::marshal::Operation::InvokeExport, "no route");
        let failed = AsyncResult::from_error(&err, CallMeta::new(40, false));
        assert_eq!(failed.game_time, 40);

        let reply = failed.into_reply();
        assert_eq!(reply.status, CallStatus::CallError);
        assert!(reply.payload.is_none());
        assert_eq!(reply.diagnostic.as_deref(), Some("no route"));

        assert_eq!(result("fine").into_reply(), CallReply::ok(Payload::from("fine")));
    }
}
