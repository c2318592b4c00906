//! Tick scheduling for runtime domain sessions.
//!
//! A session keeps a single wake-up registered with an external bookmark
//! host. Scripts may ask to run again many times per tick; those requests are
//! folded into the earliest one and registered once when the tick returns.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use scriptdomain_api::SessionId;
use thiserror::Error;
use tracing::{debug, error};

use crate::error::BridgeError;

/// Scheduling is requested in milliseconds and registered in microseconds
pub const MICROS_PER_MILLI: u64 = 1000;

/// Priority used for every tick bookmark
pub const TICK_PRIORITY: i32 = 0;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("bookmark host rejected session {session}: {reason}")]
pub struct BookmarkError {
    pub session: SessionId,
    pub reason: String,
}

/// External scheduler that gives a session control again at a given time
pub trait BookmarkHost: Send + Sync {
    /// Register the next wake-up for `session`, replacing any earlier one
    ///
    /// `when_us` is an absolute microsecond timestamp. Implementations must
    /// not call back into the session.
    fn schedule_bookmark(
        &self,
        session: SessionId,
        priority: i32,
        when_us: i64,
    ) -> Result<(), BookmarkError>;
}

#[derive(Debug, Default)]
struct WakeState {
    /// Wake time currently registered with the bookmark host
    registered: Option<u64>,
    /// Earliest request made during the tick in flight
    batched: Option<u64>,
    in_tick: bool,
    /// Registration failure the script did not hand back
    fault: Option<String>,
}

/// Coalesces tick requests into one registered bookmark per session
pub struct TickScheduler {
    session: SessionId,
    host: Arc<dyn BookmarkHost>,
    state: Mutex<WakeState>,
}

impl TickScheduler {
    pub fn new(session: SessionId, host: Arc<dyn BookmarkHost>) -> Self {
        Self {
            session,
            host,
            state: Mutex::new(WakeState::default()),
        }
    }

    /// Ask to run again no later than `time_ms`
    ///
    /// Returns whether a bookmark was registered. During a tick the request
    /// is only batched and `false` is returned.
    pub fn request(&self, time_ms: u64) -> Result<bool, BridgeError> {
        let mut state = self.state.lock();

        if state.in_tick {
            state.batched = Some(state.batched.map_or(time_ms, |t| t.min(time_ms)));
            return Ok(false);
        }

        self.register_if_earlier(&mut state, time_ms)
    }

    /// Wake time currently registered with the bookmark host
    pub fn scheduled(&self) -> Option<u64> {
        self.state.lock().registered
    }

    /// Mark the start of a tick at `game_time`
    ///
    /// A registered wake time that has been reached is considered fired and
    /// is cleared, so the next request registers again. A wake time still in
    /// the future is kept.
    pub(crate) fn begin_tick(&self, game_time: u64) {
        let mut state = self.state.lock();
        if state.registered.is_some_and(|t| t <= game_time) {
            state.registered = None;
        }
        state.in_tick = true;
        state.batched = None;
    }

    /// Mark the end of a tick and register the earliest batched request
    pub(crate) fn end_tick(&self) -> Result<bool, BridgeError> {
        let mut state = self.state.lock();
        state.in_tick = false;

        match state.batched.take() {
            Some(time_ms) => self.register_if_earlier(&mut state, time_ms),
            None => Ok(false),
        }
    }

    /// Forget every request; used at teardown
    pub(crate) fn reset(&self) {
        *self.state.lock() = WakeState::default();
    }

    /// Keep a registration failure a script could not hand back, so the call
    /// it happened in reports it. The first failure wins.
    pub(crate) fn record_fault(&self, fault: String) {
        self.state.lock().fault.get_or_insert(fault);
    }

    /// Registration failure recorded while the failure could not be returned
    pub(crate) fn take_fault(&self) -> Option<String> {
        self.state.lock().fault.take()
    }

    fn register_if_earlier(
        &self,
        state: &mut WakeState,
        time_ms: u64,
    ) -> Result<bool, BridgeError> {
        if state.registered.is_some_and(|t| time_ms >= t) {
            return Ok(false);
        }

        let when_us = time_ms
            .checked_mul(MICROS_PER_MILLI)
            .and_then(|us| i64::try_from(us).ok())
            .unwrap_or(i64::MAX);

        match self
            .host
            .schedule_bookmark(self.session, TICK_PRIORITY, when_us)
        {
            Ok(()) => {
                debug!(target: "runtime", "Session {} wakes at {}ms", self.session, time_ms);
                state.registered = Some(time_ms);
                Ok(true)
            }
            Err(e) => {
                // The previous registration is still the one the host holds
                error!(target: "runtime", "Failed to schedule tick for session {}: {}", self.session, e);
                Err(BridgeError::Initialization(e.to_string()))
            }
        }
    }
}

/// In-process bookmark host
///
/// Holds at most one wake-up per session; scheduling again replaces the
/// previous entry. Non-positive timestamps are due immediately.
#[derive(Default)]
pub struct BookmarkQueue {
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    wakes: HashMap<SessionId, i64>,
    order: BinaryHeap<Reverse<(i64, Reverse<i32>, SessionId)>>,
}

impl BookmarkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop every session whose wake time is at or before `now_us`, earliest first
    pub fn due(&self, now_us: i64) -> Vec<SessionId> {
        let mut state = self.state.lock();
        let mut fired = Vec::new();

        while let Some(Reverse((when, _, session))) = state.order.peek().copied() {
            if when > now_us {
                break;
            }
            state.order.pop();

            // Entries superseded by a later registration are skipped
            if state.wakes.get(&session) == Some(&when) {
                state.wakes.remove(&session);
                fired.push(session);
            }
        }

        fired
    }

    /// Earliest outstanding wake time
    pub fn next_wake(&self) -> Option<i64> {
        self.state.lock().wakes.values().copied().min()
    }

    /// Wake time registered for a session
    pub fn wake_of(&self, session: SessionId) -> Option<i64> {
        self.state.lock().wakes.get(&session).copied()
    }

    /// Drop any wake-up for a session
    pub fn cancel(&self, session: SessionId) -> bool {
        self.state.lock().wakes.remove(&session).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().wakes.len()
    }
}

impl BookmarkHost for BookmarkQueue {
    fn schedule_bookmark(
        &self,
        session: SessionId,
        priority: i32,
        when_us: i64,
    ) -> Result<(), BookmarkError> {
        let when_us = when_us.max(0);
        let mut state = self.state.lock();
        state.wakes.insert(session, when_us);
        state
            .order
            .push(Reverse((when_us, Reverse(priority), session)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingHost {
        calls: Mutex<Vec<(SessionId, i32, i64)>>,
        reject: AtomicBool,
    }

    impl BookmarkHost for RecordingHost {
        fn schedule_bookmark(
            &self,
            session: SessionId,
            priority: i32,
            when_us: i64,
        ) -> Result<(), BookmarkError> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(BookmarkError {
                    session,
                    reason: "scheduler offline".to_string(),
                });
            }
            self.calls.lock().push((session, priority, when_us));
            Ok(())
        }
    }

    fn scheduler() -> (TickScheduler, Arc<RecordingHost>) {
        let host = Arc::new(RecordingHost::default());
        (TickScheduler::new(SessionId(1), host.clone()), host)
    }

    #[test]
    fn test_first_request_registers_in_microseconds() {
        let (scheduler, host) = scheduler();
        assert_eq!(scheduler.request(100), Ok(true));
        assert_eq!(*host.calls.lock(), vec![(SessionId(1), 0, 100_000)]);
        assert_eq!(scheduler.scheduled(), Some(100));
    }

    #[test]
    fn test_later_request_is_noop() {
        let (scheduler, host) = scheduler();
        scheduler.request(50).unwrap();
        assert_eq!(scheduler.request(100), Ok(false));
        assert_eq!(scheduler.request(50), Ok(false));
        assert_eq!(host.calls.lock().len(), 1);
        assert_eq!(scheduler.scheduled(), Some(50));
    }

    #[test]
    fn test_earlier_request_replaces() {
        let (scheduler, host) = scheduler();
        scheduler.request(100).unwrap();
        assert_eq!(scheduler.request(40), Ok(true));
        assert_eq!(host.calls.lock().last(), Some(&(SessionId(1), 0, 40_000)));
        assert_eq!(scheduler.scheduled(), Some(40));
    }

    #[test]
    fn test_requests_within_tick_register_once_at_minimum() {
        let (scheduler, host) = scheduler();

        scheduler.begin_tick(0);
        for time in [100, 50, 75, 300] {
            assert_eq!(scheduler.request(time), Ok(false));
        }
        assert!(host.calls.lock().is_empty());

        assert_eq!(scheduler.end_tick(), Ok(true));
        assert_eq!(*host.calls.lock(), vec![(SessionId(1), 0, 50_000)]);
    }

    #[test]
    fn test_pending_wake_survives_early_tick() {
        let (scheduler, host) = scheduler();
        scheduler.request(30).unwrap();

        // Host ticks before the wake time; the bookmark is still outstanding
        scheduler.begin_tick(10);
        scheduler.request(50).unwrap();
        assert_eq!(scheduler.end_tick(), Ok(false));

        assert_eq!(scheduler.scheduled(), Some(30));
        assert_eq!(host.calls.lock().len(), 1);
    }

    #[test]
    fn test_fired_wake_is_cleared_on_tick_entry() {
        let (scheduler, host) = scheduler();
        scheduler.request(30).unwrap();

        scheduler.begin_tick(30);
        assert_eq!(scheduler.scheduled(), None);
        scheduler.request(80).unwrap();
        assert_eq!(scheduler.end_tick(), Ok(true));

        assert_eq!(scheduler.scheduled(), Some(80));
        assert_eq!(host.calls.lock().len(), 2);
    }

    #[test]
    fn test_rejected_registration_is_fatal_and_keeps_previous() {
        let (scheduler, host) = scheduler();
        scheduler.request(100).unwrap();

        host.reject.store(true, Ordering::SeqCst);
        let err = scheduler.request(10).unwrap_err();
        assert!(matches!(err, BridgeError::Initialization(_)));
        assert_eq!(scheduler.scheduled(), Some(100));
        // Returned directly, so nothing is left over for a later call
        assert!(scheduler.take_fault().is_none());
    }

    #[test]
    fn test_recorded_fault_is_taken_once() {
        let (scheduler, _) = scheduler();
        scheduler.record_fault("first".to_string());
        scheduler.record_fault("second".to_string());

        assert_eq!(scheduler.take_fault().as_deref(), Some("first"));
        assert!(scheduler.take_fault().is_none());
    }

    #[test]
    fn test_queue_pops_due_sessions_in_order() {
        let queue = BookmarkQueue::new();
        queue.schedule_bookmark(SessionId(1), 0, 300).unwrap();
        queue.schedule_bookmark(SessionId(2), 0, 100).unwrap();
        queue.schedule_bookmark(SessionId(3), 0, 900).unwrap();

        assert_eq!(queue.next_wake(), Some(100));
        assert_eq!(queue.due(500), vec![SessionId(2), SessionId(1)]);
        assert_eq!(queue.pending_count(), 1);
        assert!(queue.due(500).is_empty());
    }

    #[test]
    fn test_queue_keeps_one_wake_per_session() {
        let queue = BookmarkQueue::new();
        queue.schedule_bookmark(SessionId(1), 0, 1_000).unwrap();
        queue.schedule_bookmark(SessionId(1), 0, 200).unwrap();

        assert_eq!(queue.wake_of(SessionId(1)), Some(200));
        assert_eq!(queue.due(2_000), vec![SessionId(1)]);
    }

    #[test]
    fn test_queue_cancel() {
        let queue = BookmarkQueue::new();
        queue.schedule_bookmark(SessionId(4), 0, 10).unwrap();
        assert!(queue.cancel(SessionId(4)));
        assert!(!queue.cancel(SessionId(4)));
        assert!(queue.due(100).is_empty());
    }
}
