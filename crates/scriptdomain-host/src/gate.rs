use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::error::BridgeError;

/// Admits calls into a session from one thread at a time
///
/// The thread that holds the gate may enter again (a script calling back
/// into its own session); any other thread is turned away until the
/// outermost call has returned.
#[derive(Debug, Default)]
pub(crate) struct CallGate {
    owner: Mutex<Option<(ThreadId, usize)>>,
}

/// Proof that the current thread holds the gate; releases on drop
#[derive(Debug)]
pub(crate) struct CallTicket<'a> {
    gate: &'a CallGate,
}

impl CallGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> Result<CallTicket<'_>, BridgeError> {
        let current = thread::current().id();
        let mut owner = self.owner.lock();

        match owner.as_mut() {
            None => *owner = Some((current, 1)),
            Some((thread, depth)) if *thread == current => *depth += 1,
            Some((thread, _)) => {
                return Err(BridgeError::Reentrancy(format!(
                    "session is in use by thread {:?}",
                    thread
                )));
            }
        }

        Ok(CallTicket { gate: self })
    }

    /// Whether a call on the current thread is inside the gate
    pub fn held_by_current_thread(&self) -> bool {
        let current = thread::current().id();
        matches!(*self.owner.lock(), Some((thread, _)) if thread == current)
    }
}

impl Drop for CallTicket<'_> {
    fn drop(&mut self) {
        let mut owner = self.gate.owner.lock();
        if let Some((_, depth)) = owner.as_mut() {
            *depth -= 1;
            if *depth == 0 {
                *owner = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_same_thread_reentry() {
        let gate = CallGate::new();
        assert!(!gate.held_by_current_thread());

        let outer = gate.enter().unwrap();
        let inner = gate.enter().unwrap();
        assert!(gate.held_by_current_thread());

        // Still held until the outermost ticket goes
        drop(inner);
        assert!(gate.held_by_current_thread());
        drop(outer);
        assert!(!gate.held_by_current_thread());
    }

    #[test]
    fn test_other_thread_is_rejected_while_held() {
        let gate = Arc::new(CallGate::new());
        let entered = Arc::new(Barrier::new(2));
        let checked = Arc::new(Barrier::new(2));

        let holder = {
            let gate = gate.clone();
            let entered = entered.clone();
            let checked = checked.clone();
            std::thread::spawn(move || {
                let _ticket = gate.enter().unwrap();
                entered.wait();
                checked.wait();
            })
        };

        entered.wait();
        assert!(!gate.held_by_current_thread());
        let rejected = gate.enter();
        assert!(matches!(rejected, Err(BridgeError::Reentrancy(_))));
        checked.wait();
        holder.join().unwrap();

        // Free again once the holder is gone
        assert!(gate.enter().is_ok());
    }
}
