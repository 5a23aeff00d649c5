//! Cascade guard
//!
//! Every replicated ban or timeout is reported back by the platform as a
//! fresh moderation event on the target guild. The guard keeps one entry per
//! subject while its fan-out runs so those reports are dropped instead of
//! starting another fan-out.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::model::UserId;

/// Set of subjects with a fan-out in flight
///
/// Empty at construction. Only [`try_acquire`](Self::try_acquire),
/// [`acquire`](Self::acquire) and [`release`](Self::release) mutate it.
#[derive(Debug, Default)]
pub struct CascadeGuard {
    in_flight: Mutex<HashSet<UserId>>,
}

impl CascadeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<UserId>> {
        // The set stays consistent even if a holder panicked mid-insert.
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark the subject in flight
    ///
    /// Returns `false` without changing anything if it already was.
    pub fn try_acquire(&self, subject: UserId) -> bool {
        self.lock().insert(subject)
    }

    /// Clear the subject's in-flight mark; no-op if not held
    pub fn release(&self, subject: UserId) {
        self.lock().remove(&subject);
    }

    /// Acquire and get a ticket that releases the subject when dropped
    pub fn acquire(self: &Arc<Self>, subject: UserId) -> Option<InFlight> {
        self.try_acquire(subject).then(|| InFlight {
            guard: Arc::clone(self),
            subject,
        })
    }

    pub fn is_in_flight(&self, subject: UserId) -> bool {
        self.lock().contains(&subject)
    }

    /// Number of subjects currently in flight
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Held for the duration of one fan-out
#[derive(Debug)]
pub struct InFlight {
    guard: Arc<CascadeGuard>,
    subject: UserId,
}

impl InFlight {
    pub fn subject(&self) -> UserId {
        self.subject
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.guard.release(self.subject);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const U: UserId = UserId::new(7);

    #[test]
    fn second_acquire_is_refused() {
        let guard = CascadeGuard::new();
        assert!(guard.try_acquire(U));
        assert!(!guard.try_acquire(U));
        assert_eq!(guard.len(), 1);

        guard.release(U);
        assert!(guard.is_empty());
        assert!(guard.try_acquire(U));
    }

    #[test]
    fn release_when_not_held_is_noop() {
        let guard = CascadeGuard::new();
        guard.release(U);
        assert!(guard.is_empty());
    }

    #[test]
    fn subjects_are_independent() {
        let guard = CascadeGuard::new();
        assert!(guard.try_acquire(U));
        assert!(guard.try_acquire(UserId::new(8)));
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn ticket_releases_on_drop() {
        let guard = Arc::new(CascadeGuard::new());
        {
            let ticket = guard.acquire(U).expect("first acquire succeeds");
            assert_eq!(ticket.subject(), U);
            assert!(guard.is_in_flight(U));
            assert!(guard.acquire(U).is_none());
        }
        assert!(!guard.is_in_flight(U));
    }

    #[test]
    fn ticket_releases_on_panic() {
        let guard = Arc::new(CascadeGuard::new());
        let cloned = Arc::clone(&guard);
        let result = std::thread::spawn(move || {
            let _ticket = cloned.acquire(U).unwrap();
            panic!("fan-out blew up");
        })
        .join();

        assert!(result.is_err());
        assert!(guard.is_empty());
    }

    #[test]
    fn concurrent_acquire_has_one_winner() {
        let guard = Arc::new(CascadeGuard::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || guard.try_acquire(U))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
