//! Echo ledger
//!
//! The platform may deliver the event for one of our own writes after the
//! fan-out that caused it has already released its guard. The ledger
//! remembers each applied mutation for a short window so that late echo is
//! recognized and consumed exactly once.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::model::{ActionKind, GuildId, UserId};

type EchoKey = (GuildId, UserId, ActionKind);

/// Expected echoes of applied mutations, keyed by target guild
#[derive(Debug)]
pub struct EchoLedger {
    window: Duration,
    pending: Mutex<HashMap<EchoKey, Instant>>,
}

impl EchoLedger {
    /// A zero window disables the ledger
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EchoKey, Instant>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        !self.window.is_zero()
    }

    /// Remember that `kind` was applied to `subject` in `guild`
    pub fn record(&self, guild: GuildId, subject: UserId, kind: ActionKind) {
        if !self.is_enabled() {
            return;
        }
        let now = Instant::now();
        let mut pending = self.lock();
        pending.retain(|_, expires| *expires > now);
        pending.insert((guild, subject, kind), now + self.window);
    }

    /// Drop an entry whose mutation did not go through
    pub fn forget(&self, guild: GuildId, subject: UserId, kind: ActionKind) {
        self.lock().remove(&(guild, subject, kind));
    }

    /// Consume a matching unexpired entry
    ///
    /// Returns `true` when the event is our own echo.
    pub fn take(&self, guild: GuildId, subject: UserId, kind: ActionKind) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let now = Instant::now();
        let mut pending = self.lock();
        match pending.remove(&(guild, subject, kind)) {
            Some(expires) => expires > now,
            None => false,
        }
    }

    /// Number of remembered entries, expired ones included
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: GuildId = GuildId::new(2);
    const U: UserId = UserId::new(7);

    #[tokio::test]
    async fn echo_is_consumed_once() {
        let ledger = EchoLedger::new(Duration::from_secs(10));
        ledger.record(G, U, ActionKind::Ban);

        assert!(!ledger.take(G, U, ActionKind::Unban));
        assert!(!ledger.take(GuildId::new(3), U, ActionKind::Ban));
        assert!(ledger.take(G, U, ActionKind::Ban));
        assert!(!ledger.take(G, U, ActionKind::Ban));
    }

    #[tokio::test]
    async fn forgotten_entries_do_not_match() {
        let ledger = EchoLedger::new(Duration::from_secs(10));
        ledger.record(G, U, ActionKind::Unban);
        ledger.forget(G, U, ActionKind::Unban);
        assert!(!ledger.take(G, U, ActionKind::Unban));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let ledger = EchoLedger::new(Duration::from_secs(10));
        ledger.record(G, U, ActionKind::Mute);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!ledger.take(G, U, ActionKind::Mute));
        assert!(ledger.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn record_purges_expired_entries() {
        let ledger = EchoLedger::new(Duration::from_secs(5));
        ledger.record(G, U, ActionKind::Mute);
        tokio::time::advance(Duration::from_secs(6)).await;

        ledger.record(G, UserId::new(8), ActionKind::Ban);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn zero_window_disables() {
        let ledger = EchoLedger::new(Duration::ZERO);
        ledger.record(G, U, ActionKind::Ban);
        assert!(ledger.is_empty());
        assert!(!ledger.take(G, U, ActionKind::Ban));
    }
}
