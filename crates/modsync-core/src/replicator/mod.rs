//! Action replicator
//!
//! The fan-out: one in-scope moderation event becomes the equivalent
//! mutation on every other monitored guild.
//!
//! ## Event Flow
//!
//! 1. Drop events from guilds outside the monitored set
//! 2. Derive the action (timeout changes without a direction are dropped)
//! 3. Drop our own echoes recorded in the [`EchoLedger`]
//! 4. Acquire the [`CascadeGuard`] for the subject, or drop as re-entrant
//! 5. For each target in configuration order: capability check, then the
//!    mutation under a time bound with bounded retries for transient errors
//! 6. Report every outcome; the guard ticket drops on every exit path
//!
//! Per-target errors end up in the [`FanOutReport`] and are never returned
//! to the caller.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

use crate::capability::{self, Capability};
use crate::config::{EngineConfig, MAX_RETRY_AFTER};
use crate::echo::EchoLedger;
use crate::engine::DropCause;
use crate::error::{Error, Result};
use crate::guard::CascadeGuard;
use crate::model::{ActionKind, GuildId, ModerationAction, ModerationEvent, UserId};
use crate::reason;
use crate::reporter::Reporter;
use crate::scope::MonitoredGuilds;
use crate::traits::{BanRequest, Effect, ModerationPlatform};

/// Result of one target attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    SkippedUnavailable,
    SkippedNotAuthoritative(String),
    Applied,
    Failed(Error),
}

impl TargetOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            Self::SkippedUnavailable | Self::SkippedNotAuthoritative(_)
        )
    }
}

/// Every target outcome of one fan-out, in attempt order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutReport {
    pub origin: GuildId,
    pub subject: UserId,
    pub action: ActionKind,
    pub outcomes: Vec<(GuildId, TargetOutcome)>,
}

impl FanOutReport {
    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Applied))
    }

    pub fn skipped(&self) -> usize {
        self.count(TargetOutcome::is_skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Failed(_)))
    }

    /// Outcome recorded for a target, if it was attempted
    pub fn outcome_for(&self, target: GuildId) -> Option<&TargetOutcome> {
        self.outcomes
            .iter()
            .find(|(guild, _)| *guild == target)
            .map(|(_, outcome)| outcome)
    }

    fn count(&self, pred: impl Fn(&TargetOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

/// What happened to an incoming event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replication {
    Dropped(DropCause),
    Completed(FanOutReport),
}

impl Replication {
    pub fn report(&self) -> Option<&FanOutReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Dropped(_) => None,
        }
    }
}

/// Fans moderation actions out to the monitored guilds
pub struct Replicator {
    platform: Arc<dyn ModerationPlatform>,
    guilds: MonitoredGuilds,
    guard: Arc<CascadeGuard>,
    echoes: EchoLedger,
    reporter: Reporter,
    settings: EngineConfig,
}

impl Replicator {
    pub fn new(
        platform: Arc<dyn ModerationPlatform>,
        guilds: MonitoredGuilds,
        guard: Arc<CascadeGuard>,
        reporter: Reporter,
        settings: EngineConfig,
    ) -> Self {
        Self {
            platform,
            guilds,
            guard,
            echoes: EchoLedger::new(settings.echo_window()),
            reporter,
            settings,
        }
    }

    pub fn guilds(&self) -> &MonitoredGuilds {
        &self.guilds
    }

    pub fn guard(&self) -> &Arc<CascadeGuard> {
        &self.guard
    }

    pub fn echoes(&self) -> &EchoLedger {
        &self.echoes
    }

    /// Replicate one event to every other monitored guild
    pub async fn replicate(&self, event: &ModerationEvent) -> Replication {
        self.replicate_at(event, Utc::now()).await
    }

    /// Replicate with an explicit clock for the timeout direction
    pub async fn replicate_at(&self, event: &ModerationEvent, now: DateTime<Utc>) -> Replication {
        let origin = event.guild().id;
        let subject = event.subject().id;

        if !self.guilds.contains(origin) {
            return self.drop_event(event, DropCause::OutOfScope);
        }

        let Some(action) = event.action(now) else {
            return self.drop_event(event, DropCause::NoTransition);
        };
        let kind = action.kind();

        if self.echoes.take(origin, subject, kind) {
            return self.drop_event(event, DropCause::Echo);
        }

        let Some(_in_flight) = self.guard.acquire(subject) else {
            return self.drop_event(event, DropCause::InFlight);
        };

        let targets = self.guilds.targets_for(origin);
        self.reporter.fan_out_started(event, kind, targets.len());

        let reason = reason::synthesize(&action, event.guild());
        let mut report = FanOutReport {
            origin,
            subject,
            action: kind,
            outcomes: Vec::with_capacity(targets.len()),
        };

        for target in targets {
            let outcome = self.replicate_to(target, subject, &action, &reason).await;
            self.reporter.outcome(event, kind, target, &outcome);
            report.outcomes.push((target, outcome));
        }

        self.reporter.fan_out_finished(&report);
        Replication::Completed(report)
    }

    fn drop_event(&self, event: &ModerationEvent, cause: DropCause) -> Replication {
        self.reporter.dropped(event, cause);
        Replication::Dropped(cause)
    }

    /// One target: capability check, then the mutation
    async fn replicate_to(
        &self,
        target: GuildId,
        subject: UserId,
        action: &ModerationAction,
        reason: &str,
    ) -> TargetOutcome {
        let kind = action.kind();

        match capability::check(self.platform.as_ref(), target, subject, kind).await {
            Capability::Ok => {}
            Capability::Unavailable => return TargetOutcome::SkippedUnavailable,
            Capability::NotAuthoritative(why) => {
                return TargetOutcome::SkippedNotAuthoritative(why);
            }
            Capability::NotMember => {
                return TargetOutcome::Failed(Error::not_found(format!(
                    "user {} is not a member of guild {}",
                    subject, target
                )));
            }
        }

        // Recorded before the call: the platform may report our write before
        // the call returns.
        self.echoes.record(target, subject, kind);

        match self.apply_with_retry(target, subject, action, reason).await {
            Ok(Effect::Changed) => TargetOutcome::Applied,
            Ok(Effect::Unchanged) => {
                // Nothing changed, so no echo will arrive to consume the entry
                self.echoes.forget(target, subject, kind);
                TargetOutcome::Applied
            }
            Err(e) => {
                self.echoes.forget(target, subject, kind);
                TargetOutcome::Failed(e)
            }
        }
    }

    async fn apply_with_retry(
        &self,
        target: GuildId,
        subject: UserId,
        action: &ModerationAction,
        reason: &str,
    ) -> Result<Effect> {
        let timeout = self.settings.mutation_timeout();
        let mut attempt = 0;

        loop {
            let result =
                match tokio::time::timeout(timeout, self.apply_once(target, subject, action, reason))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(timeout)),
                };

            match result {
                Ok(effect) => return Ok(effect),
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    let delay = e
                        .retry_after()
                        .map(|wait| wait.min(MAX_RETRY_AFTER))
                        .unwrap_or_default()
                        .max(self.settings.retry_delay());
                    warn!(
                        target_guild = %target,
                        subject = %subject,
                        "{} attempt {} failed: {}. Retrying in {:?}",
                        action.kind(),
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A single platform call for the action
    async fn apply_once(
        &self,
        target: GuildId,
        subject: UserId,
        action: &ModerationAction,
        reason: &str,
    ) -> Result<Effect> {
        match action {
            ModerationAction::Ban { .. } => {
                let request = BanRequest {
                    delete_message_secs: self.settings.ban_delete_message_secs,
                    reason: reason.to_string(),
                };
                self.platform.create_ban(target, subject, &request).await
            }
            ModerationAction::Unban => self.platform.remove_ban(target, subject, reason).await,
            ModerationAction::Mute { until } => {
                self.platform
                    .set_communication_disabled_until(target, subject, Some(*until), reason)
                    .await
            }
            ModerationAction::Unmute => {
                self.platform
                    .set_communication_disabled_until(target, subject, None, reason)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_counts() {
        let report = FanOutReport {
            origin: GuildId::new(1),
            subject: UserId::new(9),
            action: ActionKind::Ban,
            outcomes: vec![
                (GuildId::new(2), TargetOutcome::Applied),
                (GuildId::new(3), TargetOutcome::SkippedUnavailable),
                (
                    GuildId::new(4),
                    TargetOutcome::SkippedNotAuthoritative("owner".into()),
                ),
                (GuildId::new(5), TargetOutcome::Failed(Error::http("502"))),
            ],
        };

        assert_eq!(report.applied(), 1);
        assert_eq!(report.skipped(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(
            report.outcome_for(GuildId::new(3)),
            Some(&TargetOutcome::SkippedUnavailable)
        );
        assert_eq!(report.outcome_for(GuildId::new(1)), None);
    }
}
