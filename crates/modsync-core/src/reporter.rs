//! Outcome reporter
//!
//! Turns replication progress into `tracing` lines and [`EngineEvent`]s.
//! Reporting never fails: a full monitoring channel drops the event with a
//! warning and replication carries on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, trace, warn};

use crate::engine::{DropCause, EngineEvent};
use crate::model::{ActionKind, GuildId, ModerationEvent};
use crate::replicator::{FanOutReport, TargetOutcome};

/// Sink for replication outcomes
#[derive(Debug, Clone)]
pub struct Reporter {
    event_tx: mpsc::Sender<EngineEvent>,
    /// Set once the receiving end is gone; shared by clones
    receiver_gone: Arc<AtomicBool>,
}

impl Reporter {
    pub fn new(event_tx: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            event_tx,
            receiver_gone: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a reporter and the receiving end of its event channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn started(&self, monitored: usize) {
        info!("Moderation sync engine started for {} guild(s)", monitored);
        self.emit(EngineEvent::Started {
            monitored_guilds: monitored,
        });
    }

    /// Session ready; warns when the connected guild count differs from the monitored set
    pub fn connected(&self, account: &str, connected: usize, monitored: usize) {
        info!("Connected as \"{}\"", account);
        self.emit(EngineEvent::Connected {
            account: account.to_string(),
            connected_guilds: connected,
        });

        if connected != monitored {
            warn!(
                "Currently in {} guilds, but only {} are registered in the configuration",
                connected, monitored
            );
            self.emit(EngineEvent::GuildCountMismatch {
                connected,
                monitored,
            });
        }
    }

    pub fn dropped(&self, event: &ModerationEvent, cause: DropCause) {
        let guild = event.guild().id;
        let subject = event.subject().id;
        match cause {
            DropCause::OutOfScope | DropCause::NoTransition => {
                trace!(guild = %guild, subject = %subject, ?cause, "event ignored");
            }
            DropCause::Echo | DropCause::InFlight => {
                debug!(guild = %guild, subject = %subject, ?cause, "event suppressed");
            }
        }
        self.emit(EngineEvent::EventDropped {
            guild,
            subject,
            cause,
        });
    }

    pub fn fan_out_started(&self, event: &ModerationEvent, action: ActionKind, targets: usize) {
        info!(
            origin = %event.guild().id,
            subject = %event.subject().id,
            action = %action,
            "{} in \"{}\" for {}, syncing to {} guild(s)...",
            action,
            event.guild().label(),
            event.subject(),
            targets
        );
        self.emit(EngineEvent::FanOutStarted {
            origin: event.guild().id,
            subject: event.subject().id,
            action,
            targets,
        });
    }

    /// Report the outcome for one target
    pub fn outcome(
        &self,
        event: &ModerationEvent,
        action: ActionKind,
        target: GuildId,
        outcome: &TargetOutcome,
    ) {
        let origin = event.guild().id;
        let subject = event.subject().id;

        match outcome {
            TargetOutcome::SkippedUnavailable => {
                warn!(
                    origin = %origin,
                    target_guild = %target,
                    subject = %subject,
                    action = %action,
                    "Guild {} is unavailable, skipping",
                    target
                );
            }
            TargetOutcome::SkippedNotAuthoritative(why) => {
                warn!(
                    origin = %origin,
                    target_guild = %target,
                    subject = %subject,
                    action = %action,
                    "Can't {} {} in guild {}: {}",
                    action,
                    event.subject(),
                    target,
                    why
                );
            }
            TargetOutcome::Applied => {
                info!(
                    origin = %origin,
                    target_guild = %target,
                    subject = %subject,
                    action = %action,
                    "Applied {} for {} in guild {}",
                    action,
                    event.subject(),
                    target
                );
            }
            TargetOutcome::Failed(e) => {
                error!(
                    origin = %origin,
                    target_guild = %target,
                    subject = %subject,
                    action = %action,
                    "Failed to {} {} in guild {}: {}",
                    action,
                    event.subject(),
                    target,
                    e
                );
            }
        }

        self.emit(EngineEvent::TargetCompleted {
            origin,
            target,
            subject,
            action,
            outcome: outcome.clone(),
        });
    }

    pub fn fan_out_finished(&self, report: &FanOutReport) {
        info!(
            origin = %report.origin,
            subject = %report.subject,
            action = %report.action,
            "Sync finished: {} applied, {} skipped, {} failed",
            report.applied(),
            report.skipped(),
            report.failed()
        );
        self.emit(EngineEvent::FanOutFinished {
            origin: report.origin,
            subject: report.subject,
            action: report.action,
            applied: report.applied(),
            skipped: report.skipped(),
            failed: report.failed(),
        });
    }

    pub fn stopped(&self, reason: &str) {
        info!("Moderation sync engine stopped: {}", reason);
        self.emit(EngineEvent::Stopped {
            reason: reason.to_string(),
        });
    }

    /// Emit an engine event without ever blocking
    fn emit(&self, event: EngineEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Event channel full, dropping engine event. Consider increasing event_channel_capacity.");
            }
            Err(TrySendError::Closed(_)) => {
                if !self.receiver_gone.swap(true, Ordering::Relaxed) {
                    debug!("Engine event receiver dropped, no longer publishing engine events");
                }
            }
        }
    }
}
