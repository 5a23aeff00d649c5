//! Core moderation sync engine
//!
//! The ModSyncEngine is responsible for:
//! - Consuming platform events via EventSource
//! - Reporting the session state (connected guild count)
//! - Handing every moderation event to the Replicator
//! - Keeping fan-outs for different subjects independent
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐
//! │ EventSource │─── SourceEvent ───┐
//! └─────────────┘                   │
//!                                   ▼
//!                          ┌──────────────┐
//!                          │ModSyncEngine │
//!                          └──────────────┘
//!                                   │ spawn per event
//!                                   ▼
//!                          ┌──────────────┐
//!                          │  Replicator  │
//!                          └──────────────┘
//!                                   │
//!         ┌─────────────────────────┼──────────────────────────┐
//!         │                         │                          │
//!         ▼                         ▼                          ▼
//! ┌──────────────┐        ┌───────────────────┐        ┌─────────────┐
//! │ CascadeGuard │        │ModerationPlatform │        │  Reporter   │
//! │ (in flight)  │        │ (check + mutate)  │        │  (events)   │
//! └──────────────┘        └───────────────────┘        └─────────────┘
//! ```
//!
//! ## Concurrency
//!
//! Each moderation event is replicated on its own task, so a slow fan-out
//! never blocks receipt of the next event. Fan-outs for the same subject are
//! serialized by the cascade guard (the later one is dropped). On shutdown
//! the engine stops reading events and waits for running fan-outs to finish.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use crate::config::ModSyncConfig;
use crate::error::Result;
use crate::guard::CascadeGuard;
use crate::model::{ActionKind, GuildId, UserId};
use crate::replicator::{Replicator, TargetOutcome};
use crate::reporter::Reporter;
use crate::scope::MonitoredGuilds;
use crate::traits::{EventSource, ModerationPlatform, SourceEvent};

/// Why an incoming event did not start a fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    /// Origin guild is not monitored
    OutOfScope,
    /// Timeout change that is neither a mute nor an unmute
    NoTransition,
    /// Echo of a mutation this process applied
    Echo,
    /// A fan-out for the subject is already running
    InFlight,
}

/// Events emitted by the ModSyncEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Engine started
    Started { monitored_guilds: usize },

    /// Platform session ready
    Connected {
        account: String,
        connected_guilds: usize,
    },

    /// Connected guild count differs from the monitored set
    GuildCountMismatch { connected: usize, monitored: usize },

    /// Event did not start a fan-out
    EventDropped {
        guild: GuildId,
        subject: UserId,
        cause: DropCause,
    },

    /// Fan-out started
    FanOutStarted {
        origin: GuildId,
        subject: UserId,
        action: ActionKind,
        targets: usize,
    },

    /// One target finished (applied, skipped or failed)
    TargetCompleted {
        origin: GuildId,
        target: GuildId,
        subject: UserId,
        action: ActionKind,
        outcome: TargetOutcome,
    },

    /// Fan-out finished, guard released
    FanOutFinished {
        origin: GuildId,
        subject: UserId,
        action: ActionKind,
        applied: usize,
        skipped: usize,
        failed: usize,
    },

    /// Engine stopped
    Stopped { reason: String },
}

/// Core moderation sync engine
///
/// ## Lifecycle
///
/// 1. Create with [`ModSyncEngine::new()`]
/// 2. Start with [`ModSyncEngine::run()`]
/// 3. Engine runs until shutdown signal received or the source closes
/// 4. Running fan-outs are drained before `run` returns
pub struct ModSyncEngine {
    /// Event source for platform events
    source: Box<dyn EventSource>,

    /// Fan-out logic, shared with spawned tasks
    replicator: Arc<Replicator>,

    /// Outcome reporter
    reporter: Reporter,
}

impl ModSyncEngine {
    /// Create a new engine
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields engine events
    pub fn new(
        source: Box<dyn EventSource>,
        platform: Arc<dyn ModerationPlatform>,
        config: ModSyncConfig,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        Self::with_guard(source, platform, config, Arc::new(CascadeGuard::new()))
    }

    /// Create a new engine sharing an externally owned cascade guard
    pub fn with_guard(
        source: Box<dyn EventSource>,
        platform: Arc<dyn ModerationPlatform>,
        config: ModSyncConfig,
        guard: Arc<CascadeGuard>,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.validate()?;

        let (reporter, rx) = Reporter::channel(config.engine.event_channel_capacity);
        let guilds = MonitoredGuilds::new(config.guilds);
        let replicator = Replicator::new(platform, guilds, guard, reporter.clone(), config.engine);

        let engine = Self {
            source,
            replicator: Arc::new(replicator),
            reporter,
        };

        Ok((engine, rx))
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    /// Run the engine until Ctrl-C
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run the engine with a programmatic shutdown signal
    ///
    /// `None` falls back to Ctrl-C. A dropped sender counts as a shutdown
    /// request.
    pub async fn run_with_shutdown(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.reporter.started(self.replicator.guilds().len());
        info!("Watching events from {}", self.source.source_name());

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl-C: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
        };
        tokio::pin!(shutdown);

        let mut events = self.source.watch();
        let mut fan_outs = JoinSet::new();

        let reason = loop {
            tokio::select! {
                next = events.next() => match next {
                    Some(event) => self.dispatch(event, &mut fan_outs),
                    None => {
                        warn!("Event source {} closed", self.source.source_name());
                        break "Event source closed";
                    }
                },

                Some(joined) = fan_outs.join_next(), if !fan_outs.is_empty() => {
                    log_join_result(joined);
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break "Shutdown signal";
                }
            }
        };

        if !fan_outs.is_empty() {
            info!("Waiting for {} running fan-out(s) to finish", fan_outs.len());
        }
        while let Some(joined) = fan_outs.join_next().await {
            log_join_result(joined);
        }

        self.reporter.stopped(reason);
        Ok(())
    }

    fn dispatch(&self, event: SourceEvent, fan_outs: &mut JoinSet<()>) {
        match event {
            SourceEvent::Ready {
                account,
                guild_count,
            } => {
                self.reporter
                    .connected(&account, guild_count, self.replicator.guilds().len());
            }
            SourceEvent::Moderation(event) => {
                let replicator = Arc::clone(&self.replicator);
                fan_outs.spawn(async move {
                    replicator.replicate(&event).await;
                });
            }
        }
    }
}

/// A panicking fan-out is logged; the engine keeps running
fn log_join_result(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("A fan-out task panicked: {}", e);
        } else {
            warn!("A fan-out task was cancelled: {}", e);
        }
    }
}
