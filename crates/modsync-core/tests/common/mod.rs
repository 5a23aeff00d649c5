//! Test doubles and common utilities for replication contract tests
//!
//! This module provides minimal test doubles that record what the engine
//! asks of the platform without talking to one.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use modsync_core::config::{EngineConfig, ModSyncConfig};
use modsync_core::error::{Error, Result};
use modsync_core::traits::{
    Authority, BanRequest, Effect, EventSource, ModerationPlatform, SourceEvent,
};
use modsync_core::{
    ActionKind, CascadeGuard, EngineEvent, GuildId, GuildRef, ModerationEvent, MonitoredGuilds,
    Replicator, Reporter, Subject, UserId,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::Stream;

pub const A: GuildId = GuildId::new(1001);
pub const B: GuildId = GuildId::new(1002);
pub const C: GuildId = GuildId::new(1003);
pub const D: GuildId = GuildId::new(1004);
pub const OUTSIDER: GuildId = GuildId::new(9999);

pub const U: UserId = UserId::new(42);
pub const V: UserId = UserId::new(43);

/// Display names used for reason strings
pub fn guild_ref(id: GuildId) -> GuildRef {
    let name = match id {
        A => "A",
        B => "B",
        C => "C",
        D => "D",
        _ => "Outsider",
    };
    GuildRef::named(id, name)
}

pub fn ban_added(origin: GuildId, subject: UserId, reason: Option<&str>) -> ModerationEvent {
    ModerationEvent::BanAdded {
        guild: guild_ref(origin),
        subject: Subject::tagged(subject, "someone#0001"),
        reason: reason.map(str::to_string),
    }
}

pub fn ban_removed(origin: GuildId, subject: UserId) -> ModerationEvent {
    ModerationEvent::BanRemoved {
        guild: guild_ref(origin),
        subject: Subject::new(subject),
    }
}

pub fn timeout_changed(
    origin: GuildId,
    subject: UserId,
    previous_until: Option<DateTime<Utc>>,
    new_until: Option<DateTime<Utc>>,
) -> ModerationEvent {
    ModerationEvent::TimeoutChanged {
        guild: guild_ref(origin),
        subject: Subject::new(subject),
        previous_until,
        new_until,
    }
}

/// A point comfortably in the future
pub fn in_one_hour() -> DateTime<Utc> {
    Utc::now() + ChronoDuration::hours(1)
}

/// What the platform was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
    CreateBan { delete_message_secs: u32 },
    RemoveBan,
    SetTimeout { until: Option<DateTime<Utc>> },
}

impl CallKind {
    pub fn action(&self) -> ActionKind {
        match self {
            CallKind::CreateBan { .. } => ActionKind::Ban,
            CallKind::RemoveBan => ActionKind::Unban,
            CallKind::SetTimeout { until: Some(_) } => ActionKind::Mute,
            CallKind::SetTimeout { until: None } => ActionKind::Unmute,
        }
    }
}

/// One recorded mutation call
#[derive(Debug, Clone)]
pub struct Call {
    pub guild: GuildId,
    pub subject: UserId,
    pub kind: CallKind,
    pub reason: String,
    /// Whether the observed guard had the subject in flight during the call
    pub subject_in_flight: Option<bool>,
}

/// How a guild's mutation calls behave
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    /// Succeed without changing anything (already banned, not muted)
    SucceedUnchanged,
    Fail(Error),
    /// Fail with these errors first, then succeed
    FailThenSucceed(VecDeque<Error>),
    Hang,
}

/// A platform double that records every call
pub struct RecordingPlatform {
    calls: Mutex<Vec<Call>>,
    attempts: AtomicUsize,
    unavailable: Mutex<HashSet<GuildId>>,
    authority: Mutex<HashMap<GuildId, Authority>>,
    authority_errors: Mutex<HashSet<GuildId>>,
    behavior: Mutex<HashMap<GuildId, Behavior>>,
    observed_guard: Mutex<Option<Arc<CascadeGuard>>>,
    gate_tx: watch::Sender<bool>,
    gate_rx: watch::Receiver<bool>,
}

impl RecordingPlatform {
    pub fn new() -> Arc<Self> {
        let (gate_tx, gate_rx) = watch::channel(true);
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            unavailable: Mutex::new(HashSet::new()),
            authority: Mutex::new(HashMap::new()),
            authority_errors: Mutex::new(HashSet::new()),
            behavior: Mutex::new(HashMap::new()),
            observed_guard: Mutex::new(None),
            gate_tx,
            gate_rx,
        })
    }

    pub fn set_unavailable(&self, guild: GuildId) {
        self.unavailable.lock().unwrap().insert(guild);
    }

    pub fn set_authority(&self, guild: GuildId, authority: Authority) {
        self.authority.lock().unwrap().insert(guild, authority);
    }

    pub fn fail_authority_lookup(&self, guild: GuildId) {
        self.authority_errors.lock().unwrap().insert(guild);
    }

    pub fn set_behavior(&self, guild: GuildId, behavior: Behavior) {
        self.behavior.lock().unwrap().insert(guild, behavior);
    }

    /// Record the guard's view of the subject on every call
    pub fn observe_guard(&self, guard: Arc<CascadeGuard>) {
        *self.observed_guard.lock().unwrap() = Some(guard);
    }

    /// Block every mutation until [`open_gate`](Self::open_gate)
    pub fn close_gate(&self) {
        self.gate_tx.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate_tx.send_replace(true);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Mutation attempts, including retries and calls that never returned
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, guild: GuildId) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.guild == guild)
            .collect()
    }

    /// Poll until at least `n` mutations have started
    pub async fn wait_for_attempts(&self, n: usize) {
        for _ in 0..1_000 {
            if self.attempts() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {} attempts, saw {}", n, self.attempts());
    }

    async fn mutate(
        &self,
        guild: GuildId,
        subject: UserId,
        kind: CallKind,
        reason: &str,
    ) -> Result<Effect> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.gate_rx.clone();
        let _ = gate.wait_for(|open| *open).await;

        let subject_in_flight = self
            .observed_guard
            .lock()
            .unwrap()
            .as_ref()
            .map(|guard| guard.is_in_flight(subject));

        let behavior = self
            .behavior
            .lock()
            .unwrap()
            .get(&guild)
            .cloned()
            .unwrap_or(Behavior::Succeed);

        match behavior {
            Behavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Behavior::Fail(e) => Err(e),
            Behavior::FailThenSucceed(mut errors) => {
                let next = errors.pop_front();
                self.behavior
                    .lock()
                    .unwrap()
                    .insert(guild, Behavior::FailThenSucceed(errors));
                match next {
                    Some(e) => Err(e),
                    None => {
                        self.record(guild, subject, kind, reason, subject_in_flight);
                        Ok(Effect::Changed)
                    }
                }
            }
            Behavior::Succeed => {
                self.record(guild, subject, kind, reason, subject_in_flight);
                Ok(Effect::Changed)
            }
            Behavior::SucceedUnchanged => {
                self.record(guild, subject, kind, reason, subject_in_flight);
                Ok(Effect::Unchanged)
            }
        }
    }

    fn record(
        &self,
        guild: GuildId,
        subject: UserId,
        kind: CallKind,
        reason: &str,
        subject_in_flight: Option<bool>,
    ) {
        self.calls.lock().unwrap().push(Call {
            guild,
            subject,
            kind,
            reason: reason.to_string(),
            subject_in_flight,
        });
    }
}

#[async_trait]
impl ModerationPlatform for RecordingPlatform {
    async fn guild_available(&self, guild: GuildId) -> bool {
        !self.unavailable.lock().unwrap().contains(&guild)
    }

    async fn member_authority(
        &self,
        guild: GuildId,
        _subject: UserId,
        _kind: ActionKind,
    ) -> Result<Authority> {
        if self.authority_errors.lock().unwrap().contains(&guild) {
            return Err(Error::http("member lookup failed"));
        }
        Ok(self
            .authority
            .lock()
            .unwrap()
            .get(&guild)
            .cloned()
            .unwrap_or(Authority::Sufficient))
    }

    async fn create_ban(
        &self,
        guild: GuildId,
        subject: UserId,
        request: &BanRequest,
    ) -> Result<Effect> {
        self.mutate(
            guild,
            subject,
            CallKind::CreateBan {
                delete_message_secs: request.delete_message_secs,
            },
            &request.reason,
        )
        .await
    }

    async fn remove_ban(&self, guild: GuildId, subject: UserId, reason: &str) -> Result<Effect> {
        self.mutate(guild, subject, CallKind::RemoveBan, reason).await
    }

    async fn set_communication_disabled_until(
        &self,
        guild: GuildId,
        subject: UserId,
        until: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<Effect> {
        self.mutate(guild, subject, CallKind::SetTimeout { until }, reason)
            .await
    }

    fn platform_name(&self) -> &'static str {
        "recording"
    }
}

/// An event source driven by the test
pub struct ControlledEventSource {
    rx: Mutex<Option<mpsc::UnboundedReceiver<SourceEvent>>>,
}

impl ControlledEventSource {
    pub fn new() -> (Self, mpsc::UnboundedSender<SourceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

impl EventSource for ControlledEventSource {
    fn watch(&self) -> Pin<Box<dyn Stream<Item = SourceEvent> + Send + 'static>> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("watch() can only be called once");
        Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
    }

    fn source_name(&self) -> &'static str {
        "controlled"
    }
}

/// Engine settings for tests: no retries, short bound, no echo ledger
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        mutation_timeout_secs: 1,
        max_retries: 0,
        retry_delay_ms: 0,
        ban_delete_message_secs: 86_400,
        echo_window_secs: 0,
        event_channel_capacity: 1_000,
    }
}

pub fn test_config(guilds: &[GuildId]) -> ModSyncConfig {
    ModSyncConfig {
        guilds: guilds.to_vec(),
        engine: test_engine_config(),
    }
}

/// A replicator wired to `platform`, its event receiver and its guard
pub fn replicator_with(
    platform: &Arc<RecordingPlatform>,
    guilds: &[GuildId],
    settings: EngineConfig,
) -> (Arc<Replicator>, mpsc::Receiver<EngineEvent>, Arc<CascadeGuard>) {
    let guard = Arc::new(CascadeGuard::new());
    platform.observe_guard(Arc::clone(&guard));
    let (reporter, rx) = Reporter::channel(settings.event_channel_capacity);
    let replicator = Replicator::new(
        Arc::clone(platform) as Arc<dyn ModerationPlatform>,
        MonitoredGuilds::new(guilds.iter().copied()),
        Arc::clone(&guard),
        reporter,
        settings,
    );
    (Arc::new(replicator), rx, guard)
}

pub fn replicator(
    platform: &Arc<RecordingPlatform>,
    guilds: &[GuildId],
) -> (Arc<Replicator>, mpsc::Receiver<EngineEvent>, Arc<CascadeGuard>) {
    replicator_with(platform, guilds, test_engine_config())
}

/// Everything currently buffered in the engine event channel
pub fn drain(rx: &mut mpsc::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
