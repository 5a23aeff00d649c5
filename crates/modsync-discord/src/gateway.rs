// # Discord Gateway Event Source
//
// Websocket session against the Discord gateway (v10, JSON encoding).
//
// ## Architecture
//
// `watch()` spawns one session task that owns the websocket and forwards
// normalized events over an unbounded channel. The task:
//
// - Identifies with `GUILDS | GUILD_MEMBERS | GUILD_MODERATION` and a `dnd`
//   presence, then heartbeats at the interval from HELLO
// - Keeps the shared [`GuildCache`] current from guild, role and member
//   dispatches
// - Requests the full member list of every guild that becomes available
// - Pairs every member update with the cached previous timeout, so the
//   engine sees a before/after pair; updates for members the cache has not
//   seen yet carry no usable previous value and are dropped
// - Reconnects with RESUME when a session exists, IDENTIFY otherwise, with
//   exponential backoff that only resets once a connection stayed up
//
// A second task forwards the events in dispatch order. Ban reasons are
// looked up there (best-effort, time bounded), so a slow lookup never holds
// up heartbeats or the websocket reads. Bans issued by this process skip the
// lookup.
//
// The session ends when the stream is dropped, or on a close code that
// reconnecting cannot fix (bad token, disallowed intents). The stream then
// ends as well.

use futures_util::stream::{FuturesOrdered, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use modsync_core::{EventSource, GuildId, ModerationEvent, SourceEvent, Subject};

use crate::api::{self, GatewayPayload, intents, op};
use crate::cache::{CachedMember, GuildCache, NotCached};
use crate::rest::DiscordRest;

const GATEWAY_VERSION: u8 = 10;

/// Intents needed for bans, member timeouts and the guild cache
pub const DEFAULT_INTENTS: u64 = intents::GUILDS | intents::GUILD_MEMBERS | intents::GUILD_MODERATION;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A connection that lasted this long resets the backoff
const STABLE_UPTIME: Duration = Duration::from_secs(30);

/// Wait before identifying again after an invalidated session
const REIDENTIFY_DELAY: Duration = Duration::from_secs(3);

/// Bound for the ban reason lookup; the event is forwarded without reason after it
const BAN_REASON_TIMEOUT: Duration = Duration::from_secs(3);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// An event on its way to the stream, possibly still being enriched
type PendingEvent = Pin<Box<dyn Future<Output = SourceEvent> + Send>>;

#[derive(Debug, Error)]
enum GatewayError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed gateway payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("gateway protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Core(#[from] modsync_core::Error),
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum Disconnect {
    /// Reconnect and resume if a session exists
    Reconnect,
    /// Session is gone; identify afresh
    Reidentify,
    /// The event stream was dropped
    Shutdown,
    /// Close code that a reconnect cannot fix
    Fatal { code: u16, reason: String },
}

/// Classify a close frame from the gateway
fn close_disconnect(frame: Option<CloseFrame<'_>>) -> Disconnect {
    let Some(frame) = frame else {
        return Disconnect::Reconnect;
    };
    let code = u16::from(frame.code);
    match code {
        // authentication failed, invalid shard, sharding required,
        // invalid API version, invalid intents, disallowed intents
        4004 | 4010..=4014 => Disconnect::Fatal {
            code,
            reason: frame.reason.to_string(),
        },
        // invalid sequence, session timed out
        4007 | 4009 => Disconnect::Reidentify,
        _ => Disconnect::Reconnect,
    }
}

/// Delay between connection attempts
///
/// Doubles up to [`MAX_BACKOFF`] and starts over only after a connection
/// stayed up for [`STABLE_UPTIME`], so a gateway that accepts and then
/// drops every connection is not hammered.
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: INITIAL_BACKOFF,
        }
    }

    /// Delay after a connection attempt that lasted `uptime`
    fn delay(&mut self, uptime: Duration) -> Duration {
        if uptime >= STABLE_UPTIME {
            self.next = INITIAL_BACKOFF;
        }
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_BACKOFF);
        delay
    }
}

#[derive(Debug, Clone)]
struct ResumeInfo {
    session_id: String,
    resume_url: String,
}

fn identify_payload(token: &str, intents: u64) -> Value {
    json!({
        "op": op::IDENTIFY,
        "d": {
            "token": token,
            "intents": intents,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "modsync",
                "device": "modsync",
            },
            "presence": {
                "status": "dnd",
                "since": null,
                "activities": [],
                "afk": false,
            },
        },
    })
}

fn resume_payload(token: &str, resume: &ResumeInfo, seq: Option<u64>) -> Value {
    json!({
        "op": op::RESUME,
        "d": {
            "token": token,
            "session_id": resume.session_id,
            "seq": seq,
        },
    })
}

fn heartbeat_payload(seq: Option<u64>) -> Value {
    json!({ "op": op::HEARTBEAT, "d": seq })
}

/// Ask for every member of a guild; answered with `GUILD_MEMBERS_CHUNK`
fn request_members_payload(guild: GuildId) -> Value {
    json!({
        "op": op::REQUEST_GUILD_MEMBERS,
        "d": {
            "guild_id": guild.to_string(),
            "query": "",
            "limit": 0,
        },
    })
}

/// Discord gateway event source
pub struct DiscordGateway {
    rest: DiscordRest,
    cache: Arc<GuildCache>,
    intents: u64,
}

impl DiscordGateway {
    pub fn new(rest: DiscordRest, cache: Arc<GuildCache>) -> Self {
        Self::with_intents(rest, cache, DEFAULT_INTENTS)
    }

    pub fn with_intents(rest: DiscordRest, cache: Arc<GuildCache>, intents: u64) -> Self {
        Self {
            rest,
            cache,
            intents,
        }
    }
}

impl std::fmt::Debug for DiscordGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordGateway")
            .field("rest", &self.rest)
            .field("intents", &self.intents)
            .finish()
    }
}

impl EventSource for DiscordGateway {
    fn watch(&self) -> Pin<Box<dyn Stream<Item = SourceEvent> + Send + 'static>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();

        tokio::spawn(forward(pending_rx, tx.clone()));

        let session = Session {
            dispatcher: Dispatcher::new(self.rest.clone(), Arc::clone(&self.cache)),
            rest: self.rest.clone(),
            intents: self.intents,
            resume: None,
            seq: None,
            pending: pending_tx,
            tx,
        };
        tokio::spawn(session.run());

        Box::pin(UnboundedReceiverStream::new(rx))
    }

    fn source_name(&self) -> &'static str {
        "discord-gateway"
    }
}

/// One gateway session across reconnects
struct Session {
    dispatcher: Dispatcher,
    rest: DiscordRest,
    intents: u64,
    resume: Option<ResumeInfo>,
    seq: Option<u64>,
    /// Events in dispatch order, for the forwarding task
    pending: mpsc::UnboundedSender<PendingEvent>,
    /// Only watched for the stream being dropped
    tx: mpsc::UnboundedSender<SourceEvent>,
}

impl Session {
    async fn run(mut self) {
        tracing::info!("Starting Discord gateway session (intents={})", self.intents);
        let mut backoff = Backoff::new();

        loop {
            let started = Instant::now();
            let result = self.connect_once().await;
            let uptime = started.elapsed();

            let wait = match result {
                Ok(Disconnect::Shutdown) => break,
                Ok(Disconnect::Fatal { code, reason }) => {
                    tracing::error!(
                        "Gateway closed the session with code {} ({}), not reconnecting",
                        code,
                        reason
                    );
                    break;
                }
                Ok(Disconnect::Reidentify) => {
                    self.resume = None;
                    self.seq = None;
                    let wait = backoff.delay(uptime).max(REIDENTIFY_DELAY);
                    tracing::info!(
                        "Gateway session invalidated, identifying again in {:?}",
                        wait
                    );
                    wait
                }
                Ok(Disconnect::Reconnect) => {
                    let wait = backoff.delay(uptime);
                    tracing::info!("Reconnecting to the gateway in {:?}", wait);
                    wait
                }
                Err(e) => {
                    let wait = backoff.delay(uptime);
                    tracing::warn!(
                        "Gateway connection failed: {}. Reconnecting in {:?}",
                        e,
                        wait
                    );
                    wait
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.tx.closed() => break,
            }
        }

        tracing::info!("Discord gateway session stopped");
    }

    /// One websocket connection, from HELLO to disconnect
    async fn connect_once(&mut self) -> Result<Disconnect, GatewayError> {
        let base = match &self.resume {
            Some(resume) => resume.resume_url.clone(),
            None => self.rest.gateway_url().await?,
        };
        let url = format!(
            "{}/?v={}&encoding=json",
            base.trim_end_matches('/'),
            GATEWAY_VERSION
        );

        tracing::debug!("Connecting to gateway at {}", url);
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        let interval = read_hello(&mut stream).await?;

        let handshake = match &self.resume {
            Some(resume) => {
                tracing::debug!("Resuming session {}", resume.session_id);
                resume_payload(self.rest.token(), resume, self.seq)
            }
            None => identify_payload(self.rest.token(), self.intents),
        };
        send(&mut sink, &handshake).await?;

        // First beat at half the interval, then at the full interval
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval / 2, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_ack = false;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if awaiting_ack {
                        tracing::warn!("Heartbeat not acknowledged, reconnecting");
                        return Ok(Disconnect::Reconnect);
                    }
                    send(&mut sink, &heartbeat_payload(self.seq)).await?;
                    awaiting_ack = true;
                }

                message = stream.next() => {
                    let text = match message {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => return Ok(close_disconnect(frame)),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(Disconnect::Reconnect),
                    };

                    let payload: GatewayPayload = serde_json::from_str(&text)?;
                    if let Some(seq) = payload.s {
                        self.seq = Some(seq);
                    }

                    match payload.op {
                        op::DISPATCH => {
                            let kind = payload.t.unwrap_or_default();
                            if let Some(guild) = self.on_dispatch(&kind, payload.d) {
                                send(&mut sink, &request_members_payload(guild)).await?;
                            }
                        }
                        op::HEARTBEAT => {
                            send(&mut sink, &heartbeat_payload(self.seq)).await?;
                        }
                        op::HEARTBEAT_ACK => awaiting_ack = false,
                        op::RECONNECT => {
                            tracing::info!("Gateway requested a reconnect");
                            let _ = sink.send(Message::Close(None)).await;
                            return Ok(Disconnect::Reconnect);
                        }
                        op::INVALID_SESSION => {
                            let resumable = payload.d.as_bool().unwrap_or(false);
                            return Ok(if resumable {
                                Disconnect::Reconnect
                            } else {
                                Disconnect::Reidentify
                            });
                        }
                        other => tracing::trace!("Ignoring gateway opcode {}", other),
                    }
                }

                _ = self.tx.closed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(Disconnect::Shutdown);
                }
            }
        }
    }

    /// Handle a dispatch; returns a guild whose member list should be requested
    fn on_dispatch(&mut self, kind: &str, data: Value) -> Option<GuildId> {
        let result = if kind == "READY" {
            serde_json::from_value::<api::Ready>(data).map(|ready| {
                self.resume = Some(ResumeInfo {
                    session_id: ready.session_id.clone(),
                    resume_url: ready.resume_gateway_url.clone(),
                });
                Dispatched::Event(self.dispatcher.ready(&ready))
            })
        } else {
            self.dispatcher.dispatch(kind, data)
        };

        let pending: PendingEvent = match result {
            Ok(Dispatched::Ignored) => return None,
            Ok(Dispatched::GuildReady(guild)) => return Some(guild),
            Ok(Dispatched::Event(event)) => Box::pin(std::future::ready(event)),
            Ok(Dispatched::Ban(ban)) => {
                let dispatcher = self.dispatcher.clone();
                Box::pin(async move { dispatcher.ban_added(ban).await })
            }
            Err(e) => {
                tracing::warn!("Failed to decode {} dispatch: {}", kind, e);
                return None;
            }
        };

        if self.pending.send(pending).is_err() {
            tracing::debug!("Event forwarding stopped, discarding {}", kind);
        }
        None
    }
}

/// Deliver events in the order they were dispatched
///
/// Runs until the session drops its sender and every queued event is out,
/// or until the stream is dropped.
async fn forward(
    mut pending: mpsc::UnboundedReceiver<PendingEvent>,
    tx: mpsc::UnboundedSender<SourceEvent>,
) {
    let mut queue = FuturesOrdered::new();
    let mut open = true;

    while open || !queue.is_empty() {
        tokio::select! {
            next = pending.recv(), if open => match next {
                Some(event) => queue.push_back(event),
                None => open = false,
            },
            Some(event) = queue.next(), if !queue.is_empty() => {
                if tx.send(event).is_err() {
                    break;
                }
            }
            _ = tx.closed() => break,
        }
    }
}

async fn read_hello(stream: &mut WsSource) -> Result<Duration, GatewayError> {
    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => {
                let payload: GatewayPayload = serde_json::from_str(&text)?;
                if payload.op != op::HELLO {
                    return Err(GatewayError::Protocol(format!(
                        "expected HELLO, got opcode {}",
                        payload.op
                    )));
                }
                let hello: api::Hello = serde_json::from_value(payload.d)?;
                return Ok(Duration::from_millis(hello.heartbeat_interval));
            }
            Message::Close(frame) => {
                return Err(GatewayError::Protocol(format!(
                    "closed before HELLO: {:?}",
                    frame
                )));
            }
            _ => {}
        }
    }
    Err(GatewayError::Protocol("connection ended before HELLO".to_string()))
}

async fn send(sink: &mut WsSink, payload: &Value) -> Result<(), GatewayError> {
    sink.send(Message::Text(payload.to_string())).await?;
    Ok(())
}

/// Outcome of one dispatch
#[derive(Debug, PartialEq)]
enum Dispatched {
    /// Cache bookkeeping only
    Ignored,
    /// Event ready to forward
    Event(SourceEvent),
    /// A guild became available; its members should be requested
    GuildReady(GuildId),
    /// Someone else's ban, forwarded once its reason is looked up
    Ban(api::BanEvent),
}

/// Applies dispatches to the cache and normalizes moderation events
#[derive(Clone)]
struct Dispatcher {
    rest: DiscordRest,
    cache: Arc<GuildCache>,
}

impl Dispatcher {
    fn new(rest: DiscordRest, cache: Arc<GuildCache>) -> Self {
        Self { rest, cache }
    }

    fn ready(&self, ready: &api::Ready) -> SourceEvent {
        self.cache.set_bot_user(ready.user.id);
        self.cache
            .register_pending(ready.guilds.iter().map(|guild| guild.id));

        SourceEvent::Ready {
            account: ready.user.tag(),
            guild_count: ready.guilds.len(),
        }
    }

    fn dispatch(&self, kind: &str, data: Value) -> Result<Dispatched, serde_json::Error> {
        match kind {
            "GUILD_CREATE" => {
                let guild: api::Guild = serde_json::from_value(data)?;
                self.cache.upsert_guild(&guild);
                if self.cache.is_available(guild.id) {
                    tracing::debug!(
                        "Guild {} is available, requesting its members",
                        self.cache.guild_ref(guild.id).label()
                    );
                    return Ok(Dispatched::GuildReady(guild.id));
                }
            }
            "GUILD_UPDATE" => {
                let guild: api::Guild = serde_json::from_value(data)?;
                self.cache.update_guild(&guild);
            }
            "GUILD_DELETE" => {
                let guild: api::UnavailableGuild = serde_json::from_value(data)?;
                if guild.unavailable == Some(true) {
                    tracing::warn!(
                        "Guild {} became unavailable",
                        self.cache.guild_ref(guild.id).label()
                    );
                }
                self.cache.delete_guild(&guild);
            }
            "GUILD_ROLE_CREATE" | "GUILD_ROLE_UPDATE" => {
                let event: api::RoleEvent = serde_json::from_value(data)?;
                self.cache.upsert_role(event.guild_id, &event.role);
            }
            "GUILD_ROLE_DELETE" => {
                let event: api::RoleDelete = serde_json::from_value(data)?;
                self.cache.remove_role(event.guild_id, event.role_id);
            }
            "GUILD_MEMBER_ADD" => {
                let event: api::MemberAdd = serde_json::from_value(data)?;
                if let Some(user) = &event.member.user {
                    self.cache
                        .upsert_member(event.guild_id, user.id, CachedMember::from(&event.member));
                }
            }
            "GUILD_MEMBERS_CHUNK" => {
                let chunk: api::MembersChunk = serde_json::from_value(data)?;
                self.cache.upsert_members(chunk.guild_id, &chunk.members);
                if chunk.chunk_index + 1 >= chunk.chunk_count {
                    tracing::debug!(
                        "Member list of guild {} is complete",
                        self.cache.guild_ref(chunk.guild_id).label()
                    );
                }
            }
            "GUILD_MEMBER_REMOVE" => {
                let event: api::MemberRemove = serde_json::from_value(data)?;
                self.cache.remove_member(event.guild_id, event.user.id);
            }
            "GUILD_MEMBER_UPDATE" => {
                let update: api::MemberUpdate = serde_json::from_value(data)?;
                return Ok(self.member_update(update));
            }
            "GUILD_BAN_ADD" => {
                let ban: api::BanEvent = serde_json::from_value(data)?;
                self.cache.remove_member(ban.guild_id, ban.user.id);
                if self.cache.take_own_ban(ban.guild_id, ban.user.id) {
                    // Our own replica; the reason is ours too
                    return Ok(Dispatched::Event(self.ban_event(&ban, None)));
                }
                return Ok(Dispatched::Ban(ban));
            }
            "GUILD_BAN_REMOVE" => {
                let ban: api::BanEvent = serde_json::from_value(data)?;
                return Ok(Dispatched::Event(SourceEvent::Moderation(
                    ModerationEvent::BanRemoved {
                        guild: self.cache.guild_ref(ban.guild_id),
                        subject: Subject::tagged(ban.user.id, ban.user.tag()),
                    },
                )));
            }
            "RESUMED" => tracing::info!("Gateway session resumed"),
            other => tracing::trace!("Ignoring dispatch {}", other),
        }
        Ok(Dispatched::Ignored)
    }

    /// Pair the update with the cached timeout; unchanged timeouts are not forwarded
    fn member_update(&self, update: api::MemberUpdate) -> Dispatched {
        let new_until = update.communication_disabled_until;
        let previous_until = match self.cache.update_member(
            update.guild_id,
            update.user.id,
            CachedMember {
                roles: update.roles,
                communication_disabled_until: new_until,
            },
        ) {
            Ok(previous_until) => previous_until,
            Err(NotCached) => {
                tracing::debug!(
                    guild = %update.guild_id,
                    subject = %update.user.id,
                    "Member was not cached, previous timeout unknown; update not forwarded"
                );
                return Dispatched::Ignored;
            }
        };

        if previous_until == new_until {
            return Dispatched::Ignored;
        }

        Dispatched::Event(SourceEvent::Moderation(ModerationEvent::TimeoutChanged {
            guild: self.cache.guild_ref(update.guild_id),
            subject: Subject::tagged(update.user.id, update.user.tag()),
            previous_until,
            new_until,
        }))
    }

    fn ban_event(&self, ban: &api::BanEvent, reason: Option<String>) -> SourceEvent {
        SourceEvent::Moderation(ModerationEvent::BanAdded {
            guild: self.cache.guild_ref(ban.guild_id),
            subject: Subject::tagged(ban.user.id, ban.user.tag()),
            reason,
        })
    }

    /// Look up the ban reason, then build the event
    async fn ban_added(&self, ban: api::BanEvent) -> SourceEvent {
        let lookup = tokio::time::timeout(
            BAN_REASON_TIMEOUT,
            self.rest.get_ban(ban.guild_id, ban.user.id),
        )
        .await;

        let reason = match lookup {
            Ok(Ok(details)) => details.reason,
            Ok(Err(e)) => {
                tracing::debug!(guild = %ban.guild_id, subject = %ban.user.id, "ban reason lookup failed: {}", e);
                None
            }
            Err(_) => {
                tracing::debug!(guild = %ban.guild_id, subject = %ban.user.id, "ban reason lookup timed out");
                None
            }
        };

        self.ban_event(&ban, reason)
    }
}
