//! Discord API v10 wire types
//!
//! Only the fields the adapter reads are modelled; serde ignores the rest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use modsync_core::{GuildId, RoleId, UserId};

/// Gateway opcodes
pub mod op {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const REQUEST_GUILD_MEMBERS: u8 = 8;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Gateway intents
pub mod intents {
    pub const GUILDS: u64 = 1 << 0;
    pub const GUILD_MEMBERS: u64 = 1 << 1;
    pub const GUILD_MODERATION: u64 = 1 << 2;
}

/// Envelope of every gateway message
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub discriminator: Option<String>,
    #[serde(default)]
    pub global_name: Option<String>,
}

impl User {
    /// `name#1234` for legacy accounts, the plain username otherwise
    pub fn tag(&self) -> String {
        match self.discriminator.as_deref() {
            Some(disc) if !disc.is_empty() && disc != "0" => {
                format!("{}#{}", self.username, disc)
            }
            _ => self.username.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub position: i64,
    /// Permission bitfield, serialized as a decimal string
    pub permissions: String,
}

impl Role {
    pub fn permission_bits(&self) -> u64 {
        self.permissions.parse().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Member {
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub roles: Vec<RoleId>,
    #[serde(default)]
    pub communication_disabled_until: Option<DateTime<Utc>>,
}

/// `GUILD_CREATE` / `GUILD_UPDATE` payload
#[derive(Debug, Clone, Deserialize)]
pub struct Guild {
    pub id: GuildId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub owner_id: Option<UserId>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub unavailable: Option<bool>,
}

/// Guild stub in `READY` and `GUILD_DELETE`
#[derive(Debug, Clone, Deserialize)]
pub struct UnavailableGuild {
    pub id: GuildId,
    #[serde(default)]
    pub unavailable: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    pub resume_gateway_url: String,
    pub user: User,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
}

/// `GUILD_BAN_ADD` / `GUILD_BAN_REMOVE` payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BanEvent {
    pub guild_id: GuildId,
    pub user: User,
}

/// `GUILD_MEMBER_ADD` payload
#[derive(Debug, Clone, Deserialize)]
pub struct MemberAdd {
    pub guild_id: GuildId,
    #[serde(flatten)]
    pub member: Member,
}

/// `GUILD_MEMBER_UPDATE` payload
#[derive(Debug, Clone, Deserialize)]
pub struct MemberUpdate {
    pub guild_id: GuildId,
    pub user: User,
    #[serde(default)]
    pub roles: Vec<RoleId>,
    #[serde(default)]
    pub communication_disabled_until: Option<DateTime<Utc>>,
}

/// `GUILD_MEMBERS_CHUNK` payload, answering a member request
#[derive(Debug, Clone, Deserialize)]
pub struct MembersChunk {
    pub guild_id: GuildId,
    #[serde(default)]
    pub members: Vec<Member>,
    pub chunk_index: u32,
    pub chunk_count: u32,
}

/// `GUILD_MEMBER_REMOVE` payload
#[derive(Debug, Clone, Deserialize)]
pub struct MemberRemove {
    pub guild_id: GuildId,
    pub user: User,
}

/// `GUILD_ROLE_CREATE` / `GUILD_ROLE_UPDATE` payload
#[derive(Debug, Clone, Deserialize)]
pub struct RoleEvent {
    pub guild_id: GuildId,
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleDelete {
    pub guild_id: GuildId,
    pub role_id: RoleId,
}

/// `GET /guilds/{guild}/bans/{user}` response
#[derive(Debug, Clone, Deserialize)]
pub struct Ban {
    #[serde(default)]
    pub reason: Option<String>,
    pub user: User,
}

/// `GET /gateway/bot` response
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBot {
    pub url: String,
}

/// Body of a 429 response
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitBody {
    pub retry_after: f64,
    #[serde(default)]
    pub global: bool,
}
