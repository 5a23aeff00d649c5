// # Moderation Platform Trait
//
// Defines the command side of the chat platform: availability of a guild,
// the bot's authority over a member, and the three mutations the engine
// replicates.
//
// ## Implementations
//
// - Discord: `modsync-discord` crate
//
// ## Usage
//
// ```rust,ignore
// use modsync_core::ModerationPlatform;
//
// #[tokio::main]
// async fn main() -> modsync_core::Result<()> {
//     let platform = /* ModerationPlatform implementation */;
//
//     if platform.guild_available(guild).await {
//         platform.create_ban(guild, user, &BanRequest { delete_message_secs: 86400, reason }).await?;
//     }
//
//     Ok(())
// }
// ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{ActionKind, GuildId, UserId};

/// The bot's standing over a subject in one guild
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authority {
    /// The bot may act on the member
    Sufficient,
    /// The bot may not act on the member (why, for the log line)
    Insufficient(String),
    /// The subject is not a member of the guild
    NotMember,
}

/// What a successful mutation did to the member's state
///
/// The replicator only expects an echo event for [`Effect::Changed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// The state changed; the platform will report it as an event
    Changed,
    /// The state already matched, or nothing was sent; no event follows
    Unchanged,
}

/// Parameters of a replicated ban
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRequest {
    /// Window of the subject's recent messages to delete
    pub delete_message_secs: u32,
    /// Audit log reason
    pub reason: String,
}

/// Trait for chat platform command implementations
///
/// Implementations must be thread-safe and usable across async tasks.
///
/// # Contract
///
/// - Every mutation is a single attempt. Retry, backoff and time bounds are
///   owned by the replicator.
/// - Errors carry enough classification for
///   [`Error::is_transient`](crate::Error::is_transient) to be meaningful.
/// - Lookups never mutate platform state.
#[async_trait]
pub trait ModerationPlatform: Send + Sync {
    /// Whether the guild is connected and usable right now
    async fn guild_available(&self, guild: GuildId) -> bool;

    /// The bot's authority over `subject` in `guild` for an action of `kind`
    ///
    /// # Returns
    ///
    /// - `Ok(Authority)`: The resolved standing
    /// - `Err(Error)`: If the lookup itself failed
    async fn member_authority(
        &self,
        guild: GuildId,
        subject: UserId,
        kind: ActionKind,
    ) -> Result<Authority, crate::Error>;

    /// Ban `subject` from `guild`
    async fn create_ban(
        &self,
        guild: GuildId,
        subject: UserId,
        request: &BanRequest,
    ) -> Result<Effect, crate::Error>;

    /// Lift the ban on `subject` in `guild`
    async fn remove_ban(
        &self,
        guild: GuildId,
        subject: UserId,
        reason: &str,
    ) -> Result<Effect, crate::Error>;

    /// Set (`Some`) or clear (`None`) the member's communication-disabled-until timestamp
    async fn set_communication_disabled_until(
        &self,
        guild: GuildId,
        subject: UserId,
        until: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<Effect, crate::Error>;

    /// Get the platform name (for logging/debugging)
    fn platform_name(&self) -> &'static str;
}
