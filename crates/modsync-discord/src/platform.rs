//! Discord implementation of [`ModerationPlatform`]
//!
//! Availability and the role hierarchy come from the shared [`GuildCache`];
//! members the gateway has not shown yet are fetched on demand and cached.
//!
//! Mutations report [`Effect::Unchanged`] when Discord will not send a
//! gateway event for them: dry-run calls, bans of users already banned and
//! timeouts that do not change the member's muted state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use modsync_core::model::TimeoutTransition;
use modsync_core::{
    ActionKind, Authority, BanRequest, Effect, Error, GuildId, ModerationPlatform, Result,
    UserId,
};

use crate::cache::{CachedMember, GuildCache};
use crate::permissions;
use crate::rest::DiscordRest;

pub struct DiscordPlatform {
    rest: DiscordRest,
    cache: Arc<GuildCache>,
}

impl DiscordPlatform {
    pub fn new(rest: DiscordRest, cache: Arc<GuildCache>) -> Self {
        Self { rest, cache }
    }

    async fn bot_user(&self) -> Result<UserId> {
        if let Some(id) = self.cache.bot_user() {
            return Ok(id);
        }
        let user = self.rest.current_user().await?;
        self.cache.set_bot_user(user.id);
        Ok(user.id)
    }

    /// Cached member, else a REST lookup; `None` if the user is not a member
    async fn member(&self, guild: GuildId, user: UserId) -> Result<Option<CachedMember>> {
        if let Some(member) = self.cache.member(guild, user) {
            return Ok(Some(member));
        }

        match self.rest.get_member(guild, user).await {
            Ok(member) => {
                let member = CachedMember::from(&member);
                self.cache.upsert_member(guild, user, member.clone());
                Ok(Some(member))
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Effect of setting a member's timeout, given the cached value
///
/// `previous` is `None` when the member is not cached; the change is then
/// assumed to happen.
fn timeout_effect(
    previous: Option<Option<DateTime<Utc>>>,
    until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Effect {
    match previous {
        Some(previous) if TimeoutTransition::classify(previous, until, now).is_none() => {
            Effect::Unchanged
        }
        _ => Effect::Changed,
    }
}

impl std::fmt::Debug for DiscordPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordPlatform")
            .field("rest", &self.rest)
            .field("guilds", &self.cache.len())
            .finish()
    }
}

#[async_trait]
impl ModerationPlatform for DiscordPlatform {
    async fn guild_available(&self, guild: GuildId) -> bool {
        self.cache.is_available(guild)
    }

    async fn member_authority(
        &self,
        guild: GuildId,
        subject: UserId,
        kind: ActionKind,
    ) -> Result<Authority> {
        let bot = self.bot_user().await?;

        let Some(snapshot) = self.cache.snapshot(guild) else {
            return Err(Error::not_found(format!("guild {} is not cached", guild)));
        };

        let Some(bot_member) = self.member(guild, bot).await? else {
            return Err(Error::not_found(format!(
                "bot is not a member of guild {}",
                guild
            )));
        };
        let subject_member = self.member(guild, subject).await?;

        Ok(permissions::compute_authority(
            &snapshot,
            bot,
            &bot_member,
            subject,
            subject_member.as_ref(),
            kind,
        ))
    }

    async fn create_ban(
        &self,
        guild: GuildId,
        subject: UserId,
        request: &BanRequest,
    ) -> Result<Effect> {
        if self.rest.is_dry_run() {
            self.rest.create_ban(guild, subject, request).await?;
            return Ok(Effect::Unchanged);
        }

        match self.rest.get_ban(guild, subject).await {
            Ok(_) => {
                debug!(guild = %guild, subject = %subject, "Already banned, skipping");
                return Ok(Effect::Unchanged);
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => debug!(guild = %guild, error = %e, "Ban lookup failed, banning anyway"),
        }

        self.cache.note_own_ban(guild, subject);
        match self.rest.create_ban(guild, subject, request).await {
            Ok(()) => Ok(Effect::Changed),
            Err(e) => {
                self.cache.forget_own_ban(guild, subject);
                Err(e)
            }
        }
    }

    async fn remove_ban(&self, guild: GuildId, subject: UserId, reason: &str) -> Result<Effect> {
        self.rest.remove_ban(guild, subject, reason).await?;
        // A user who is not banned is a 404, so success always lifted a ban
        Ok(if self.rest.is_dry_run() {
            Effect::Unchanged
        } else {
            Effect::Changed
        })
    }

    async fn set_communication_disabled_until(
        &self,
        guild: GuildId,
        subject: UserId,
        until: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<Effect> {
        let previous = self
            .cache
            .member(guild, subject)
            .map(|member| member.communication_disabled_until);

        // The member cache is left to the gateway update, which supplies the
        // previous value of the echo.
        self.rest
            .set_communication_disabled_until(guild, subject, until, reason)
            .await?;

        if self.rest.is_dry_run() {
            return Ok(Effect::Unchanged);
        }
        Ok(timeout_effect(previous, until, Utc::now()))
    }

    fn platform_name(&self) -> &'static str {
        "discord"
    }
}
