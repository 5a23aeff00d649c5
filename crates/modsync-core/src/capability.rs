//! Capability check
//!
//! Decides, per target guild, whether the replicator should attempt the
//! mutation at all. The check is best-effort: a failed authority lookup does
//! not block the attempt, the mutation will surface the real error.

use tracing::debug;

use crate::model::{ActionKind, GuildId, UserId};
use crate::traits::{Authority, ModerationPlatform};

/// Verdict for one (target, subject, action) triple
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Ok,
    /// Target guild is down or not cached
    Unavailable,
    /// The bot cannot act on the subject here
    NotAuthoritative(String),
    /// The action needs membership and the subject isn't a member
    NotMember,
}

/// Run the capability check against `platform`
pub async fn check(
    platform: &dyn ModerationPlatform,
    target: GuildId,
    subject: UserId,
    kind: ActionKind,
) -> Capability {
    if !platform.guild_available(target).await {
        return Capability::Unavailable;
    }

    if !kind.needs_authority() {
        return Capability::Ok;
    }

    match platform.member_authority(target, subject, kind).await {
        Ok(Authority::Sufficient) => Capability::Ok,
        Ok(Authority::Insufficient(why)) => Capability::NotAuthoritative(why),
        Ok(Authority::NotMember) if kind.applies_to_non_members() => Capability::Ok,
        Ok(Authority::NotMember) => Capability::NotMember,
        Err(e) => {
            debug!(
                target_guild = %target,
                subject = %subject,
                "authority lookup failed, attempting anyway: {}",
                e
            );
            Capability::Ok
        }
    }
}
