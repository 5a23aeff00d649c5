//! Role hierarchy and permission checks
//!
//! Mirrors the platform's own rules: the bot can act on a member only if it
//! holds the action's permission and its highest role sits above the
//! member's. Guild owners are out of reach, administrators cannot be timed
//! out.

use modsync_core::{ActionKind, Authority, RoleId, UserId};

use crate::cache::{CachedGuild, CachedMember};

pub const BAN_MEMBERS: u64 = 1 << 2;
pub const ADMINISTRATOR: u64 = 1 << 3;
pub const MODERATE_MEMBERS: u64 = 1 << 40;

/// Effective guild-level permissions of a member
pub fn member_permissions(guild: &CachedGuild, user: UserId, member: &CachedMember) -> u64 {
    if guild.owner_id == Some(user) {
        return u64::MAX;
    }

    // The @everyone role shares the guild's id
    let everyone = RoleId::new(guild.id.get());
    let bits = std::iter::once(&everyone)
        .chain(member.roles.iter())
        .filter_map(|role| guild.roles.get(role))
        .fold(0, |acc, role| acc | role.permissions);

    if bits & ADMINISTRATOR != 0 {
        u64::MAX
    } else {
        bits
    }
}

/// Position of the member's highest role (0 for @everyone only)
pub fn highest_position(guild: &CachedGuild, member: &CachedMember) -> i64 {
    member
        .roles
        .iter()
        .filter_map(|role| guild.roles.get(role))
        .map(|role| role.position)
        .max()
        .unwrap_or(0)
}

fn required_permission(kind: ActionKind) -> Option<(u64, &'static str)> {
    match kind {
        ActionKind::Ban => Some((BAN_MEMBERS, "BAN_MEMBERS")),
        ActionKind::Mute | ActionKind::Unmute => Some((MODERATE_MEMBERS, "MODERATE_MEMBERS")),
        ActionKind::Unban => None,
    }
}

/// The bot's authority over `subject` for an action of `kind`
///
/// `subject_member` is `None` when the subject is not in the guild.
pub fn compute_authority(
    guild: &CachedGuild,
    bot: UserId,
    bot_member: &CachedMember,
    subject: UserId,
    subject_member: Option<&CachedMember>,
    kind: ActionKind,
) -> Authority {
    let Some((permission, name)) = required_permission(kind) else {
        return Authority::Sufficient;
    };

    let bot_permissions = member_permissions(guild, bot, bot_member);
    if bot_permissions & permission == 0 {
        return Authority::Insufficient(format!("bot lacks {} in {}", name, guild_label(guild)));
    }

    let Some(member) = subject_member else {
        return Authority::NotMember;
    };

    if subject == bot {
        return Authority::Insufficient("subject is the bot itself".to_string());
    }
    if guild.owner_id == Some(subject) {
        return Authority::Insufficient("subject owns the guild".to_string());
    }

    if guild.owner_id != Some(bot) {
        let bot_position = highest_position(guild, bot_member);
        let subject_position = highest_position(guild, member);
        if subject_position >= bot_position {
            return Authority::Insufficient(format!(
                "subject's highest role ({}) is not below the bot's ({})",
                subject_position, bot_position
            ));
        }
    }

    if matches!(kind, ActionKind::Mute | ActionKind::Unmute)
        && member_permissions(guild, subject, member) & ADMINISTRATOR != 0
    {
        return Authority::Insufficient("administrators cannot be timed out".to_string());
    }

    Authority::Sufficient
}

fn guild_label(guild: &CachedGuild) -> String {
    match &guild.name {
        Some(name) => format!("'{}'", name),
        None => guild.id.to_string(),
    }
}
