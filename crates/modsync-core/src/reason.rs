//! Audit-log reason strings for replicated actions
//!
//! Reasons embed the origin guild and, for bans, the moderator's original
//! reason. Both come from outside, so they are sanitized and capped before
//! being embedded.

use crate::model::{GuildRef, ModerationAction};

/// Platform limit for an audit log reason, in characters
pub const MAX_REASON_CHARS: usize = 512;

/// Cap for the embedded original reason, in characters
pub const MAX_ORIGINAL_REASON_CHARS: usize = 200;

/// Cap for the embedded guild label, in characters
const MAX_GUILD_LABEL_CHARS: usize = 100;

const PREFIX: &str = "[SYNC]";

/// Build the reason attached to a replicated action
pub fn synthesize(action: &ModerationAction, origin: &GuildRef) -> String {
    let origin = sanitize(&origin.label(), MAX_GUILD_LABEL_CHARS);

    let reason = match action {
        ModerationAction::Ban { reason } => {
            match reason.as_deref().map(|r| sanitize(r, MAX_ORIGINAL_REASON_CHARS)) {
                Some(original) if !original.is_empty() => {
                    format!("{} Relayed ban from '{}': {}", PREFIX, origin, original)
                }
                _ => format!(
                    "{} Relayed ban from '{}' - check the origin server's audit log or ban list for details.",
                    PREFIX, origin
                ),
            }
        }
        ModerationAction::Unban => format!("{} Relayed unban from '{}'", PREFIX, origin),
        ModerationAction::Mute { until } => format!(
            "{} Relayed timeout from '{}' until {}",
            PREFIX,
            origin,
            until.format("%Y-%m-%d %H:%M UTC")
        ),
        ModerationAction::Unmute => {
            format!("{} Relayed timeout removal from '{}'", PREFIX, origin)
        }
    };

    truncate(&reason, MAX_REASON_CHARS)
}

/// Strip control characters, collapse whitespace, neutralize markup, cap length
pub fn sanitize(input: &str, max_chars: usize) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| match c {
            '`' => '\'',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();

    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate(&collapsed, max_chars)
}

fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}
