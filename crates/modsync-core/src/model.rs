//! Moderation data model
//!
//! Platform events are normalized into [`ModerationEvent`] at the boundary
//! (the platform adapter). The replicator only ever sees these closed
//! variants and the [`ModerationAction`] derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw snowflake
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw snowflake value
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                match trimmed.parse::<u64>() {
                    Ok(0) | Err(_) => Err(Error::invalid_input(format!(
                        concat!("invalid ", $what, " id: '{}'"),
                        trimmed
                    ))),
                    Ok(raw) => Ok(Self(raw)),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_string()
            }
        }
    };
}

snowflake!(
    /// Identifier of a guild (community) on the platform
    GuildId,
    "guild"
);

snowflake!(
    /// Identifier of a user on the platform
    UserId,
    "user"
);

snowflake!(
    /// Identifier of a role inside a guild
    RoleId,
    "role"
);

/// The guild an event originated from
///
/// The name is display data only; identity is the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildRef {
    pub id: GuildId,
    pub name: Option<String>,
}

impl GuildRef {
    pub fn new(id: GuildId) -> Self {
        Self { id, name: None }
    }

    pub fn named(id: GuildId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: Some(name.into()),
        }
    }

    /// Name if known, otherwise the id
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.id.to_string(),
        }
    }
}

/// The user affected by a moderation action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: UserId,
    /// Human readable tag (e.g. `name#0001`), used in log lines only
    pub tag: Option<String>,
}

impl Subject {
    pub fn new(id: UserId) -> Self {
        Self { id, tag: None }
    }

    pub fn tagged(id: UserId, tag: impl Into<String>) -> Self {
        Self {
            id,
            tag: Some(tag.into()),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "\"{}\" ({})", tag, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// A moderation event observed in one guild
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationEvent {
    BanAdded {
        guild: GuildRef,
        subject: Subject,
        reason: Option<String>,
    },
    BanRemoved {
        guild: GuildRef,
        subject: Subject,
    },
    TimeoutChanged {
        guild: GuildRef,
        subject: Subject,
        previous_until: Option<DateTime<Utc>>,
        new_until: Option<DateTime<Utc>>,
    },
}

impl ModerationEvent {
    /// Origin guild of the event
    pub fn guild(&self) -> &GuildRef {
        match self {
            Self::BanAdded { guild, .. }
            | Self::BanRemoved { guild, .. }
            | Self::TimeoutChanged { guild, .. } => guild,
        }
    }

    /// Subject user of the event
    pub fn subject(&self) -> &Subject {
        match self {
            Self::BanAdded { subject, .. }
            | Self::BanRemoved { subject, .. }
            | Self::TimeoutChanged { subject, .. } => subject,
        }
    }

    /// Derive the action to replicate, evaluated at `now`
    ///
    /// Returns `None` for timeout changes that are neither a mute nor an
    /// unmute (duration change only, or nothing to clear).
    pub fn action(&self, now: DateTime<Utc>) -> Option<ModerationAction> {
        match self {
            Self::BanAdded { reason, .. } => Some(ModerationAction::Ban {
                reason: reason.clone(),
            }),
            Self::BanRemoved { .. } => Some(ModerationAction::Unban),
            Self::TimeoutChanged {
                previous_until,
                new_until,
                ..
            } => TimeoutTransition::classify(*previous_until, *new_until, now).map(
                |transition| match transition {
                    TimeoutTransition::Muted { until } => ModerationAction::Mute { until },
                    TimeoutTransition::Unmuted => ModerationAction::Unmute,
                },
            ),
        }
    }
}

/// Direction of a timeout change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutTransition {
    Muted { until: DateTime<Utc> },
    Unmuted,
}

impl TimeoutTransition {
    /// Classify a before/after pair of communication-disabled timestamps
    ///
    /// A timestamp that is not in the future counts as unset.
    pub fn classify(
        previous: Option<DateTime<Utc>>,
        new: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let was_active = previous.is_some_and(|until| until > now);
        let active_until = new.filter(|until| *until > now);

        match (was_active, active_until) {
            (false, Some(until)) => Some(Self::Muted { until }),
            (true, None) => Some(Self::Unmuted),
            _ => None,
        }
    }
}

/// Normalized action applied to each target guild
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationAction {
    Ban { reason: Option<String> },
    Unban,
    Mute { until: DateTime<Utc> },
    Unmute,
}

impl ModerationAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Ban { .. } => ActionKind::Ban,
            Self::Unban => ActionKind::Unban,
            Self::Mute { .. } => ActionKind::Mute,
            Self::Unmute => ActionKind::Unmute,
        }
    }
}

/// Payload-free discriminant of [`ModerationAction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Ban,
    Unban,
    Mute,
    Unmute,
}

impl ActionKind {
    /// Whether the bot needs hierarchical authority over a member for this action
    pub fn needs_authority(self) -> bool {
        !matches!(self, Self::Unban)
    }

    /// Whether the action can target users who are not guild members
    pub fn applies_to_non_members(self) -> bool {
        matches!(self, Self::Ban | Self::Unban)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ban => "ban",
            Self::Unban => "unban",
            Self::Mute => "mute",
            Self::Unmute => "unmute",
        };
        f.write_str(s)
    }
}
