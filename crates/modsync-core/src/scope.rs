//! Monitored guild set and scope filter

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::model::GuildId;

/// The fixed set of guilds participating in moderation sync
///
/// Keeps configuration order for target iteration and a hash set for
/// O(1) membership tests. Immutable after construction.
#[derive(Debug, Clone)]
pub struct MonitoredGuilds {
    ordered: Vec<GuildId>,
    members: HashSet<GuildId>,
}

impl MonitoredGuilds {
    /// Build from ids in configuration order; later duplicates are dropped
    pub fn new(ids: impl IntoIterator<Item = GuildId>) -> Self {
        let mut ordered = Vec::new();
        let mut members = HashSet::new();
        for id in ids {
            if members.insert(id) {
                ordered.push(id);
            }
        }
        Self { ordered, members }
    }

    /// Parse a comma-separated list of guild ids
    ///
    /// Whitespace anywhere in the list is ignored, as are empty entries.
    pub fn parse(list: &str) -> Result<Self> {
        let compact: String = list.chars().filter(|c| !c.is_whitespace()).collect();
        let ids = compact
            .split(',')
            .filter(|entry| !entry.is_empty())
            .map(str::parse::<GuildId>)
            .collect::<Result<Vec<_>>>()?;

        if ids.is_empty() {
            return Err(Error::config("guild list is empty"));
        }

        Ok(Self::new(ids))
    }

    /// Whether an event from this guild is in scope
    pub fn contains(&self, guild: GuildId) -> bool {
        self.members.contains(&guild)
    }

    /// Every monitored guild except the origin, in configuration order
    pub fn targets_for(&self, origin: GuildId) -> Vec<GuildId> {
        self.ordered
            .iter()
            .copied()
            .filter(|id| *id != origin)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = GuildId> + '_ {
        self.ordered.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
