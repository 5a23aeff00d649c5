//! Configuration types for the moderation sync system
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::GuildId;

/// Main moderation sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModSyncConfig {
    /// Monitored guilds, in configuration order
    pub guilds: Vec<GuildId>,

    /// Optional engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl ModSyncConfig {
    /// Create a configuration for the given guilds with default engine settings
    pub fn new(guilds: Vec<GuildId>) -> Self {
        Self {
            guilds,
            engine: EngineConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.guilds.is_empty() {
            return Err(crate::Error::config("No guilds configured"));
        }

        self.engine.validate()?;

        Ok(())
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound for a single platform mutation call (in seconds)
    #[serde(default = "default_mutation_timeout_secs")]
    pub mutation_timeout_secs: u64,

    /// Retries for transient mutation failures (0 disables retrying)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Delay between retry attempts (in milliseconds)
    ///
    /// A larger server-supplied retry-after wins, capped at
    /// [`MAX_RETRY_AFTER`].
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// How much of the subject's message history a replicated ban deletes (in seconds)
    #[serde(default = "default_ban_delete_message_secs")]
    pub ban_delete_message_secs: u32,

    /// How long an applied mutation is remembered to recognize its echo (in seconds)
    ///
    /// Set to 0 to rely on the in-flight guard alone.
    #[serde(default = "default_echo_window_secs")]
    pub echo_window_secs: u64,

    /// Capacity of the engine event channel
    ///
    /// When full, new engine events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

/// Longest server-supplied retry-after the engine will honor
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Platform maximum for ban message deletion (7 days)
pub const MAX_BAN_DELETE_MESSAGE_SECS: u32 = 7 * 24 * 60 * 60;

impl EngineConfig {
    /// Validate the engine configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.mutation_timeout_secs == 0 {
            return Err(crate::Error::config("Mutation timeout must be > 0"));
        }
        if self.ban_delete_message_secs > MAX_BAN_DELETE_MESSAGE_SECS {
            return Err(crate::Error::config(format!(
                "Ban message deletion window must be <= {} seconds",
                MAX_BAN_DELETE_MESSAGE_SECS
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }

    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_secs(self.mutation_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn echo_window(&self) -> Duration {
        Duration::from_secs(self.echo_window_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mutation_timeout_secs: default_mutation_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            ban_delete_message_secs: default_ban_delete_message_secs(),
            echo_window_secs: default_echo_window_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_mutation_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> usize {
    2
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_ban_delete_message_secs() -> u32 {
    24 * 60 * 60
}

fn default_echo_window_secs() -> u64 {
    15
}

fn default_event_channel_capacity() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ModSyncConfig::new(vec![GuildId::new(1), GuildId::new(2)]);
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.ban_delete_message_secs, 86_400);
        assert_eq!(config.engine.mutation_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn empty_guild_list_is_rejected() {
        let config = ModSyncConfig::new(Vec::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn engine_bounds_are_checked() {
        let mut config = ModSyncConfig::new(vec![GuildId::new(1)]);
        config.engine.mutation_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ModSyncConfig::new(vec![GuildId::new(1)]);
        config.engine.ban_delete_message_secs = MAX_BAN_DELETE_MESSAGE_SECS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn engine_section_is_optional_in_json() {
        let config: ModSyncConfig =
            serde_json::from_str(r#"{ "guilds": ["111", "222"] }"#).unwrap();
        assert_eq!(config.guilds.len(), 2);
        assert_eq!(config.engine.max_retries, 2);
        assert_eq!(config.engine.echo_window_secs, 15);
    }
}
