// # modsync-discord
//
// Discord adapter for the modsync engine.
//
// ## Components
//
// - **DiscordGateway**: [`EventSource`] over the gateway websocket
// - **DiscordPlatform**: [`ModerationPlatform`] over the REST API
// - **GuildCache**: Guild, role and member state shared by both
//
// The gateway fills the cache; the platform reads it for availability and
// the role hierarchy. Build both halves from one [`connect`] call so they
// share the same cache.
//
// ## Security
//
// - The bot token is held by [`DiscordRest`] only and never logged
// - Dry-run mode reads everything and mutates nothing
//
// [`EventSource`]: modsync_core::EventSource
// [`ModerationPlatform`]: modsync_core::ModerationPlatform

pub mod api;
pub mod cache;
pub mod gateway;
pub mod permissions;
pub mod platform;
pub mod rest;

use std::sync::Arc;

pub use cache::GuildCache;
pub use gateway::{DEFAULT_INTENTS, DiscordGateway};
pub use platform::DiscordPlatform;
pub use rest::DiscordRest;

/// Build a gateway and a platform sharing one REST client and one cache
pub fn connect(
    token: impl Into<String>,
    dry_run: bool,
) -> modsync_core::Result<(DiscordGateway, DiscordPlatform)> {
    let rest = DiscordRest::new(token, dry_run)?;
    let cache = Arc::new(GuildCache::new());

    let gateway = DiscordGateway::new(rest.clone(), Arc::clone(&cache));
    let platform = DiscordPlatform::new(rest, cache);
    Ok((gateway, platform))
}

#[cfg(test)]
mod tests {
    use super::*;
    use modsync_core::{EventSource, ModerationPlatform};
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn connect_rejects_empty_token() {
        assert_err!(connect("  ", false));
    }

    #[test]
    fn connect_builds_both_halves() {
        let (gateway, platform) = assert_ok!(connect("token", true));
        assert_eq!(gateway.source_name(), "discord-gateway");
        assert_eq!(platform.platform_name(), "discord");
    }
}
