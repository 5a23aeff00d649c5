// # Event Source Trait
//
// Defines the inbound side of the chat platform: a stream of normalized
// events from the connected guilds.
//
// ## Implementations
//
// - Discord gateway: `modsync-discord` crate
//
// ## Usage
//
// ```rust,ignore
// use modsync_core::EventSource;
// use tokio_stream::StreamExt;
//
// let mut stream = source.watch();
// while let Some(event) = stream.next().await {
//     println!("event: {:?}", event);
// }
// ```

use std::pin::Pin;
use tokio_stream::Stream;

use crate::model::ModerationEvent;

/// Items yielded by an [`EventSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// Session established
    Ready {
        /// Display name of the bot account
        account: String,
        /// Number of guilds the session is in
        guild_count: usize,
    },

    /// A moderation event normalized at the boundary
    Moderation(ModerationEvent),
}

/// Trait for event source implementations
///
/// # Behavior
///
/// - Events arrive in the order the platform delivered them
/// - Timeout changes are already paired with their previous value
/// - Reconnects are handled inside the source; the stream only ends when the
///   source is shut down
/// - Dropping the stream stops the source
pub trait EventSource: Send + Sync {
    /// Stream of platform events
    ///
    /// May only be called once per source.
    fn watch(&self) -> Pin<Box<dyn Stream<Item = SourceEvent> + Send + 'static>>;

    /// Get the source name (for logging/debugging)
    fn source_name(&self) -> &'static str;
}
