// # modsync-core
//
// Core library for cross-guild moderation sync.
//
// ## Architecture Overview
//
// This library provides the moderation-event replication engine:
// - **EventSource**: Trait for receiving normalized moderation events
// - **ModerationPlatform**: Trait for availability/authority checks and mutations
// - **MonitoredGuilds**: The fixed guild set and scope filter
// - **CascadeGuard**: Per-subject in-flight set suppressing re-entrant fan-outs
// - **EchoLedger**: Short-lived memory of our own writes, for late echoes
// - **Replicator**: The fan-out over every other monitored guild
// - **Reporter**: Per-target outcome logging and engine events
// - **ModSyncEngine**: Event loop that drives the replicator
//
// ## Design Principles
//
// 1. **Skip and continue**: A problem with one target never stops the others
// 2. **One pass per action**: The guard reduces every logical moderation
//    action to exactly one fan-out, however many guilds report it back
// 3. **Closed variants**: Platform events are normalized at the boundary
// 4. **Library-First**: The engine runs without a live platform connection

pub mod capability;
pub mod config;
pub mod echo;
pub mod engine;
pub mod error;
pub mod guard;
pub mod model;
pub mod reason;
pub mod replicator;
pub mod reporter;
pub mod scope;
pub mod traits;

// Re-export core types for convenience
pub use config::{EngineConfig, ModSyncConfig};
pub use engine::{DropCause, EngineEvent, ModSyncEngine};
pub use error::{Error, Result};
pub use guard::CascadeGuard;
pub use model::{
    ActionKind, GuildId, GuildRef, ModerationAction, ModerationEvent, RoleId, Subject, UserId,
};
pub use replicator::{FanOutReport, Replication, Replicator, TargetOutcome};
pub use reporter::Reporter;
pub use scope::MonitoredGuilds;
pub use traits::{Authority, BanRequest, Effect, EventSource, ModerationPlatform, SourceEvent};
