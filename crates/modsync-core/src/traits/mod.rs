//! Core traits for the moderation sync system
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`EventSource`]: Receive moderation events from the platform
//! - [`ModerationPlatform`]: Query availability/authority and apply mutations

pub mod event_source;
pub mod platform;

pub use event_source::{EventSource, SourceEvent};
pub use platform::{Authority, BanRequest, Effect, ModerationPlatform};
