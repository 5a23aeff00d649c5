//! Error types for the moderation sync system
//!
//! This module defines all error types used throughout the crate.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for moderation sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the moderation sync system
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Platform command errors that don't fit a more specific variant
    #[error("Platform error: {0}")]
    Platform(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network-level failures (connect, reset, DNS)
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP errors from the platform API (status and body)
    #[error("HTTP error: {0}")]
    Http(String),

    /// The platform rejected our credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The platform refused the action (missing permission, hierarchy)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Rate limiting errors
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        /// Server supplied wait time, if any
        retry_after: Option<Duration>,
    },

    /// A mutation did not finish within its time bound
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Unknown guild, member or ban
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Create a platform error
    pub fn platform(msg: impl Into<String>) -> Self {
        Self::Platform(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limited(msg: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: msg.into(),
            retry_after,
        }
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether retrying the same call later could succeed
    ///
    /// Permission, lookup and input errors are final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Http(_) | Self::RateLimited { .. } | Self::Timeout(_)
        )
    }

    /// Server-requested delay before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
