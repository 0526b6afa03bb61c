//! Error types for the admission limiter
//!
//! Almost every failure in this crate degrades to "allow the connection,
//! track nothing". These types exist so that the degradation can be logged
//! with a precise cause; only [`LimiterError`] ever reaches a caller.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while talking to the shared keyed store
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Failed to connect to store at {addr}: {message}")]
    Connect { addr: String, message: String },

    #[error("Store operation `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("Store operation `{op}` failed: {message}")]
    Backend { op: &'static str, message: String },

    #[error("Store operation `{op}` returned an unexpected reply: {message}")]
    UnexpectedReply { op: &'static str, message: String },

    #[error("Store is not available")]
    Unavailable,
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("Entry TTL must be at least one second")]
    InvalidTtl,

    #[error("Key prefix cannot be empty")]
    EmptyKeyPrefix,
}

/// Reasons a configuration or settings document could not be used
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Failed to parse document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Document is not a JSON object")]
    NotAnObject,

    #[error("Document has no inbound list")]
    MissingInbounds,

    #[error("Failed to read document: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by [`crate::AdmissionController::initialize`]
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("Invalid limiter configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
