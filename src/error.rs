//! Top-level error types for Relaybot.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Lane(#[from] LaneError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Gateway RPC errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{method} call failed: {message}")]
    Rpc {
        method: &'static str,
        message: String,
    },

    #[error("{method} call timed out")]
    Timeout { method: &'static str },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Subagent registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown run: {run_id}")]
    UnknownRun { run_id: String },

    #[error("failed to persist registry to {path}: {source}")]
    Persist {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Rejection handed to tasks spliced out of a lane by [`clear`].
///
/// Fire-and-forget callers are expected to catch or ignore this specific
/// type; it is the only way a queued (not yet started) task can fail.
///
/// [`clear`]: crate::lanes::LaneQueue::clear
#[derive(Debug, Clone, thiserror::Error)]
#[error("lane {lane} cleared while task was queued")]
pub struct LaneClearedError {
    pub lane: String,
}

impl LaneClearedError {
    pub fn new(lane: impl Into<String>) -> Self {
        Self { lane: lane.into() }
    }
}

/// Lane queue errors.
#[derive(Debug, thiserror::Error)]
pub enum LaneError {
    #[error(transparent)]
    Cleared(#[from] LaneClearedError),

    #[error("lane {lane} task terminated without completing")]
    Aborted { lane: String },
}
