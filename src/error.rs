//! Crate-level error type.

use thiserror::Error;

use crate::config::loader::ConfigError;
use crate::persistence::store::StoreError;

/// Errors surfaced by the protector to callers (admin surface, startup).
#[derive(Debug, Error)]
pub enum ProtectorError {
    /// The requested mutation conflicts with static configuration.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// The identity string cannot be used as a registry key.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// A threat signature failed to compile.
    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProtectorResult<T> = Result<T, ProtectorError>;
