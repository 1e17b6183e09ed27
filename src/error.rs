//! Error types for the harvester.

use alloy::primitives::Selector;
use thiserror::Error;

/// Failure to turn call data or a log into a typed value.
///
/// Always recoverable: the offending transaction or log is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("call data too short: {0} bytes, need at least 4 for the selector")]
    ShortInput(usize),

    #[error("unknown selector {0}")]
    UnknownSelector(Selector),

    #[error("malformed payload for '{method}': {reason}")]
    Malformed { method: String, reason: String },

    #[error("expected {expected} topics, got {actual}")]
    UnexpectedTopics { expected: usize, actual: usize },

    #[error("invalid hex quantity '{0}'")]
    InvalidHex(String),
}

/// Errors surfaced by adapters, the harvester and the persistence layer.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    /// The provider refused the query because the block range or the result
    /// set was too large. Splitting the range may succeed.
    #[error("provider limit hit for blocks [{from}, {to}]: {reason}")]
    ProviderLimit { from: u64, to: u64, reason: String },

    #[error("RPC call timed out after {0} ms")]
    Timeout(u64),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("log range [{from}, {to}] rejected and cannot be split further: {reason}")]
    Range { from: u64, to: u64, reason: String },

    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("no adapter registered for chain '{0}'")]
    UnknownChain(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("{} listener(s) failed: {}", .0.len(), .0.join("; "))]
    Dispatch(Vec<String>),
}

impl HarvestError {
    /// Returns `true` for errors that are worth retrying on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Rpc(_) | Self::ProviderLimit { .. } | Self::Timeout(_)
        )
    }

    /// Returns `true` if the provider rejected a log query for its size.
    pub fn is_provider_limit(&self) -> bool {
        matches!(self, Self::ProviderLimit { .. })
    }
}

impl From<sqlx::Error> for HarvestError {
    fn from(e: sqlx::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for HarvestError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::Persistence(e.to_string())
    }
}

pub type Result<T, E = HarvestError> = std::result::Result<T, E>;
