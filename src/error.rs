// =============================================================================
// Error taxonomy for the cache-and-collection engine
// =============================================================================
//
// Errors are always scoped to one TimeframeKey. Retryable fetch and storage
// failures are absorbed by the collector loop and only show up in its status;
// validation failures surface to the caller, and an invalid asset stops its
// collector with the error kept in the final status.
// =============================================================================

use thiserror::Error;

/// Failure reported by an upstream market-data source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid asset: {0}")]
    InvalidAsset(String),

    #[error("fetch timed out after {0} ms")]
    Timeout(u64),
}

impl FetchError {
    /// Everything except an unknown asset is expected to clear up on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidAsset(_))
    }
}

/// Hub-wide error type.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("unknown market: {0}")]
    UnknownMarket(String),

    #[error("invalid timeframe: {0}")]
    InvalidTimeframe(String),
}

impl HubError {
    pub fn validation(msg: impl Into<String>) -> Self {
        HubError::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        HubError::Storage(msg.into())
    }
}

/// Result type alias for hub operations.
pub type HubResult<T> = Result<T, HubError>;
