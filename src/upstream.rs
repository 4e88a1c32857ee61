// =============================================================================
// Upstream: the abstract market-data source collectors pull from
// =============================================================================

use async_trait::async_trait;

use crate::error::FetchError;
use crate::types::{Candle, TimeframeKey};

/// Source of raw candle batches for one series.
///
/// Implementations return candles for `[from_ms, to_ms]` in ascending order.
/// A batch may be shorter than the window (upstream page size); the caller
/// advances its cursor and asks again.
#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    /// Human-readable source name.
    fn name(&self) -> &str;

    async fn fetch(
        &self,
        key: &TimeframeKey,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Candle>, FetchError>;
}
