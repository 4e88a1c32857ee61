// =============================================================================
// Cache Service: the façade the boundary layer talks to
// =============================================================================
//
// Four entry points: read a candle range, start a collector, stop it, and
// observe it. Reads go straight to the candle store and never wait for a
// collector; collector lifecycle goes through the registry.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::collector::{CollectorRegistry, CollectorSettings, CollectorState};
use crate::error::{HubError, HubResult};
use crate::market_data::{CandleStore, SeriesIndex, Since};
use crate::types::{now_ms, Candle, TimeframeKey};
use crate::upstream::UpstreamFetcher;

/// Default cap on candles returned by one range read.
pub const DEFAULT_MAX_QUERY_LIMIT: usize = 1000;

pub struct CacheService {
    store: Arc<CandleStore>,
    registry: CollectorRegistry,
    markets: HashMap<String, Arc<dyn UpstreamFetcher>>,
    settings: CollectorSettings,
    max_query_limit: usize,
}

impl CacheService {
    pub fn new(store: Arc<CandleStore>, settings: CollectorSettings) -> Self {
        Self {
            store,
            registry: CollectorRegistry::new(),
            markets: HashMap::new(),
            settings,
            max_query_limit: DEFAULT_MAX_QUERY_LIMIT,
        }
    }

    /// Register the upstream source serving `market_id`.
    pub fn with_market(mut self, market_id: &str, fetcher: Arc<dyn UpstreamFetcher>) -> Self {
        info!(market = market_id, source = fetcher.name(), "market registered");
        self.markets.insert(market_id.to_lowercase(), fetcher);
        self
    }

    pub fn with_max_query_limit(mut self, limit: usize) -> Self {
        self.max_query_limit = limit.max(1);
        self
    }

    /// Configured market ids, sorted.
    pub fn markets(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.markets.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn fetcher_for(&self, key: &TimeframeKey) -> HubResult<Arc<dyn UpstreamFetcher>> {
        self.markets
            .get(key.market_id())
            .cloned()
            .ok_or_else(|| HubError::UnknownMarket(key.market_id().to_string()))
    }

    /// Up to `limit` cached candles for `key`, capped at the configured
    /// maximum.
    pub fn get_range(&self, key: &TimeframeKey, since: Since, limit: usize) -> HubResult<Vec<Candle>> {
        self.fetcher_for(key)?;
        self.store.query(key, since, limit.min(self.max_query_limit))
    }

    /// Index of the cached series for `key`.
    pub fn series_info(&self, key: &TimeframeKey) -> HubResult<SeriesIndex> {
        self.fetcher_for(key)?;
        self.store.info(key)
    }

    /// Start collecting `key` from `since` (epoch ms), or from the current
    /// bucket when `since` is `None`. Idempotent while a collector runs.
    /// A `since` past the next bucket is a validation error.
    pub fn start_collector(&self, key: &TimeframeKey, since: Option<i64>) -> HubResult<CollectorState> {
        let fetcher = self.fetcher_for(key)?;
        // Surface an unreadable cache to the caller instead of the collector.
        self.store.info(key)?;

        let timeframe = key.timeframe();
        let current = timeframe.ts_last(now_ms());
        let cursor = match since {
            Some(ts) => timeframe
                .ts_since(ts)
                .filter(|cursor| *cursor <= timeframe.next_open(current))
                .ok_or_else(|| HubError::validation(format!("since {ts} is in the future")))?,
            None => current,
        };
        Ok(self.registry.start(
            key.clone(),
            cursor,
            fetcher,
            self.store.clone(),
            self.settings.clone(),
        ))
    }

    pub async fn stop_collector(&self, key: &TimeframeKey) -> Option<CollectorState> {
        self.registry.stop(key).await
    }

    pub fn collector_status(&self, key: &TimeframeKey) -> Option<CollectorState> {
        self.registry.status(key)
    }

    /// Snapshots of all live collectors.
    pub fn collectors(&self) -> Vec<CollectorState> {
        self.registry.list()
    }

    /// Stop every collector; used on process shutdown.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
