use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CollectorSettings, CollectorState, CollectorStatus};
use crate::error::FetchError;
use crate::market_data::CandleStore;
use crate::types::{now_ms, Candle, TimeframeKey};
use crate::upstream::UpstreamFetcher;

/// What one cycle decided to do next.
enum Next {
    /// More history is waiting upstream; fetch again right away.
    Continue,
    Sleep(Duration),
    Stop,
}

/// One collector task bound to a single key.
pub(crate) struct Collector {
    key: TimeframeKey,
    fetcher: Arc<dyn UpstreamFetcher>,
    store: Arc<CandleStore>,
    settings: CollectorSettings,
    state: Arc<RwLock<CollectorState>>,
    cancel: CancellationToken,
}

impl Collector {
    pub(crate) fn new(
        key: TimeframeKey,
        fetcher: Arc<dyn UpstreamFetcher>,
        store: Arc<CandleStore>,
        settings: CollectorSettings,
        state: Arc<RwLock<CollectorState>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            key,
            fetcher,
            store,
            settings,
            state,
            cancel,
        }
    }

    /// Run until cancelled or told by upstream that the asset does not exist.
    /// Returns the final state, always `Stopped`.
    pub(crate) async fn run(self) -> CollectorState {
        info!(key = %self.key, source = self.fetcher.name(), "collector started");

        loop {
            let cursor = self.state.read().cursor;
            let now = now_ms();
            let fetch = tokio::time::timeout(
                self.settings.fetch_timeout,
                self.fetcher.fetch(&self.key, cursor, now),
            );

            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = fetch => res.unwrap_or_else(|_| {
                    Err(FetchError::Timeout(self.settings.fetch_timeout.as_millis() as u64))
                }),
            };

            let next = match fetched {
                Ok(batch) => self.absorb(batch, now),
                Err(e) if !e.is_retryable() => {
                    error!(key = %self.key, error = %e, "upstream rejected asset, stopping collector");
                    self.state.write().last_error = Some(e.to_string());
                    Next::Stop
                }
                Err(e) => self.record_failure(e.to_string()),
            };

            match next {
                Next::Continue => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                }
                Next::Sleep(delay) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Next::Stop => break,
            }
        }

        let mut state = self.state.write();
        state.status = CollectorStatus::Stopped;
        state.current_backoff_ms = 0;
        info!(key = %self.key, merged = state.candles_merged, "collector stopped");
        state.clone()
    }

    /// Merge a fetched batch and move the cursor.
    fn absorb(&self, batch: Vec<Candle>, now: i64) -> Next {
        let fetched = batch.len();
        let report = if batch.is_empty() {
            None
        } else {
            match self.store.append(&self.key, batch) {
                Ok(report) => Some(report),
                Err(e) => return self.record_failure(e.to_string()),
            }
        };
        // Nothing usable means the cursor cannot move.
        if let Some(r) = report.as_ref().filter(|r| r.last_accepted_ts.is_none()) {
            return self.record_failure(format!(
                "upstream returned {fetched} candles, none usable ({} misaligned, {} invalid)",
                r.misaligned, r.invalid
            ));
        }

        let timeframe = self.key.timeframe();
        let mut state = self.state.write();
        let before = state.cursor;

        if let Some(last) = report.as_ref().and_then(|r| r.last_accepted_ts) {
            // An unclosed latest bucket is fetched again next cycle so its
            // final values replace the partial ones.
            let next = if timeframe.is_open_at(last, now) { last } else { timeframe.next_open(last) };
            state.cursor = state.cursor.max(next);
            state.last_fetched_ts = Some(state.last_fetched_ts.map_or(last, |prev| prev.max(last)));
        }
        if let Some(report) = &report {
            state.candles_merged += report.inserted as u64;
        }
        state.status = CollectorStatus::Running;
        state.consecutive_failures = 0;
        state.current_backoff_ms = 0;
        state.last_success_at = Some(now);

        debug!(
            key = %self.key,
            fetched,
            inserted = report.as_ref().map_or(0, |r| r.inserted),
            cursor = state.cursor,
            "collector cycle complete"
        );

        let catching_up = state.cursor > before && state.cursor < timeframe.ts_last(now_ms());
        if catching_up {
            Next::Continue
        } else {
            Next::Sleep(self.settings.poll_interval)
        }
    }

    fn record_failure(&self, reason: String) -> Next {
        let mut state = self.state.write();
        state.consecutive_failures += 1;
        let delay = self.settings.backoff.delay_for(state.consecutive_failures);
        state.status = CollectorStatus::Backoff;
        state.current_backoff_ms = delay.as_millis() as u64;
        warn!(
            key = %self.key,
            failures = state.consecutive_failures,
            backoff_ms = state.current_backoff_ms,
            error = %reason,
            "collector cycle failed, backing off"
        );
        state.last_error = Some(reason);
        Next::Sleep(delay)
    }
}
