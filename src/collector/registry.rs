// =============================================================================
// Collector Registry: at most one live collector per TimeframeKey
// =============================================================================
//
// The registry is the only place that knows whether a collector runs for a
// key. Start, stop and the task's own exit all go through one mutex-guarded
// table, so concurrent starts for a key collapse onto a single task. Spawning
// happens while the table is locked; `tokio::spawn` never blocks, so the
// critical section stays short.
//
// When a collector ends its final state is kept as a tombstone, which lets
// `status` report why a collector stopped itself (e.g. an invalid asset).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use super::worker::Collector;
use super::{CollectorSettings, CollectorState, CollectorStatus};
use crate::market_data::CandleStore;
use crate::types::{now_ms, TimeframeKey};
use crate::upstream::UpstreamFetcher;

struct CollectorHandle {
    run_id: String,
    state: Arc<RwLock<CollectorState>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CollectorHandle {
    fn snapshot(&self) -> CollectorState {
        self.state.read().clone()
    }

    async fn shut_down(self) -> CollectorState {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(run_id = %self.run_id, error = %e, "collector task ended abnormally");
        }
        let mut state = self.state.read().clone();
        state.status = CollectorStatus::Stopped;
        state
    }
}

#[derive(Default)]
struct Entries {
    active: HashMap<TimeframeKey, CollectorHandle>,
    finished: HashMap<TimeframeKey, CollectorState>,
}

/// Shared table of running collectors. Cloning shares the table.
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    entries: Arc<Mutex<Entries>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a collector for `key` with its cursor at `cursor`, or return the
    /// state of the one already running.
    pub fn start(
        &self,
        key: TimeframeKey,
        cursor: i64,
        fetcher: Arc<dyn UpstreamFetcher>,
        store: Arc<CandleStore>,
        settings: CollectorSettings,
    ) -> CollectorState {
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.active.get(&key) {
            let snapshot = existing.snapshot();
            if snapshot.status != CollectorStatus::Stopped {
                return snapshot;
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let initial = CollectorState {
            key: key.clone(),
            run_id: run_id.clone(),
            status: CollectorStatus::Running,
            cursor,
            last_fetched_ts: None,
            consecutive_failures: 0,
            current_backoff_ms: 0,
            candles_merged: 0,
            last_error: None,
            started_at: now_ms(),
            last_success_at: None,
        };
        let state = Arc::new(RwLock::new(initial.clone()));
        let cancel = CancellationToken::new();

        let collector = Collector::new(
            key.clone(),
            fetcher,
            store,
            settings,
            state.clone(),
            cancel.clone(),
        );
        let registry = self.clone();
        let task_key = key.clone();
        let task_run_id = run_id.clone();
        let task = tokio::spawn(async move {
            let final_state = collector.run().await;
            registry.finish(&task_key, &task_run_id, final_state);
        });

        info!(key = %key, run_id = %run_id, cursor, "collector registered");
        entries.finished.remove(&key);
        entries.active.insert(
            key,
            CollectorHandle {
                run_id,
                state,
                cancel,
                task,
            },
        );
        initial
    }

    /// Called by a collector task on exit.
    fn finish(&self, key: &TimeframeKey, run_id: &str, final_state: CollectorState) {
        let mut entries = self.entries.lock();
        match entries.active.get(key) {
            Some(handle) if handle.run_id == run_id => {
                entries.active.remove(key);
            }
            // A newer collector owns the key now.
            Some(_) => return,
            None => {}
        }
        entries.finished.insert(key.clone(), final_state);
    }

    /// Stop the collector for `key` and wait for its task to exit. Stopping
    /// an absent collector returns the last known state, if any.
    pub async fn stop(&self, key: &TimeframeKey) -> Option<CollectorState> {
        let handle = {
            let mut entries = self.entries.lock();
            match entries.active.remove(key) {
                Some(handle) => handle,
                None => return entries.finished.get(key).cloned(),
            }
        };

        let state = handle.shut_down().await;
        info!(key = %key, run_id = %state.run_id, "collector stop requested");
        self.entries
            .lock()
            .finished
            .entry(key.clone())
            .or_insert_with(|| state.clone());
        Some(state)
    }

    /// Snapshot of the collector for `key`: live if one runs, otherwise the
    /// final state of the last one.
    pub fn status(&self, key: &TimeframeKey) -> Option<CollectorState> {
        let entries = self.entries.lock();
        entries
            .active
            .get(key)
            .map(CollectorHandle::snapshot)
            .or_else(|| entries.finished.get(key).cloned())
    }

    /// Snapshots of every live collector.
    pub fn list(&self) -> Vec<CollectorState> {
        let entries = self.entries.lock();
        let mut states: Vec<CollectorState> =
            entries.active.values().map(CollectorHandle::snapshot).collect();
        states.sort_by_key(|s| s.key.to_string());
        states
    }

    /// Stop every collector and wait for all of them.
    pub async fn shutdown(&self) {
        let handles: Vec<CollectorHandle> = {
            let mut entries = self.entries.lock();
            entries.active.drain().map(|(_, h)| h).collect()
        };
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "stopping all collectors");
        let states = join_all(handles.into_iter().map(CollectorHandle::shut_down)).await;

        let mut entries = self.entries.lock();
        for state in states {
            entries.finished.insert(state.key.clone(), state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::BackoffPolicy;
    use crate::error::FetchError;
    use crate::market_data::{MemoryStorage, Since};
    use crate::types::Candle;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    const MIN: i64 = 60_000;

    fn key() -> TimeframeKey {
        TimeframeKey::new("test", "BTCUSDT", "1m".parse().unwrap()).unwrap()
    }

    fn candle(n: i64) -> Candle {
        Candle::new(n * MIN, 1.0, 2.0, 0.5, 1.5, 3.0)
    }

    fn settings() -> CollectorSettings {
        CollectorSettings {
            poll_interval: Duration::from_millis(20),
            fetch_timeout: Duration::from_millis(200),
            backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100)),
        }
    }

    fn store() -> Arc<CandleStore> {
        Arc::new(CandleStore::new(Arc::new(MemoryStorage::new())))
    }

    /// Plays back scripted responses, then returns empty batches forever.
    #[derive(Default)]
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<Vec<Candle>, FetchError>>>,
        calls: Mutex<Vec<(Instant, i64)>>,
        delay: Option<Duration>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<Vec<Candle>, FetchError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl UpstreamFetcher for ScriptedFetcher {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch(
            &self,
            _key: &TimeframeKey,
            from_ms: i64,
            _to_ms: i64,
        ) -> Result<Vec<Candle>, FetchError> {
            self.calls.lock().push((Instant::now(), from_ms));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.script.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    /// Counts calls and never finishes a fetch.
    #[derive(Default)]
    struct HangingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamFetcher for HangingFetcher {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn fetch(&self, _: &TimeframeKey, _: i64, _: i64) -> Result<Vec<Candle>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn second_start_joins_the_first() {
        let registry = CollectorRegistry::new();
        let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
        let store = store();

        let first = registry.start(key(), 0, fetcher.clone(), store.clone(), settings());
        let second = registry.start(key(), 5 * MIN, fetcher.clone(), store.clone(), settings());
        assert_eq!(first.run_id, second.run_id);
        assert_eq!(second.cursor, 0, "second start must not reset the cursor");
        assert_eq!(registry.list().len(), 1);

        registry.stop(&key()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_yield_one_collector() {
        let registry = CollectorRegistry::new();
        let fetcher = Arc::new(HangingFetcher::default());
        let store = store();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let fetcher = fetcher.clone();
                let store = store.clone();
                tokio::spawn(async move { registry.start(key(), 0, fetcher, store, settings()) })
            })
            .collect();
        let states: Vec<CollectorState> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert!(states.iter().all(|s| s.run_id == states[0].run_id));
        assert_eq!(registry.list().len(), 1);
        wait_until(|| fetcher.calls.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        registry.stop(&key()).await;
    }

    #[tokio::test]
    async fn stop_interrupts_an_in_flight_fetch() {
        let registry = CollectorRegistry::new();
        let fetcher = Arc::new(HangingFetcher::default());
        let mut slow = settings();
        slow.fetch_timeout = Duration::from_secs(60);
        registry.start(key(), 0, fetcher.clone(), store(), slow);
        wait_until(|| fetcher.calls.load(Ordering::SeqCst) == 1).await;

        let stopped = tokio::time::timeout(Duration::from_secs(1), registry.stop(&key()))
            .await
            .expect("stop must not wait for the fetch")
            .unwrap();
        assert_eq!(stopped.status, CollectorStatus::Stopped);
        assert!(registry.list().is_empty());
        assert_eq!(registry.status(&key()).unwrap().status, CollectorStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let registry = CollectorRegistry::new();
        assert!(registry.stop(&key()).await.is_none());

        let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
        registry.start(key(), 0, fetcher, store(), settings());
        let first = registry.stop(&key()).await.unwrap();
        let again = registry.stop(&key()).await.unwrap();
        assert_eq!(first.run_id, again.run_id);
        assert_eq!(again.status, CollectorStatus::Stopped);
    }

    #[tokio::test]
    async fn collected_candles_reach_the_store() {
        let registry = CollectorRegistry::new();
        let store = store();
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(vec![
            candle(1),
            candle(2),
            candle(3),
        ])]));
        registry.start(key(), MIN, fetcher.clone(), store.clone(), settings());

        wait_until(|| registry.status(&key()).unwrap().candles_merged == 3).await;
        let state = registry.status(&key()).unwrap();
        assert_eq!(state.status, CollectorStatus::Running);
        assert_eq!(state.cursor, 4 * MIN);
        assert_eq!(state.last_fetched_ts, Some(3 * MIN));

        let got = store.query(&key(), Since::From(0), 10).unwrap();
        assert_eq!(got.len(), 3);

        // Caught-up cursor is used for the follow-up fetch.
        wait_until(|| fetcher.call_count() >= 2).await;
        assert_eq!(fetcher.calls.lock()[1].1, 4 * MIN);
        registry.stop(&key()).await;
    }

    #[tokio::test]
    async fn rate_limits_back_off_then_recover() {
        let registry = CollectorRegistry::new();
        let store = store();
        let limited = || Err(FetchError::RateLimited("429".into()));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            limited(),
            limited(),
            limited(),
            Ok(vec![candle(7)]),
        ]));
        let policy = settings().backoff;
        registry.start(key(), 7 * MIN, fetcher.clone(), store.clone(), settings());

        wait_until(|| registry.status(&key()).unwrap().candles_merged == 1).await;
        let state = registry.status(&key()).unwrap();
        assert_eq!(state.status, CollectorStatus::Running);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.current_backoff_ms, 0);
        assert_eq!(store.load(&key()).unwrap().len(), 1);

        let calls = fetcher.calls.lock().clone();
        assert!(calls.len() >= 4);
        for n in 1..4 {
            let gap = calls[n].0 - calls[n - 1].0;
            assert!(gap >= policy.delay_for(n as u32), "retry {n} came too early");
        }
        registry.stop(&key()).await;
    }

    #[tokio::test]
    async fn failures_show_up_as_backoff() {
        let registry = CollectorRegistry::new();
        let script = (0..50)
            .map(|_| Err(FetchError::Network("connection reset".into())))
            .collect();
        let fetcher = Arc::new(ScriptedFetcher::new(script));
        registry.start(key(), 0, fetcher, store(), settings());

        wait_until(|| registry.status(&key()).unwrap().consecutive_failures >= 2).await;
        let state = registry.status(&key()).unwrap();
        assert_eq!(state.status, CollectorStatus::Backoff);
        assert!(state.current_backoff_ms >= 10);
        assert_eq!(state.last_error.as_deref(), Some("network error: connection reset"));
        registry.stop(&key()).await;
    }

    #[tokio::test]
    async fn unusable_batches_back_off_instead_of_spinning() {
        let registry = CollectorRegistry::new();
        let store = store();
        let script = (0..50)
            .map(|n| Ok(vec![Candle::new(n * MIN + 7, 1.0, 2.0, 0.5, 1.5, 3.0)]))
            .collect();
        let fetcher = Arc::new(ScriptedFetcher::new(script));
        registry.start(key(), 0, fetcher, store.clone(), settings());

        wait_until(|| registry.status(&key()).unwrap().consecutive_failures >= 2).await;
        let state = registry.status(&key()).unwrap();
        assert_eq!(state.status, CollectorStatus::Backoff);
        assert_eq!(state.cursor, 0);
        assert_eq!(
            state.last_error.as_deref(),
            Some("upstream returned 1 candles, none usable (1 misaligned, 0 invalid)")
        );
        assert!(store.load(&key()).unwrap().is_empty());
        registry.stop(&key()).await;
    }

    #[tokio::test]
    async fn slow_fetch_counts_as_timeout() {
        let registry = CollectorRegistry::new();
        let fetcher = Arc::new(ScriptedFetcher {
            delay: Some(Duration::from_millis(500)),
            ..Default::default()
        });
        let mut quick = settings();
        quick.fetch_timeout = Duration::from_millis(20);
        registry.start(key(), 0, fetcher, store(), quick);

        wait_until(|| registry.status(&key()).unwrap().consecutive_failures >= 1).await;
        let state = registry.status(&key()).unwrap();
        assert_eq!(state.last_error.as_deref(), Some("fetch timed out after 20 ms"));
        registry.stop(&key()).await;
    }

    #[tokio::test]
    async fn invalid_asset_stops_with_sticky_error() {
        let registry = CollectorRegistry::new();
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Err(FetchError::InvalidAsset(
            "NOPEUSDT".into(),
        ))]));
        registry.start(key(), 0, fetcher.clone(), store(), settings());

        wait_until(|| registry.list().is_empty()).await;
        let state = registry.status(&key()).unwrap();
        assert_eq!(state.status, CollectorStatus::Stopped);
        assert_eq!(state.last_error.as_deref(), Some("invalid asset: NOPEUSDT"));
        assert_eq!(fetcher.call_count(), 1);

        // A fresh start replaces the tombstone.
        let restarted = registry.start(key(), 0, fetcher, store(), settings());
        assert_ne!(restarted.run_id, state.run_id);
        assert!(registry.status(&key()).unwrap().last_error.is_none());
        registry.stop(&key()).await;
    }

    #[tokio::test]
    async fn conflicting_batch_is_retried_without_touching_store() {
        let registry = CollectorRegistry::new();
        let store = store();
        let mut twin = candle(2);
        twin.close = 1.9;
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Ok(vec![candle(2), twin]),
            Ok(vec![candle(2)]),
        ]));
        registry.start(key(), 2 * MIN, fetcher, store.clone(), settings());

        wait_until(|| registry.status(&key()).unwrap().candles_merged == 1).await;
        let got = store.load(&key()).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].close, 1.5);
        registry.stop(&key()).await;
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let registry = CollectorRegistry::new();
        let fetcher = Arc::new(HangingFetcher::default());
        let store = store();
        for asset in ["BTCUSDT", "ETHUSDT", "SOLUSDT"] {
            let k = TimeframeKey::new("test", asset, "1m".parse().unwrap()).unwrap();
            registry.start(k, 0, fetcher.clone(), store.clone(), settings());
        }
        assert_eq!(registry.list().len(), 3);

        registry.shutdown().await;
        assert!(registry.list().is_empty());
        let eth = TimeframeKey::new("test", "ETHUSDT", "1m".parse().unwrap()).unwrap();
        assert_eq!(registry.status(&eth).unwrap().status, CollectorStatus::Stopped);
    }
}
