// =============================================================================
// Candle Store: durable per-key candle series
// =============================================================================
//
// One series per TimeframeKey, loaded lazily from storage and kept as an
// immutable snapshot. Appends are serialised per key, merged on the side,
// written atomically and only then published, so readers always see either
// the old or the new series in full.
//
// A latest candle written while its bucket was open is flagged in the index.
// The first append after that bucket closes may revise it once, and always
// clears the flag.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{HubError, HubResult};
use crate::market_data::merge::{merge, MergeReport};
use crate::market_data::storage::SeriesStorage;
use crate::types::{now_ms, Candle, TimeframeKey};

/// Version tag written into every persisted series.
const SERIES_FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Summary of a stored series, persisted next to the candles so range
/// queries can be answered without scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesIndex {
    pub first_ts: Option<i64>,
    pub last_ts: Option<i64>,
    pub count: usize,
    /// The latest candle was written while its bucket was still open.
    #[serde(default)]
    pub latest_open: bool,
}

/// Where a range query starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Since {
    /// The most recent `limit` candles.
    Latest,
    /// Candles with `timestamp >= ts`.
    From(i64),
}

impl Since {
    /// Boundary callers send a signed integer; negative means "latest".
    pub fn from_raw(raw: i64) -> Self {
        if raw < 0 {
            Self::Latest
        } else {
            Self::From(raw)
        }
    }
}

#[derive(Debug, Default)]
struct Series {
    index: SeriesIndex,
    candles: Vec<Candle>,
}

#[derive(Serialize)]
struct PersistedRef<'a> {
    version: u32,
    index: &'a SeriesIndex,
    candles: &'a [Candle],
}

#[derive(Deserialize)]
struct Persisted {
    version: u32,
    index: SeriesIndex,
    candles: Vec<Candle>,
}

/// Per-key slot. Readers clone the snapshot `Arc` and drop the lock at once;
/// an append builds the next snapshot on the side and swaps it in only after
/// it is durably written.
#[derive(Debug)]
struct Slot {
    snapshot: RwLock<Arc<Series>>,
    append_lock: Mutex<()>,
}

// ---------------------------------------------------------------------------
// CandleStore
// ---------------------------------------------------------------------------

/// Append-only candle series per [`TimeframeKey`], loaded lazily from
/// storage and persisted on every merge that changes something.
pub struct CandleStore {
    storage: Arc<dyn SeriesStorage>,
    slots: RwLock<HashMap<TimeframeKey, Arc<Slot>>>,
}

impl CandleStore {
    pub fn new(storage: Arc<dyn SeriesStorage>) -> Self {
        Self {
            storage,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Get or lazily load the slot for `key`. The storage read happens
    /// outside the map lock; a concurrent loader of the same key wins or
    /// loses the insert, and both end up sharing one slot.
    fn slot(&self, key: &TimeframeKey) -> HubResult<Arc<Slot>> {
        if let Some(slot) = self.slots.read().get(key) {
            return Ok(slot.clone());
        }

        let series = self.read_series(key)?;
        let slot = Arc::new(Slot {
            snapshot: RwLock::new(Arc::new(series)),
            append_lock: Mutex::new(()),
        });
        let mut map = self.slots.write();
        Ok(map.entry(key.clone()).or_insert(slot).clone())
    }

    fn read_series(&self, key: &TimeframeKey) -> HubResult<Series> {
        let Some(bytes) = self.storage.read(key)? else {
            debug!(key = %key, "no stored series, starting empty");
            return Ok(Series::default());
        };
        let persisted: Persisted = serde_json::from_slice(&bytes)
            .map_err(|e| HubError::storage(format!("corrupt series for {key}: {e}")))?;
        if persisted.version != SERIES_FORMAT_VERSION {
            return Err(HubError::storage(format!(
                "series for {key} has unsupported format version {}",
                persisted.version
            )));
        }
        info!(key = %key, count = persisted.candles.len(), "series loaded from storage");
        Ok(Series {
            index: persisted.index,
            candles: persisted.candles,
        })
    }

    fn snapshot(&self, key: &TimeframeKey) -> HubResult<Arc<Series>> {
        let slot = self.slot(key)?;
        let snapshot = slot.snapshot.read().clone();
        Ok(snapshot)
    }

    /// The whole stored series for `key`; empty when nothing is stored.
    pub fn load(&self, key: &TimeframeKey) -> HubResult<Vec<Candle>> {
        Ok(self.snapshot(key)?.candles.clone())
    }

    /// Index of the stored series without copying candles.
    pub fn info(&self, key: &TimeframeKey) -> HubResult<SeriesIndex> {
        Ok(self.snapshot(key)?.index.clone())
    }

    /// Merge `candles` into the series for `key` and persist the result.
    pub fn append(&self, key: &TimeframeKey, candles: Vec<Candle>) -> HubResult<MergeReport> {
        self.append_at(key, candles, now_ms())
    }

    /// [`append`](Self::append) with an explicit clock, which decides whether
    /// the new latest candle counts as still open.
    pub fn append_at(
        &self,
        key: &TimeframeKey,
        candles: Vec<Candle>,
        now: i64,
    ) -> HubResult<MergeReport> {
        let slot = self.slot(key)?;
        let _guard = slot.append_lock.lock();

        let current = slot.snapshot.read().clone();
        let timeframe = key.timeframe();
        // A candle stored while open may take one more revision: the first
        // append after its bucket closes carries the final values. That append
        // settles it whether or not the values differ.
        let outcome = merge(&current.candles, candles, timeframe, current.index.latest_open)?;
        if !outcome.report.changed() {
            let still_open = current
                .index
                .last_ts
                .is_some_and(|ts| timeframe.is_open_at(ts, now));
            if current.index.latest_open && !still_open {
                let index = SeriesIndex {
                    latest_open: false,
                    ..current.index.clone()
                };
                self.persist(key, &slot, index, current.candles.clone())?;
                debug!(key = %key, "latest candle settled");
            }
            return Ok(outcome.report);
        }

        let merged = outcome.candles;
        let index = SeriesIndex {
            first_ts: merged.first().map(|c| c.timestamp),
            last_ts: merged.last().map(|c| c.timestamp),
            count: merged.len(),
            latest_open: merged
                .last()
                .is_some_and(|c| timeframe.is_open_at(c.timestamp, now)),
        };
        let count = index.count;
        self.persist(key, &slot, index, merged)?;

        debug!(
            key = %key,
            inserted = outcome.report.inserted,
            replaced_latest = outcome.report.replaced_latest,
            count,
            "series appended"
        );
        Ok(outcome.report)
    }

    /// Write the next series durably, then publish it to readers. Callers
    /// hold the slot's append lock.
    fn persist(
        &self,
        key: &TimeframeKey,
        slot: &Slot,
        index: SeriesIndex,
        candles: Vec<Candle>,
    ) -> HubResult<()> {
        let bytes = serde_json::to_vec(&PersistedRef {
            version: SERIES_FORMAT_VERSION,
            index: &index,
            candles: &candles,
        })
        .map_err(|e| HubError::storage(format!("failed to encode series for {key}: {e}")))?;
        self.storage.write_atomic(key, &bytes)?;
        *slot.snapshot.write() = Arc::new(Series { index, candles });
        Ok(())
    }

    /// Up to `limit` candles in ascending order, starting at `since` or
    /// ending at the newest candle for [`Since::Latest`].
    pub fn query(&self, key: &TimeframeKey, since: Since, limit: usize) -> HubResult<Vec<Candle>> {
        let series = self.snapshot(key)?;
        let candles = &series.candles;
        if limit == 0 || candles.is_empty() {
            return Ok(Vec::new());
        }

        let start = match since {
            Since::Latest => candles.len().saturating_sub(limit),
            Since::From(ts) => match (series.index.first_ts, series.index.last_ts) {
                (_, Some(last)) if ts > last => return Ok(Vec::new()),
                (Some(first), _) if ts <= first => 0,
                _ => candles.partition_point(|c| c.timestamp < ts),
            },
        };
        let end = start.saturating_add(limit).min(candles.len());
        Ok(candles[start..end].to_vec())
    }
}
