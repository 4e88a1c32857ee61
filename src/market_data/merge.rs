// =============================================================================
// Merge: fold a fetched batch into an existing candle series
// =============================================================================
//
// Rules, in order:
//   1. Misaligned or malformed incoming candles are dropped and counted.
//   2. Two different candles for one timestamp inside the batch reject the
//      whole batch. Exact repeats collapse.
//   3. Timestamps already in the series keep the stored value, unless the
//      stored candle is the series' latest entry and was still open when it
//      was written. That one may be replaced by the fresher fetch.
//   4. Everything else is spliced in, keeping strict ascending order.
//
// The merge is pure: the caller decides whether to persist the result.
// =============================================================================

use serde::Serialize;
use tracing::warn;

use crate::error::{HubError, HubResult};
use crate::market_data::Timeframe;
use crate::types::Candle;

/// What a merge did with the incoming batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// New timestamps added to the series.
    pub inserted: usize,
    /// Whether the open latest candle was overwritten with a different value.
    pub replaced_latest: bool,
    /// Incoming candles whose timestamp was already settled in the series.
    pub duplicates: usize,
    pub misaligned: usize,
    pub invalid: usize,
    /// Newest timestamp among the accepted incoming candles.
    pub last_accepted_ts: Option<i64>,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.replaced_latest
    }
}

/// Merged series plus its report.
#[derive(Debug)]
pub struct MergeOutcome {
    pub candles: Vec<Candle>,
    pub report: MergeReport,
}

/// Merge `incoming` into the strictly ascending `existing` series.
///
/// `latest_open` says whether the last element of `existing` was stored
/// while its bucket was still open; only then may it be replaced.
pub fn merge(
    existing: &[Candle],
    incoming: Vec<Candle>,
    timeframe: Timeframe,
    latest_open: bool,
) -> HubResult<MergeOutcome> {
    let mut report = MergeReport::default();

    let mut batch: Vec<Candle> = Vec::with_capacity(incoming.len());
    for candle in incoming {
        if !timeframe.is_aligned(candle.timestamp) {
            report.misaligned += 1;
            continue;
        }
        if let Err(reason) = candle.validate() {
            warn!(%reason, "dropping malformed candle");
            report.invalid += 1;
            continue;
        }
        batch.push(candle);
    }
    if report.misaligned > 0 {
        warn!(
            count = report.misaligned,
            timeframe = %timeframe,
            "dropping candles not aligned to the timeframe"
        );
    }

    batch.sort_by_key(|c| c.timestamp);
    let mut deduped: Vec<Candle> = Vec::with_capacity(batch.len());
    for candle in batch {
        match deduped.last() {
            Some(prev) if prev.timestamp == candle.timestamp => {
                if *prev != candle {
                    return Err(HubError::validation(format!(
                        "batch carries conflicting candles for timestamp {}",
                        candle.timestamp
                    )));
                }
            }
            _ => deduped.push(candle),
        }
    }
    report.last_accepted_ts = deduped.last().map(|c| c.timestamp);

    let last_index = existing.len().checked_sub(1);
    let mut replacement: Option<Candle> = None;
    let mut fresh: Vec<Candle> = Vec::with_capacity(deduped.len());
    for candle in deduped {
        match existing.binary_search_by_key(&candle.timestamp, |c| c.timestamp) {
            Ok(idx) if Some(idx) == last_index && latest_open => {
                if existing[idx] != candle {
                    report.replaced_latest = true;
                    replacement = Some(candle);
                }
            }
            Ok(_) => report.duplicates += 1,
            Err(_) => fresh.push(candle),
        }
    }
    report.inserted = fresh.len();

    let mut merged = Vec::with_capacity(existing.len() + fresh.len());
    let mut pending = fresh.into_iter().peekable();
    for (idx, stored) in existing.iter().enumerate() {
        while let Some(next) = pending.next_if(|c| c.timestamp < stored.timestamp) {
            merged.push(next);
        }
        match (&replacement, Some(idx) == last_index) {
            (Some(newer), true) => merged.push(newer.clone()),
            _ => merged.push(stored.clone()),
        }
    }
    merged.extend(pending);

    Ok(MergeOutcome {
        candles: merged,
        report,
    })
}
