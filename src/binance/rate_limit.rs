// =============================================================================
// Request-Weight Tracker: keeps kline fetches under Binance's weight budget
// =============================================================================
//
// Binance allows 1200 request weight per minute per IP (we hard-cap ourselves
// at 1000). Every response carries `X-MBX-USED-WEIGHT-1M`; the tracker keeps
// the latest value together with the minute it was observed in, so a reading
// from a previous minute counts as zero without needing a reset timer.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;

const MINUTE_MS: i64 = 60_000;

/// Lock-free tracker shared by every collector using one Binance fetcher.
pub struct WeightTracker {
    used_weight_1m: AtomicU32,
    observed_minute: AtomicI64,
}

impl WeightTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            observed_minute: AtomicI64::new(0),
        }
    }

    /// Record the weight reported by a response received at `now_ms`.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap, now_ms: i64) {
        let Some(w) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };
        self.record(w, now_ms);
    }

    fn record(&self, weight: u32, now_ms: i64) {
        let prev = self.used_at(now_ms);
        self.used_weight_1m.store(weight, Ordering::Relaxed);
        self.observed_minute
            .store(now_ms.div_euclid(MINUTE_MS), Ordering::Relaxed);

        if weight >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = weight, "request weight updated from header");
    }

    /// Weight used in the minute containing `now_ms`.
    pub fn used_at(&self, now_ms: i64) -> u32 {
        if self.observed_minute.load(Ordering::Relaxed) != now_ms.div_euclid(MINUTE_MS) {
            return 0;
        }
        self.used_weight_1m.load(Ordering::Relaxed)
    }

    /// Whether `weight` more can be spent right now without crossing the
    /// hard limit.
    pub fn can_send_request(&self, weight: u32, now_ms: i64) -> bool {
        let current = self.used_at(now_ms);
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked, would exceed weight limit"
            );
        }
        allowed
    }
}

impl Default for WeightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WeightTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("observed_minute", &self.observed_minute.load(Ordering::Relaxed))
            .finish()
    }
}
