// =============================================================================
// Collectors: background candle collection per TimeframeKey
// =============================================================================
//
// Life-cycle:
//   Running  ->  Backoff   (retryable fetch/storage failure)
//   Backoff  ->  Running   (next successful cycle)
//   any      ->  Stopped   (explicit stop, or upstream says the asset is invalid)
//
// Each collector owns its status record; the registry and callers only ever
// read snapshots of it.
// =============================================================================

pub mod registry;
pub mod worker;

use std::time::Duration;

use serde::Serialize;

use crate::types::TimeframeKey;

pub use registry::CollectorRegistry;

/// Collector life-cycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CollectorStatus {
    Stopped,
    Running,
    Backoff,
}

impl std::fmt::Display for CollectorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Running => write!(f, "Running"),
            Self::Backoff => write!(f, "Backoff"),
        }
    }
}

/// Point-in-time view of one collector.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorState {
    pub key: TimeframeKey,
    /// UUID v4 of this collector instance.
    pub run_id: String,
    pub status: CollectorStatus,
    /// Open time of the next bucket to fetch.
    pub cursor: i64,
    /// Newest candle timestamp seen in a successful fetch.
    pub last_fetched_ts: Option<i64>,
    pub consecutive_failures: u32,
    /// Delay of the backoff currently in effect, zero while running.
    pub current_backoff_ms: u64,
    /// Candles inserted by this collector instance.
    pub candles_merged: u64,
    /// Fatal error for a collector that stopped itself, otherwise the most
    /// recent retryable error.
    pub last_error: Option<String>,
    pub started_at: i64,
    pub last_success_at: Option<i64>,
}

/// Exponential retry delay: `base * 2^(failures - 1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay after `failures` consecutive failures (zero for none).
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (failures - 1).min(20);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Timing knobs shared by every collector.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub backoff: BackoffPolicy,
}
