// =============================================================================
// Shared types used across the OHLCV hub
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};
use crate::market_data::Timeframe;

/// Current wall-clock time as exchange epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A single OHLCV candle. `timestamp` is the bucket open time in epoch ms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Check the field invariants: everything finite, non-negative volume and
    /// a high/low envelope that contains both open and close.
    pub fn validate(&self) -> Result<(), String> {
        let fields = [self.open, self.high, self.low, self.close, self.volume];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(format!("candle {} has a non-finite field", self.timestamp));
        }
        if self.volume < 0.0 {
            return Err(format!("candle {} has negative volume", self.timestamp));
        }
        if self.high < self.open.max(self.close) {
            return Err(format!("candle {} high is below open/close", self.timestamp));
        }
        if self.low > self.open.min(self.close) {
            return Err(format!("candle {} low is above open/close", self.timestamp));
        }
        Ok(())
    }
}

/// Identifies one candle series and at most one collector:
/// `(market, asset, timeframe)`.
///
/// Asset symbols are normalised on construction (`btc_usdt`, `BTC/USDT` and
/// `BTCUSDT` all name the same series). After normalisation the market id is
/// `[a-z0-9_-]+` and the asset `[A-Z0-9]+`, so distinct keys never collide
/// once used as path components.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct TimeframeKey {
    market_id: String,
    asset: String,
    timeframe: Timeframe,
}

impl TimeframeKey {
    pub fn new(market_id: impl Into<String>, asset: &str, timeframe: Timeframe) -> HubResult<Self> {
        let market_id = market_id.into().trim().to_lowercase();
        if market_id.is_empty()
            || !market_id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(HubError::validation(format!("invalid market id '{market_id}'")));
        }

        let normalised = asset
            .chars()
            .filter(|c| !matches!(c, '_' | '/' | '-' | ' '))
            .collect::<String>()
            .to_uppercase();
        if normalised.is_empty() || !normalised.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(HubError::validation(format!("invalid asset '{asset}'")));
        }

        Ok(Self {
            market_id,
            asset: normalised,
            timeframe,
        })
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }
}

impl std::fmt::Display for TimeframeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.market_id, self.asset, self.timeframe)
    }
}
