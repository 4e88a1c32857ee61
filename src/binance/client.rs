// =============================================================================
// Binance Klines Client: public market data behind the UpstreamFetcher seam
// =============================================================================
//
// Only the public `GET /api/v3/klines` endpoint is used, so no API key or
// request signing is involved. HTTP failures are classified into the fetch
// error kinds collectors understand: 429/418 are rate limits, code -1121 is
// an unknown symbol, everything else is a (retryable) network problem.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use super::rate_limit::WeightTracker;
use crate::error::FetchError;
use crate::types::{now_ms, Candle, TimeframeKey};
use crate::upstream::UpstreamFetcher;

/// Request weight of one klines call (any limit up to 1000).
const KLINES_WEIGHT: u32 = 2;
/// Largest page Binance serves per klines call.
pub const MAX_KLINES_LIMIT: u32 = 1000;
/// Binance error code for an unknown trading pair.
const INVALID_SYMBOL_CODE: i64 = -1121;

/// Binance spot klines fetcher.
pub struct BinanceFetcher {
    base_url: String,
    batch_limit: u32,
    request_timeout: Duration,
    client: reqwest::Client,
    weights: WeightTracker,
}

impl BinanceFetcher {
    /// Build a fetcher against `base_url` (normally `https://api.binance.com`).
    pub fn new(base_url: impl Into<String>, batch_limit: u32, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "BinanceFetcher initialised");

        Ok(Self {
            base_url,
            batch_limit: batch_limit.clamp(1, MAX_KLINES_LIMIT),
            request_timeout,
            client,
            weights: WeightTracker::new(),
        })
    }

    /// GET /api/v3/klines for `[from_ms, to_ms]`.
    #[instrument(skip(self), name = "binance::get_klines")]
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Candle>, FetchError> {
        if !self.weights.can_send_request(KLINES_WEIGHT, now_ms()) {
            return Err(FetchError::RateLimited(
                "local request-weight budget exhausted".into(),
            ));
        }

        let url = format!("{}/api/v3/klines", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("startTime", from_ms.to_string()),
                ("endTime", to_ms.to_string()),
                ("limit", self.batch_limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        self.weights.update_from_headers(resp.headers(), now_ms());
        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.transport_error(e))?;
        // Rate-limit and gateway errors may not carry a JSON body.
        let body: serde_json::Value =
            serde_json::from_str(&text).unwrap_or(serde_json::Value::Null);

        if !status.is_success() {
            let err = classify_failure(status, &body, symbol);
            warn!(symbol, %status, error = %err, "klines request rejected");
            return Err(err);
        }

        let candles = parse_klines(&body)?;
        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    fn transport_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.request_timeout.as_millis() as u64)
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl UpstreamFetcher for BinanceFetcher {
    fn name(&self) -> &str {
        "binance"
    }

    async fn fetch(
        &self,
        key: &TimeframeKey,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Candle>, FetchError> {
        let interval = key.timeframe().to_string();
        self.get_klines(key.asset(), &interval, from_ms, to_ms).await
    }
}

impl std::fmt::Debug for BinanceFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFetcher")
            .field("base_url", &self.base_url)
            .field("batch_limit", &self.batch_limit)
            .field("weights", &self.weights)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Response handling
// -----------------------------------------------------------------------------

/// Map a non-success response onto a fetch error kind.
fn classify_failure(status: StatusCode, body: &serde_json::Value, symbol: &str) -> FetchError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return FetchError::RateLimited(format!("HTTP {status}"));
    }
    let code = body.get("code").and_then(|c| c.as_i64());
    if code == Some(INVALID_SYMBOL_CODE) {
        return FetchError::InvalidAsset(symbol.to_string());
    }
    let msg = body.get("msg").and_then(|m| m.as_str()).unwrap_or("");
    FetchError::Network(format!("HTTP {status}: {msg}"))
}

/// Parse Binance's array-of-arrays klines payload.
///
/// Array indices used:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume
fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>, FetchError> {
    let raw = body
        .as_array()
        .ok_or_else(|| FetchError::Network("klines response is not an array".into()))?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = match entry.as_array() {
            Some(arr) if arr.len() >= 6 => arr,
            _ => {
                warn!("skipping malformed kline entry");
                continue;
            }
        };
        let Some(open_time) = arr[0].as_i64() else {
            warn!("skipping kline entry without open time");
            continue;
        };
        candles.push(Candle::new(
            open_time,
            parse_str_f64(&arr[1])?,
            parse_str_f64(&arr[2])?,
            parse_str_f64(&arr[3])?,
            parse_str_f64(&arr[4])?,
            parse_str_f64(&arr[5])?,
        ));
    }
    Ok(candles)
}

/// Binance sends prices as JSON strings; accept plain numbers too.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64, FetchError> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| FetchError::Network(format!("failed to parse '{s}' as f64")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(FetchError::Network(format!("expected string or number, got: {val}")))
    }
}
