// =============================================================================
// Runtime Configuration: Hub settings loaded at startup
// =============================================================================
//
// Every tunable of the hub lives here: where candles are cached, where the
// API listens, and the timing knobs shared by all collectors.
//
// All fields carry `#[serde(default)]` so that a partial (or empty) config
// file still loads. A handful of settings can be overridden from the
// environment after loading.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::collector::{BackoffPolicy, CollectorSettings};

/// Cache directory override.
pub const ENV_CACHE_DIR: &str = "GENTRADE_CACHE_DIR";
/// API bind address override.
pub const ENV_BIND_ADDR: &str = "HUB_BIND_ADDR";
/// Binance REST endpoint override.
pub const ENV_BINANCE_BASE_URL: &str = "BINANCE_BASE_URL";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_cache_dir() -> Option<String> {
    Some("cache".to_string())
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_batch_limit() -> u32 {
    1000
}

fn default_max_query_limit() -> usize {
    1000
}

fn default_binance_base_url() -> String {
    "https://api.binance.com".to_string()
}

// =============================================================================
// HubConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Root of the on-disk candle cache, `./cache` unless configured. An
    /// explicit `null` keeps candles in memory only.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: Option<String>,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Pause between collector cycles once a series is caught up.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on a single upstream fetch.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Candles requested per upstream call (Binance caps this at 1000).
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,

    /// Most candles one range read may return.
    #[serde(default = "default_max_query_limit")]
    pub max_query_limit: usize,

    #[serde(default = "default_binance_base_url")]
    pub binance_base_url: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            bind_addr: default_bind_addr(),
            poll_interval_ms: default_poll_interval_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            batch_limit: default_batch_limit(),
            max_query_limit: default_max_query_limit(),
            binance_base_url: default_binance_base_url(),
        }
    }
}

impl HubConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read hub config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse hub config from {}", path.display()))?;

        info!(
            path = %path.display(),
            cache_dir = ?config.cache_dir,
            bind_addr = %config.bind_addr,
            "hub config loaded"
        );

        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup`; blank values are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(dir) = get(ENV_CACHE_DIR) {
            self.cache_dir = Some(dir);
        }
        if let Some(addr) = get(ENV_BIND_ADDR) {
            self.bind_addr = addr;
        }
        if let Some(url) = get(ENV_BINANCE_BASE_URL) {
            self.binance_base_url = url;
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms.max(1))
    }

    /// Timing knobs handed to every collector.
    pub fn collector_settings(&self) -> CollectorSettings {
        let base = Duration::from_millis(self.backoff_base_ms.max(1));
        CollectorSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            fetch_timeout: self.fetch_timeout(),
            backoff: BackoffPolicy::new(base, Duration::from_millis(self.backoff_max_ms).max(base)),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.cache_dir.as_deref(), Some("cache"));
        assert_eq!(cfg.bind_addr, "0.0.0.0:3001");
        assert_eq!(cfg.batch_limit, 1000);
        assert_eq!(cfg.max_query_limit, 1000);
        assert_eq!(cfg.binance_base_url, "https://api.binance.com");
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: HubConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.poll_interval_ms, 5_000);
        assert_eq!(cfg.fetch_timeout_ms, 10_000);
        assert_eq!(cfg.backoff_max_ms, 60_000);
        assert_eq!(cfg.cache_dir.as_deref(), Some("cache"));
    }

    #[test]
    fn explicit_null_cache_dir_opts_into_memory() {
        let cfg: HubConfig = serde_json::from_str(r#"{ "cache_dir": null }"#).unwrap();
        assert!(cfg.cache_dir.is_none());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "cache_dir": "/var/cache/ohlcv", "poll_interval_ms": 250 }"#;
        let cfg: HubConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.cache_dir.as_deref(), Some("/var/cache/ohlcv"));
        assert_eq!(cfg.poll_interval_ms, 250);
        assert_eq!(cfg.backoff_base_ms, 1_000);
    }

    #[test]
    fn load_reads_file_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub_config.json");
        assert!(HubConfig::load(&path).is_err());

        std::fs::write(&path, r#"{ "batch_limit": 500 }"#).unwrap();
        let cfg = HubConfig::load(&path).unwrap();
        assert_eq!(cfg.batch_limit, 500);

        std::fs::write(&path, "not json").unwrap();
        let err = HubConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse hub config"));
    }

    #[test]
    fn env_overrides_replace_loaded_values() {
        let vars: HashMap<&str, &str> = [
            (ENV_CACHE_DIR, "/tmp/candles"),
            (ENV_BIND_ADDR, "  "),
            (ENV_BINANCE_BASE_URL, "http://localhost:9000"),
        ]
        .into_iter()
        .collect();

        let mut cfg = HubConfig::default();
        cfg.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(cfg.cache_dir.as_deref(), Some("/tmp/candles"));
        assert_eq!(cfg.bind_addr, "0.0.0.0:3001");
        assert_eq!(cfg.binance_base_url, "http://localhost:9000");
    }

    #[test]
    fn collector_settings_never_invert_backoff_bounds() {
        let cfg = HubConfig {
            backoff_base_ms: 5_000,
            backoff_max_ms: 100,
            poll_interval_ms: 0,
            ..HubConfig::default()
        };
        let settings = cfg.collector_settings();
        assert_eq!(settings.backoff.base, Duration::from_millis(5_000));
        assert_eq!(settings.backoff.max, Duration::from_millis(5_000));
        assert_eq!(settings.poll_interval, Duration::from_millis(1));
    }
}
