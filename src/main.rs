// =============================================================================
// OHLCV Hub: Main Entry Point
// =============================================================================
//
// Serves cached candles over HTTP and keeps them fresh with one background
// collector per (market, asset, timeframe). Collectors are started on demand
// through the API; on Ctrl-C every collector is stopped before exit.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod binance;
mod cache_service;
mod collector;
mod error;
mod market_data;
mod runtime_config;
mod types;
mod upstream;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::BinanceFetcher;
use crate::cache_service::CacheService;
use crate::market_data::{CandleStore, FileStorage, MemoryStorage, SeriesStorage};
use crate::runtime_config::HubConfig;

const CONFIG_PATH: &str = "hub_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("OHLCV hub starting up");

    let mut config = HubConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        HubConfig::default()
    });
    config.apply_env();

    // ── 2. Candle store ──────────────────────────────────────────────────
    let storage: Arc<dyn SeriesStorage> = match &config.cache_dir {
        Some(dir) => {
            info!(cache_dir = %dir, "Caching candles on disk");
            Arc::new(FileStorage::new(dir))
        }
        None => {
            warn!(
                "cache_dir is null in {}, candles live in memory only",
                CONFIG_PATH
            );
            Arc::new(MemoryStorage::new())
        }
    };
    let store = Arc::new(CandleStore::new(storage));

    // ── 3. Upstream markets ──────────────────────────────────────────────
    let binance = BinanceFetcher::new(
        config.binance_base_url.clone(),
        config.batch_limit,
        config.fetch_timeout(),
    )
    .context("failed to build Binance fetcher")?;

    let service = Arc::new(
        CacheService::new(store, config.collector_settings())
            .with_market("binance", Arc::new(binance))
            .with_max_query_limit(config.max_query_limit),
    );

    // ── 4. API server ────────────────────────────────────────────────────
    let app = api::rest::router(service.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
        .context("API server failed")?;

    // ── 5. Cleanup ───────────────────────────────────────────────────────
    service.shutdown().await;
    info!("All collectors stopped, goodbye");
    Ok(())
}
