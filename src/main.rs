// =============================================================================
// market-pulse — Main Entry Point
// =============================================================================
//
// Starts the live trade ticker, the quote poller and the OHLC fetcher for the
// configured symbol, then serves the dashboard API. Missing provider keys do
// not stop the service: the affected component reports a configuration error.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod error;
mod fetcher;
mod financials;
mod format;
mod market_data;
mod providers;
mod runtime_config;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::market_data::{LiveTicker, TickerConfig};
use crate::runtime_config::{Credentials, RuntimeConfig};

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        market-pulse — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    info!(
        symbol = %config.default_symbol,
        time_range = %config.default_time_range,
        ticker_symbols = ?config.ticker_symbols,
        "Dashboard configuration"
    );

    let credentials = Credentials::from_env();
    credentials.warn_missing();
    let feed_token = credentials.finnhub.clone();

    // ── 2. Build shared state ────────────────────────────────────────────
    let http = providers::http_client(config.request_timeout())?;
    let ticker_config = TickerConfig::from_runtime(&config);
    let bind_addr = config.bind_addr.clone();

    let state = Arc::new(AppState::new(config, credentials, http));
    state.refresh_ohlc();

    // ── 3. Live trade ticker ─────────────────────────────────────────────
    let ticker = match LiveTicker::start(state.tape.clone(), ticker_config, feed_token.as_deref()) {
        Ok(ticker) => Some(ticker),
        Err(e) => {
            error!(error = %e, "Live ticker not started");
            state.push_error_with_code(e.to_string(), Some(e.kind().as_str().to_string()));
            None
        }
    };

    // ── 4. Start the API server ──────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Some(ticker) = ticker {
        ticker.shutdown().await;
    }
    state.shutdown().await;

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("market-pulse shut down complete.");
    Ok(())
}
