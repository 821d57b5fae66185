// =============================================================================
// Runtime Configuration — Service settings with atomic save
// =============================================================================
//
// All tunables for the market-pulse service live here: the ticker feed, the
// fetch defaults, provider endpoints and the API bind address. Provider
// credentials are deliberately NOT part of this file; they come from the
// environment (see `Credentials`).
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::market_data::trade_buffer::DEFAULT_TICKER_CAPACITY;
use crate::types::TimeRange;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_ticker_symbols() -> Vec<String> {
    vec![
        "AAPL".to_string(),
        "AMZN".to_string(),
        "BINANCE:BTCUSDT".to_string(),
    ]
}

fn default_ticker_capacity() -> usize {
    DEFAULT_TICKER_CAPACITY
}

fn default_feed_url() -> String {
    "wss://ws.finnhub.io".to_string()
}

fn default_symbol() -> String {
    "AAPL".to_string()
}

fn default_quote_refresh_secs() -> u64 {
    30
}

fn default_ohlc_limit() -> u32 {
    5000
}

fn default_news_days_back() -> u64 {
    7
}

fn default_news_limit() -> usize {
    5
}

fn default_finnhub_base_url() -> String {
    "https://finnhub.io/api/v1".to_string()
}

fn default_polygon_base_url() -> String {
    "https://api.polygon.io".to_string()
}

fn default_alpha_vantage_base_url() -> String {
    "https://www.alphavantage.co".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

// =============================================================================
// ReconnectPolicy
// =============================================================================

/// Bounded exponential backoff for the trade feed.
///
/// `max_attempts = 0` disables reconnection: the first connection error ends
/// the ticker session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Consecutive failed sessions tolerated before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first reconnect attempt.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt number `attempt` (1-based), or `None`
    /// once the attempt budget is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let shift = (attempt - 1).min(20);
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms);
        Some(Duration::from_millis(delay))
    }

    /// Minimum lifetime of a session before it counts as healthy and resets
    /// the attempt budget.
    pub fn healthy_session(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms.saturating_mul(2))
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the market-pulse service.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Live ticker ----------------------------------------------------------

    /// Symbols subscribed on the trade feed.
    #[serde(default = "default_ticker_symbols")]
    pub ticker_symbols: Vec<String>,

    /// Maximum number of trades kept for display.
    #[serde(default = "default_ticker_capacity")]
    pub ticker_capacity: usize,

    /// Trade feed WebSocket endpoint (the token is appended at connect time).
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    // --- Fetchers -------------------------------------------------------------

    /// Symbol selected when the service starts.
    #[serde(default = "default_symbol")]
    pub default_symbol: String,

    /// Chart range selected when the service starts.
    #[serde(default)]
    pub default_time_range: TimeRange,

    /// Period of the instant quote poller.
    #[serde(default = "default_quote_refresh_secs")]
    pub quote_refresh_secs: u64,

    /// `limit` sent with every aggregates request.
    #[serde(default = "default_ohlc_limit")]
    pub ohlc_limit: u32,

    /// Look-back window for company news.
    #[serde(default = "default_news_days_back")]
    pub news_days_back: u64,

    /// Number of news items returned to the dashboard.
    #[serde(default = "default_news_limit")]
    pub news_limit: usize,

    // --- Providers ------------------------------------------------------------

    #[serde(default = "default_finnhub_base_url")]
    pub finnhub_base_url: String,

    #[serde(default = "default_polygon_base_url")]
    pub polygon_base_url: String,

    #[serde(default = "default_alpha_vantage_base_url")]
    pub alpha_vantage_base_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // --- API ------------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ticker_symbols: default_ticker_symbols(),
            ticker_capacity: default_ticker_capacity(),
            feed_url: default_feed_url(),
            reconnect: ReconnectPolicy::default(),
            default_symbol: default_symbol(),
            default_time_range: TimeRange::default(),
            quote_refresh_secs: default_quote_refresh_secs(),
            ohlc_limit: default_ohlc_limit(),
            news_days_back: default_news_days_back(),
            news_limit: default_news_limit(),
            finnhub_base_url: default_finnhub_base_url(),
            polygon_base_url: default_polygon_base_url(),
            alpha_vantage_base_url: default_alpha_vantage_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            ticker_symbols = ?config.ticker_symbols,
            default_symbol = %config.default_symbol,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `MARKET_PULSE_SYMBOLS` and `MARKET_PULSE_BIND_ADDR` overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("MARKET_PULSE_SYMBOLS") {
            self.ticker_symbols = parse_symbol_list(&syms);
        }
        if let Ok(addr) = std::env::var("MARKET_PULSE_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr.trim().to_string();
            }
        }
        if self.ticker_symbols.is_empty() {
            warn!("no ticker symbols configured, restoring defaults");
            self.ticker_symbols = default_ticker_symbols();
        }
        if self.ticker_capacity == 0 {
            warn!("ticker_capacity of 0 is not usable, restoring default");
            self.ticker_capacity = default_ticker_capacity();
        }
    }

    pub fn quote_refresh_period(&self) -> Duration {
        Duration::from_secs(self.quote_refresh_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Split a comma-separated symbol list, uppercasing and dropping blanks.
pub fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// Credentials
// =============================================================================

pub const FINNHUB_KEY_VAR: &str = "FINNHUB_API_KEY";
pub const POLYGON_KEY_VAR: &str = "POLYGON_API_KEY";
pub const ALPHA_VANTAGE_KEY_VAR: &str = "ALPHA_VANTAGE_API_KEY";

/// Provider API keys read from the environment at start-up.
///
/// A key that is unset or blank is `None`; callers must fail fast on `None`
/// instead of sending a request with an empty token.
#[derive(Clone, Default)]
pub struct Credentials {
    pub finnhub: Option<String>,
    pub polygon: Option<String>,
    pub alpha_vantage: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self {
            finnhub: read_key(FINNHUB_KEY_VAR),
            polygon: read_key(POLYGON_KEY_VAR),
            alpha_vantage: read_key(ALPHA_VANTAGE_KEY_VAR),
        }
    }

    /// Log one warning per missing key.
    pub fn warn_missing(&self) {
        for (var, present) in [
            (FINNHUB_KEY_VAR, self.finnhub.is_some()),
            (POLYGON_KEY_VAR, self.polygon.is_some()),
            (ALPHA_VANTAGE_KEY_VAR, self.alpha_vantage.is_some()),
        ] {
            if !present {
                warn!(env_var = var, "provider credential missing, dependent features will report a configuration error");
            }
        }
    }
}

fn read_key(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mask = |k: &Option<String>| if k.is_some() { "<redacted>" } else { "<unset>" };
        f.debug_struct("Credentials")
            .field("finnhub", &mask(&self.finnhub))
            .field("polygon", &mask(&self.polygon))
            .field("alpha_vantage", &mask(&self.alpha_vantage))
            .finish()
    }
}
