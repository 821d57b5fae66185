// =============================================================================
// Central Application State — market-pulse dashboard service
// =============================================================================
//
// Ties the dashboard components together: the live ticker tape, the quote
// poller, the OHLC fetcher and the provider clients used by the pass-through
// endpoints. Each component owns its own state; AppState only composes them
// and builds the unified snapshot for the REST API and the WebSocket feed.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot locks for the few fields AppState owns itself.
//   - No lock is held across an `.await`.
// =============================================================================

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use crate::fetcher::{OhlcFetcher, OhlcOptions, QuotePoller, QuoteView};
use crate::market_data::{TickerSnapshot, TradeTape};
use crate::providers::finnhub::Quote;
use crate::providers::polygon::AggregateBar;
use crate::providers::{AlphaVantageClient, FinnhubClient, PolygonClient};
use crate::runtime_config::{Credentials, RuntimeConfig};
use crate::types::{normalize_symbol, FetchState, TimeRange};

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Error category (`configuration`, `transport`, ...).
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// AppState
// =============================================================================

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Bumped on changes AppState makes itself (selection, error log). The
    /// component versions are added on top in `current_state_version`.
    pub state_version: AtomicU64,

    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,

    /// Currently connected WebSocket clients.
    pub ws_clients: AtomicUsize,

    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    // ── Providers ───────────────────────────────────────────────────────
    pub finnhub: FinnhubClient,
    pub polygon: PolygonClient,
    pub alpha_vantage: AlphaVantageClient,

    // ── Dashboard components ────────────────────────────────────────────
    pub tape: Arc<TradeTape>,
    pub quote_poller: Mutex<Option<QuotePoller>>,
    /// Last quote version seen before the poller was stopped.
    quote_version_final: AtomicU64,
    pub ohlc: Arc<OhlcFetcher>,
    pub time_range: RwLock<TimeRange>,

    // ── Error Log ───────────────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the dashboard state and start the quote poller.
    ///
    /// Must be called within a tokio runtime. The OHLC fetcher starts Idle;
    /// call [`AppState::refresh_ohlc`] to load the first series.
    pub fn new(config: RuntimeConfig, credentials: Credentials, http: reqwest::Client) -> Self {
        let finnhub = FinnhubClient::new(
            http.clone(),
            config.finnhub_base_url.clone(),
            credentials.finnhub,
        );
        let polygon = PolygonClient::new(
            http.clone(),
            config.polygon_base_url.clone(),
            credentials.polygon,
        );
        let alpha_vantage = AlphaVantageClient::new(
            http,
            config.alpha_vantage_base_url.clone(),
            credentials.alpha_vantage,
        );

        let symbol = normalize_symbol(&config.default_symbol);
        let time_range = config.default_time_range;
        let today = Utc::now().date_naive();

        let quote_poller = QuotePoller::spawn(
            Arc::new(finnhub.clone()),
            &symbol,
            config.quote_refresh_period(),
        );
        let ohlc = OhlcFetcher::new(
            Arc::new(polygon.clone()),
            &symbol,
            OhlcOptions::for_range(time_range, today),
            config.ohlc_limit,
        );

        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            ws_clients: AtomicUsize::new(0),
            tape: Arc::new(TradeTape::new(config.ticker_capacity)),
            runtime_config: Arc::new(RwLock::new(config)),
            finnhub,
            polygon,
            alpha_vantage,
            quote_poller: Mutex::new(Some(quote_poller)),
            quote_version_final: AtomicU64::new(0),
            ohlc: Arc::new(ohlc),
            time_range: RwLock::new(time_range),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Combined version of AppState and every component. Never decreases,
    /// also across shutdown.
    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
            + self.tape.version()
            + self.quote_version()
            + self.ohlc.version()
    }

    fn quote_version(&self) -> u64 {
        self.quote_poller
            .lock()
            .as_ref()
            .map(QuotePoller::version)
            .unwrap_or_else(|| self.quote_version_final.load(Ordering::SeqCst))
    }

    // ── Error Logging ───────────────────────────────────────────────────

    pub fn push_error(&self, msg: String) {
        self.push_error_with_code(msg, None);
    }

    /// Record an error. The log is capped at [`MAX_RECENT_ERRORS`]; oldest
    /// entries are evicted first.
    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.increment_version();
    }

    // ── Selection ───────────────────────────────────────────────────────

    pub fn selected_symbol(&self) -> String {
        self.ohlc.symbol()
    }

    pub fn selected_time_range(&self) -> TimeRange {
        *self.time_range.read()
    }

    /// Select the dashboard symbol. Both fetchers refetch when it changed.
    /// Returns the normalised symbol.
    pub fn select_symbol(&self, raw: &str) -> String {
        let symbol = normalize_symbol(raw);

        let quote_changed = self
            .quote_poller
            .lock()
            .as_ref()
            .map(|p| p.set_symbol(&symbol))
            .unwrap_or(false);
        let ohlc_changed = self.ohlc.update_symbol(&symbol);
        if ohlc_changed {
            self.spawn_ohlc_refresh();
        }

        if quote_changed || ohlc_changed {
            self.runtime_config.write().default_symbol = symbol.clone();
            self.increment_version();
            info!(symbol = %symbol, "dashboard symbol selected");
        }
        symbol
    }

    /// Select the chart range. The OHLC series refetches when it changed.
    pub fn set_time_range(&self, range: TimeRange) -> bool {
        {
            let mut current = self.time_range.write();
            if *current == range {
                return false;
            }
            *current = range;
        }
        self.runtime_config.write().default_time_range = range;
        self.increment_version();
        info!(range = %range, "time range selected");

        self.refresh_ohlc();
        true
    }

    /// Manual quote refresh.
    pub fn refresh_quote(&self) {
        if let Some(poller) = self.quote_poller.lock().as_ref() {
            poller.refresh();
        }
    }

    /// Refetch the OHLC series for the current range, re-anchored on today.
    pub fn refresh_ohlc(&self) {
        let options = OhlcOptions::for_range(self.selected_time_range(), Utc::now().date_naive());
        self.ohlc.update_options(options);
        self.spawn_ohlc_refresh();
    }

    fn spawn_ohlc_refresh(&self) {
        let ohlc = self.ohlc.clone();
        tokio::spawn(async move {
            ohlc.refresh().await;
        });
    }

    // ── Component snapshots ─────────────────────────────────────────────

    /// Symbol the quote poller follows, with the state of its quote.
    pub fn quote_snapshot(&self) -> (String, FetchState<Quote>) {
        let snapshot = self.quote_poller.lock().as_ref().map(QuotePoller::snapshot);
        snapshot.unwrap_or_else(|| (self.selected_symbol(), FetchState::idle()))
    }

    pub fn quote_state(&self) -> FetchState<Quote> {
        self.quote_snapshot().1
    }

    pub fn quote_view(&self) -> Option<QuoteView> {
        self.quote_poller.lock().as_ref().and_then(QuotePoller::view)
    }

    /// Selected symbol with the state of its OHLC series.
    pub fn ohlc_snapshot(&self) -> (String, FetchState<Vec<AggregateBar>>) {
        self.ohlc.snapshot()
    }

    pub fn ohlc_state(&self) -> FetchState<Vec<AggregateBar>> {
        self.ohlc.state()
    }

    pub fn ticker(&self) -> TickerSnapshot {
        self.tape.snapshot()
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Stop the quote poller and close the OHLC cell. Later results from
    /// in-flight fetches are dropped.
    pub async fn shutdown(&self) {
        let poller = {
            let mut slot = self.quote_poller.lock();
            if let Some(poller) = slot.as_ref() {
                self.quote_version_final
                    .store(poller.version(), Ordering::SeqCst);
            }
            slot.take()
        };
        if let Some(poller) = poller {
            poller.shutdown().await;
        }
        self.ohlc.close();
        if self.ws_clients.load(Ordering::Relaxed) > 0 {
            warn!(
                clients = self.ws_clients.load(Ordering::Relaxed),
                "shutting down with WebSocket clients connected"
            );
        }
        info!("dashboard components stopped");
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Build the complete dashboard snapshot.
    ///
    /// This is the payload of `GET /api/v1/state` and of every WebSocket
    /// push.
    pub fn build_snapshot(&self) -> DashboardSnapshot {
        let now = Utc::now();
        let (symbol, ohlc) = self.ohlc.snapshot();
        let (quote_symbol, quote) = self.quote_snapshot();
        let quote_view = quote.data.as_ref().map(|q| QuoteView::new(&quote_symbol, q));

        DashboardSnapshot {
            state_version: self.current_state_version(),
            ws_sequence_number: self.ws_sequence_number.load(Ordering::Relaxed),
            server_time: now.timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            symbol,
            time_range: self.selected_time_range(),
            ticker: self.tape.snapshot(),
            quote_symbol,
            quote,
            quote_view,
            ohlc,
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

/// Full dashboard snapshot sent to the front-end.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub state_version: u64,
    pub ws_sequence_number: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub symbol: String,
    pub time_range: TimeRange,
    pub ticker: TickerSnapshot,
    /// Symbol `quote` belongs to.
    pub quote_symbol: String,
    pub quote: FetchState<Quote>,
    pub quote_view: Option<QuoteView>,
    pub ohlc: FetchState<Vec<AggregateBar>>,
    pub recent_errors: Vec<ErrorRecord>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FetchStatus;

    /// State wired to unreachable endpoints and no credentials: every fetch
    /// fails locally, so nothing leaves the process.
    fn offline_state() -> AppState {
        let config = RuntimeConfig {
            finnhub_base_url: "http://127.0.0.1:9".into(),
            polygon_base_url: "http://127.0.0.1:9".into(),
            alpha_vantage_base_url: "http://127.0.0.1:9".into(),
            ..RuntimeConfig::default()
        };
        AppState::new(config, Credentials::default(), reqwest::Client::new())
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn error_log_is_capped() {
        let state = offline_state();
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            state.push_error(format!("error {i}"));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors[0].message, "error 5");
    }

    #[tokio::test]
    async fn selecting_a_symbol_normalises_and_bumps_version() {
        let state = offline_state();
        let v0 = state.current_state_version();

        assert_eq!(state.select_symbol("  msft "), "MSFT");
        assert_eq!(state.selected_symbol(), "MSFT");
        assert_eq!(state.runtime_config.read().default_symbol, "MSFT");
        assert!(state.current_state_version() > v0);

        let v1 = state.current_state_version();
        state.select_symbol("MSFT");
        assert_eq!(state.current_state_version(), v1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credentials_surface_as_fetch_errors() {
        let state = offline_state();
        state.refresh_ohlc();
        settle().await;

        let ohlc = state.ohlc_state();
        assert_eq!(ohlc.status, FetchStatus::Error);
        assert_eq!(ohlc.data, Some(Vec::new()));
        assert!(ohlc.error.unwrap().contains("POLYGON_API_KEY"));

        let quote = state.quote_state();
        assert_eq!(quote.status, FetchStatus::Error);
        assert!(quote.error.unwrap().contains("FINNHUB_API_KEY"));
        assert!(state.quote_view().is_none());
    }

    #[tokio::test]
    async fn time_range_change_is_recorded() {
        let state = offline_state();
        assert!(!state.set_time_range(TimeRange::OneMonth));
        assert!(state.set_time_range(TimeRange::OneYear));
        assert_eq!(state.selected_time_range(), TimeRange::OneYear);
        assert_eq!(state.runtime_config.read().default_time_range, TimeRange::OneYear);

        let opts = state.ohlc.options();
        let (from, to) = opts.resolve(Utc::now().date_naive());
        assert!(to > from);
    }

    #[tokio::test]
    async fn shutdown_freezes_component_state() {
        let state = offline_state();
        settle().await;
        let before = state.current_state_version();
        state.shutdown().await;

        let version = state.current_state_version();
        assert!(version >= before);
        state.refresh_quote();
        state.refresh_ohlc();
        settle().await;
        assert_eq!(state.current_state_version(), version);
        assert!(state.quote_poller.lock().is_none());
    }

    #[tokio::test]
    async fn symbol_switch_never_labels_old_quote_with_new_symbol() {
        use axum::extract::Query;
        use axum::routing::get;
        use axum::{Json, Router};
        use std::collections::HashMap;

        // AAPL answers at once, MSFT never does.
        let mock = Router::new().route(
            "/quote",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                if q.get("symbol").map(String::as_str) == Some("MSFT") {
                    std::future::pending::<()>().await;
                }
                Json(serde_json::json!({
                    "c": 187.0, "d": 1.0, "dp": 0.5, "h": 188.0,
                    "l": 186.0, "o": 187.0, "pc": 186.0, "t": 0
                }))
            }),
        );
        let config = RuntimeConfig {
            finnhub_base_url: crate::providers::mock::serve(mock).await,
            polygon_base_url: "http://127.0.0.1:9".into(),
            alpha_vantage_base_url: "http://127.0.0.1:9".into(),
            ..RuntimeConfig::default()
        };
        let credentials = Credentials {
            finnhub: Some("fh".into()),
            ..Credentials::default()
        };
        let state = AppState::new(config, credentials, reqwest::Client::new());

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while state.quote_view().is_none() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let view = state.quote_view().unwrap();
        assert_eq!((view.symbol.as_str(), view.price.as_str()), ("AAPL", "$187.00"));

        state.select_symbol("msft");
        let snap = state.build_snapshot();
        assert_eq!(snap.symbol, "MSFT");
        assert_eq!(snap.quote_symbol, "MSFT");
        assert_eq!(snap.quote.status, FetchStatus::Loading);
        assert!(snap.quote.data.is_none());
        assert!(snap.quote_view.is_none());

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(state.quote_view().is_none());
        let (symbol, quote) = state.quote_snapshot();
        assert_eq!(symbol, "MSFT");
        assert!(quote.data.is_none());
    }

    #[tokio::test]
    async fn snapshot_serialises() {
        let state = offline_state();
        let snap = state.build_snapshot();
        assert_eq!(snap.symbol, "AAPL");
        assert_eq!(snap.ticker.capacity, 20);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["time_range"], "1M");
        assert_eq!(json["ticker"]["status"]["state"], "idle");
        assert!(json["ohlc"]["status"].is_string());
    }
}
