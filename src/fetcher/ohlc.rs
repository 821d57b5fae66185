// =============================================================================
// OHLC Fetcher — aggregate bars for the selected symbol and window
// =============================================================================

use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fetcher::{FetchCell, SeriesSource};
use crate::providers::polygon::{AggregateBar, AggregatesRequest};
use crate::types::{normalize_symbol, FetchState, TimeRange, Timespan};

/// Days covered when no explicit `from` date is set.
const DEFAULT_LOOKBACK_DAYS: u64 = 30;

/// Query parameters for the aggregates request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OhlcOptions {
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default)]
    pub timespan: Timespan,
    /// Defaults to 30 days before today.
    #[serde(default)]
    pub from: Option<NaiveDate>,
    /// Defaults to today.
    #[serde(default)]
    pub to: Option<NaiveDate>,
    #[serde(default = "default_adjusted")]
    pub adjusted: bool,
}

fn default_multiplier() -> u32 {
    1
}

fn default_adjusted() -> bool {
    true
}

impl Default for OhlcOptions {
    fn default() -> Self {
        Self {
            multiplier: default_multiplier(),
            timespan: Timespan::default(),
            from: None,
            to: None,
            adjusted: default_adjusted(),
        }
    }
}

impl OhlcOptions {
    /// Daily bars covering `range` up to `today`.
    pub fn for_range(range: TimeRange, today: NaiveDate) -> Self {
        Self {
            from: Some(range.from_date(today)),
            to: Some(today),
            ..Self::default()
        }
    }

    /// Concrete `(from, to)` window relative to `today`.
    pub fn resolve(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let to = self.to.unwrap_or(today);
        let from = self.from.unwrap_or_else(|| {
            today
                .checked_sub_days(Days::new(DEFAULT_LOOKBACK_DAYS))
                .unwrap_or(today)
        });
        (from, to)
    }
}

#[derive(Debug, Clone)]
struct OhlcQuery {
    symbol: String,
    options: OhlcOptions,
}

/// Request-state cell for one symbol's OHLC series.
///
/// Every change of symbol or options starts a new fetch; only the newest
/// fetch may settle the state.
pub struct OhlcFetcher {
    source: Arc<dyn SeriesSource>,
    cell: FetchCell<Vec<AggregateBar>>,
    query: RwLock<OhlcQuery>,
    limit: u32,
}

impl OhlcFetcher {
    /// Create an Idle fetcher. Nothing is requested until the first
    /// [`refresh`](Self::refresh) or parameter change.
    pub fn new(source: Arc<dyn SeriesSource>, symbol: &str, options: OhlcOptions, limit: u32) -> Self {
        Self {
            source,
            cell: FetchCell::clearing_to(Vec::new),
            query: RwLock::new(OhlcQuery {
                symbol: normalize_symbol(symbol),
                options,
            }),
            limit,
        }
    }

    pub fn symbol(&self) -> String {
        self.query.read().symbol.clone()
    }

    pub fn options(&self) -> OhlcOptions {
        self.query.read().options.clone()
    }

    pub fn state(&self) -> FetchState<Vec<AggregateBar>> {
        self.cell.snapshot()
    }

    /// Selected symbol together with the state, read under one lock so the
    /// bars always belong to the symbol they are reported with.
    pub fn snapshot(&self) -> (String, FetchState<Vec<AggregateBar>>) {
        let query = self.query.read();
        (query.symbol.clone(), self.cell.snapshot())
    }

    pub fn version(&self) -> u64 {
        self.cell.version()
    }

    /// Store a new symbol without fetching. Returns `false` when unchanged.
    ///
    /// The previous symbol's bars are dropped and any fetch in flight for it
    /// is superseded; an empty symbol settles straight to Idle.
    pub fn update_symbol(&self, symbol: &str) -> bool {
        let symbol = normalize_symbol(symbol);
        let mut query = self.query.write();
        if query.symbol == symbol {
            return false;
        }
        if symbol.is_empty() {
            self.cell.reset_empty();
        } else {
            self.cell.begin_clearing();
        }
        query.symbol = symbol;
        true
    }

    /// Store new options without fetching. Returns `false` when unchanged.
    pub fn update_options(&self, options: OhlcOptions) -> bool {
        let mut query = self.query.write();
        if query.options == options {
            return false;
        }
        query.options = options;
        true
    }

    /// Switch symbol and refetch. Returns `false` (no fetch) when unchanged.
    pub async fn set_symbol(&self, symbol: &str) -> bool {
        if !self.update_symbol(symbol) {
            return false;
        }
        self.refresh().await;
        true
    }

    /// Replace the query options and refetch. Returns `false` when unchanged.
    pub async fn set_options(&self, options: OhlcOptions) -> bool {
        if !self.update_options(options) {
            return false;
        }
        self.refresh().await;
        true
    }

    /// Re-run the fetch for the current symbol and options.
    ///
    /// The token is taken before the query is read, so the fetch holding the
    /// newest token always sees the newest query.
    pub async fn refresh(&self) {
        if self.query.read().symbol.is_empty() {
            debug!("ohlc fetch skipped: no symbol selected");
            self.cell.reset_empty();
            return;
        }
        let Some(token) = self.cell.begin() else {
            return;
        };
        let OhlcQuery { symbol, options } = self.query.read().clone();

        // Cleared between the check and the token.
        if symbol.is_empty() {
            self.cell.reset_empty();
            return;
        }

        let (from, to) = options.resolve(Utc::now().date_naive());
        let request = AggregatesRequest {
            ticker: symbol.clone(),
            multiplier: options.multiplier,
            timespan: options.timespan,
            from,
            to,
            adjusted: options.adjusted,
            limit: self.limit,
        };

        let result = match request.validate() {
            Ok(()) => self.source.aggregates(&request).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(bars) => info!(symbol = %symbol, bars = bars.len(), %from, %to, "ohlc series loaded"),
            Err(e) => warn!(symbol = %symbol, error = %e, "ohlc fetch failed"),
        }

        if !self.cell.resolve(token, result) {
            debug!(symbol = %symbol, "discarding superseded ohlc response");
        }
    }

    /// Stop accepting results; in-flight fetches settle into nothing.
    pub fn close(&self) {
        self.cell.close();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::types::FetchStatus;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn bar(close: f64) -> AggregateBar {
        AggregateBar {
            timestamp_ms: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
            vwap: None,
            trades: None,
        }
    }

    /// Answers per ticker; a ticker with a gate waits for it first.
    #[derive(Default)]
    struct MockSeries {
        calls: AtomicUsize,
        answers: HashMap<&'static str, Result<Vec<AggregateBar>, FetchError>>,
        gates: HashMap<&'static str, Arc<Notify>>,
        last: parking_lot::Mutex<Option<AggregatesRequest>>,
    }

    #[async_trait]
    impl SeriesSource for MockSeries {
        async fn aggregates(&self, request: &AggregatesRequest) -> Result<Vec<AggregateBar>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(request.clone());
            if let Some(gate) = self.gates.get(request.ticker.as_str()) {
                gate.notified().await;
            }
            self.answers
                .get(request.ticker.as_str())
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn fetcher(source: Arc<MockSeries>, symbol: &str) -> OhlcFetcher {
        OhlcFetcher::new(source, symbol, OhlcOptions::default(), 5000)
    }

    #[test]
    fn default_window_is_thirty_days() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let (from, to) = OhlcOptions::default().resolve(today);
        assert_eq!(to, today);
        assert_eq!(from, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());

        let ranged = OhlcOptions::for_range(TimeRange::OneWeek, today);
        assert_eq!(ranged.resolve(today).0, NaiveDate::from_ymd_opt(2024, 3, 24).unwrap());
        assert_eq!(ranged.multiplier, 1);
        assert!(ranged.adjusted);
    }

    #[tokio::test]
    async fn success_stores_series() {
        let mut mock = MockSeries::default();
        mock.answers.insert("AAPL", Ok(vec![bar(1.0), bar(2.0)]));
        let mock = Arc::new(mock);
        let f = fetcher(mock.clone(), "aapl");

        assert_eq!(f.state().status, FetchStatus::Idle);
        f.refresh().await;

        let state = f.state();
        assert_eq!(state.status, FetchStatus::Success);
        assert_eq!(state.data.unwrap().len(), 2);
        let sent = mock.last.lock().clone().unwrap();
        assert_eq!(sent.ticker, "AAPL");
        assert_eq!(sent.limit, 5000);
        assert_eq!(sent.timespan, Timespan::Day);
    }

    #[tokio::test]
    async fn empty_symbol_makes_no_call() {
        let mock = Arc::new(MockSeries::default());
        let f = fetcher(mock.clone(), "   ");
        f.refresh().await;

        let state = f.state();
        assert_eq!(state.status, FetchStatus::Idle);
        assert_eq!(state.data, Some(Vec::new()));
        assert!(state.error.is_none());
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_symbol_never_shows_loading() {
        let mut mock = MockSeries::default();
        mock.answers.insert("AAPL", Ok(vec![bar(1.0)]));
        let mock = Arc::new(mock);
        let f = fetcher(mock.clone(), "AAPL");
        f.refresh().await;

        assert!(f.update_symbol(""));
        assert_eq!(f.state().status, FetchStatus::Idle);
        assert_eq!(f.state().data, Some(Vec::new()));

        let version = f.version();
        f.refresh().await;
        let state = f.state();
        assert_eq!(state.status, FetchStatus::Idle);
        assert!(state.error.is_none());
        // One reset, no Loading step in between.
        assert_eq!(f.version(), version + 1);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn symbol_switch_drops_bars_of_previous_symbol() {
        let gate = Arc::new(Notify::new());
        let mut mock = MockSeries::default();
        mock.answers.insert("AAPL", Ok(vec![bar(1.0)]));
        mock.answers.insert("MSFT", Ok(vec![bar(2.0)]));
        mock.gates.insert("MSFT", gate.clone());
        let mock = Arc::new(mock);
        let f = Arc::new(fetcher(mock.clone(), "AAPL"));
        f.refresh().await;
        assert_eq!(f.snapshot().1.data.unwrap()[0].close, 1.0);

        assert!(f.update_symbol("msft"));
        let (symbol, state) = f.snapshot();
        assert_eq!(symbol, "MSFT");
        assert_eq!(state.status, FetchStatus::Loading);
        assert_eq!(state.data, Some(Vec::new()));

        let pending = {
            let f = f.clone();
            tokio::spawn(async move { f.refresh().await })
        };
        while mock.calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.snapshot().1.data, Some(Vec::new()));

        gate.notify_one();
        pending.await.unwrap();
        let (symbol, state) = f.snapshot();
        assert_eq!(symbol, "MSFT");
        assert_eq!(state.data.unwrap()[0].close, 2.0);
    }

    #[tokio::test]
    async fn failures_clear_the_series() {
        let mut mock = MockSeries::default();
        mock.answers.insert("AAPL", Ok(vec![bar(1.0)]));
        mock.answers.insert(
            "FAIL",
            Err(FetchError::Status {
                status: 500,
                message: "HTTP error! status: 500".into(),
            }),
        );
        mock.answers.insert("LIMIT", Err(FetchError::Provider("rate limited".into())));
        let f = fetcher(Arc::new(mock), "AAPL");
        f.refresh().await;

        f.set_symbol("FAIL").await;
        let state = f.state();
        assert_eq!(state.status, FetchStatus::Error);
        assert_eq!(state.data, Some(Vec::new()));
        assert_eq!(state.error.as_deref(), Some("HTTP error! status: 500"));

        f.set_symbol("LIMIT").await;
        assert_eq!(f.state().error.as_deref(), Some("rate limited"));
        assert_eq!(f.state().data, Some(Vec::new()));
    }

    #[tokio::test]
    async fn unchanged_parameters_do_not_refetch() {
        let mock = Arc::new(MockSeries::default());
        let f = fetcher(mock.clone(), "AAPL");

        assert!(!f.set_symbol(" aapl ").await);
        assert!(!f.set_options(OhlcOptions::default()).await);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);

        let weekly = OhlcOptions {
            timespan: Timespan::Week,
            ..OhlcOptions::default()
        };
        assert!(f.set_options(weekly).await);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.last.lock().as_ref().unwrap().timespan, Timespan::Week);
    }

    #[tokio::test]
    async fn invalid_options_fail_locally() {
        let mock = Arc::new(MockSeries::default());
        let f = fetcher(mock.clone(), "AAPL");
        let bad = OhlcOptions {
            multiplier: 0,
            ..OhlcOptions::default()
        };
        f.set_options(bad).await;

        assert_eq!(f.state().status, FetchStatus::Error);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_response_does_not_overwrite_newer_state() {
        let gate = Arc::new(Notify::new());
        let mut mock = MockSeries::default();
        mock.answers.insert("AAPL", Ok(vec![bar(1.0)]));
        mock.answers.insert("MSFT", Ok(vec![bar(2.0), bar(3.0)]));
        mock.gates.insert("AAPL", gate.clone());
        let mock = Arc::new(mock);
        let f = Arc::new(fetcher(mock.clone(), ""));

        let slow = {
            let f = f.clone();
            tokio::spawn(async move { f.set_symbol("AAPL").await })
        };
        while mock.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        f.set_symbol("MSFT").await;
        assert_eq!(f.state().data.as_ref().map(Vec::len), Some(2));

        gate.notify_one();
        slow.await.unwrap();

        let state = f.state();
        assert_eq!(state.status, FetchStatus::Success);
        assert_eq!(state.data.unwrap()[0].close, 2.0);
        assert_eq!(f.symbol(), "MSFT");
    }

    #[tokio::test]
    async fn closed_fetcher_ignores_late_results() {
        let gate = Arc::new(Notify::new());
        let mut mock = MockSeries::default();
        mock.answers.insert("AAPL", Ok(vec![bar(1.0)]));
        mock.gates.insert("AAPL", gate.clone());
        let mock = Arc::new(mock);
        let f = Arc::new(fetcher(mock.clone(), "AAPL"));

        let pending = {
            let f = f.clone();
            tokio::spawn(async move { f.refresh().await })
        };
        while mock.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        f.close();
        let version = f.version();
        gate.notify_one();
        pending.await.unwrap();

        assert_eq!(f.version(), version);
        assert_eq!(f.state().status, FetchStatus::Loading);
    }
}
