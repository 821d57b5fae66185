// =============================================================================
// Quote Poller — periodic instant quote for the selected symbol
// =============================================================================
//
// A single background task drives the poll schedule: an immediate fetch on
// start, one every `period`, one on every symbol change (which also restarts
// the period) and one on every manual refresh. Each fetch runs in its own
// task so a slow provider never delays the schedule; the request token on
// the cell decides which result wins.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::fetcher::{FetchCell, QuoteSource};
use crate::format::{day_range_position, format_change, format_percent, format_price};
use crate::providers::finnhub::Quote;
use crate::types::{normalize_symbol, FetchState};

pub struct QuotePoller {
    cell: Arc<FetchCell<Quote>>,
    symbol_tx: watch::Sender<String>,
    refresh: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl QuotePoller {
    /// Start polling `symbol` every `period`. Must be called within a tokio
    /// runtime.
    pub fn spawn(source: Arc<dyn QuoteSource>, symbol: &str, period: Duration) -> Self {
        let symbol = normalize_symbol(symbol);
        info!(symbol = %symbol, period_secs = period.as_secs(), "quote poller started");

        let cell = Arc::new(FetchCell::new());
        let (symbol_tx, symbol_rx) = watch::channel(symbol);
        let refresh = Arc::new(Notify::new());
        let task = tokio::spawn(poll_loop(
            source,
            cell.clone(),
            symbol_rx,
            refresh.clone(),
            period,
        ));

        Self {
            cell,
            symbol_tx,
            refresh,
            task: Some(task),
        }
    }

    /// Switch symbol. Returns `false` when unchanged.
    ///
    /// The previous symbol's quote is dropped before the new symbol becomes
    /// visible, so no reader sees one paired with the other.
    pub fn set_symbol(&self, symbol: &str) -> bool {
        let symbol = normalize_symbol(symbol);
        let cell = &self.cell;
        self.symbol_tx.send_if_modified(|current| {
            if *current == symbol {
                return false;
            }
            if symbol.is_empty() {
                cell.reset_empty();
            } else {
                cell.begin_clearing();
            }
            *current = symbol;
            true
        })
    }

    pub fn symbol(&self) -> String {
        self.symbol_tx.borrow().clone()
    }

    /// Current symbol and the state of its quote, read consistently.
    pub fn snapshot(&self) -> (String, FetchState<Quote>) {
        let symbol = self.symbol_tx.borrow();
        (symbol.clone(), self.cell.snapshot())
    }

    /// Formatted quote card, when a quote for the current symbol is held.
    pub fn view(&self) -> Option<QuoteView> {
        let (symbol, state) = self.snapshot();
        state.data.as_ref().map(|q| QuoteView::new(&symbol, q))
    }

    /// Fetch now without waiting for the next tick.
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }

    pub fn state(&self) -> FetchState<Quote> {
        self.cell.snapshot()
    }

    pub fn version(&self) -> u64 {
        self.cell.version()
    }

    /// Cancel the timer and suppress every later state update.
    pub async fn shutdown(mut self) {
        self.cell.close();
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        info!("quote poller stopped");
    }
}

impl Drop for QuotePoller {
    fn drop(&mut self) {
        self.cell.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn poll_loop(
    source: Arc<dyn QuoteSource>,
    cell: Arc<FetchCell<Quote>>,
    mut symbol_rx: watch::Receiver<String>,
    refresh: Arc<Notify>,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = symbol_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                ticker.reset();
            }
            _ = refresh.notified() => {}
        }

        if cell.is_closed() {
            break;
        }
        let symbol = symbol_rx.borrow_and_update().clone();
        start_poll(source.clone(), cell.clone(), symbol);
    }
}

fn start_poll(source: Arc<dyn QuoteSource>, cell: Arc<FetchCell<Quote>>, symbol: String) {
    if symbol.is_empty() {
        cell.reset_empty();
        return;
    }
    let Some(token) = cell.begin() else {
        return;
    };

    tokio::spawn(async move {
        let result = source.quote(&symbol).await;
        match &result {
            Ok(q) => debug!(symbol = %symbol, price = q.current, "quote polled"),
            Err(e) => warn!(symbol = %symbol, error = %e, "quote poll failed"),
        }
        if !cell.resolve(token, result) {
            debug!(symbol = %symbol, "discarding superseded quote response");
        }
    });
}

// =============================================================================
// Display view
// =============================================================================

/// Quote card values, pre-formatted.
#[derive(Debug, Clone, Serialize)]
pub struct QuoteView {
    pub symbol: String,
    pub price: String,
    pub change: String,
    pub percent_change: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub previous_close: String,
    /// Position of the price in today's range, 0..=100.
    pub day_range_position: f64,
    pub is_up: bool,
}

impl QuoteView {
    pub fn new(symbol: &str, quote: &Quote) -> Self {
        let change = quote.change.unwrap_or(0.0);
        Self {
            symbol: symbol.to_string(),
            price: format_price(quote.current),
            change: quote.change.map_or_else(|| "N/A".to_string(), format_change),
            percent_change: quote
                .percent_change
                .map_or_else(|| "N/A".to_string(), format_percent),
            open: format_price(quote.open),
            high: format_price(quote.high),
            low: format_price(quote.low),
            previous_close: format_price(quote.previous_close),
            day_range_position: day_range_position(quote.current, quote.low, quote.high),
            is_up: change >= 0.0,
        }
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::advance;

    #[derive(Default)]
    struct MockQuotes {
        calls: AtomicUsize,
        symbols: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl QuoteSource for MockQuotes {
        async fn quote(&self, symbol: &str) -> Result<Quote, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.symbols.lock().push(symbol.to_string());
            if symbol == "FAIL" {
                return Err(FetchError::Provider("rate limited".into()));
            }
            Ok(Quote {
                current: n as f64,
                change: Some(1.0),
                percent_change: Some(0.5),
                high: 10.0,
                low: 0.0,
                open: 1.0,
                previous_close: 1.0,
                timestamp: 0,
            })
        }
    }

    impl MockQuotes {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_start_and_every_period() {
        let mock = Arc::new(MockQuotes::default());
        let poller = QuotePoller::spawn(mock.clone(), "aapl", Duration::from_secs(30));
        settle().await;

        assert_eq!(mock.calls(), 1);
        let state = poller.state();
        assert_eq!(state.status, FetchStatus::Success);
        assert_eq!(state.data.unwrap().current, 1.0);

        advance(Duration::from_secs(29)).await;
        settle().await;
        assert_eq!(mock.calls(), 1);

        advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(mock.calls(), 2);
        assert_eq!(mock.symbols.lock().as_slice(), ["AAPL", "AAPL"]);
    }

    #[tokio::test(start_paused = true)]
    async fn symbol_change_fetches_and_restarts_timer() {
        let mock = Arc::new(MockQuotes::default());
        let poller = QuotePoller::spawn(mock.clone(), "AAPL", Duration::from_secs(30));
        settle().await;

        advance(Duration::from_secs(20)).await;
        assert!(poller.set_symbol("msft"));
        assert!(!poller.set_symbol("MSFT"));
        settle().await;
        assert_eq!(mock.calls(), 2);
        assert_eq!(poller.symbol(), "MSFT");

        // The old schedule would have fired 10 s from here.
        advance(Duration::from_secs(29)).await;
        settle().await;
        assert_eq!(mock.calls(), 2);

        advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(mock.calls(), 3);
        assert_eq!(mock.symbols.lock().last().map(String::as_str), Some("MSFT"));
    }

    /// Answers AAPL at once; MSFT waits for the gate.
    struct GatedQuotes {
        gate: Notify,
    }

    #[async_trait]
    impl QuoteSource for GatedQuotes {
        async fn quote(&self, symbol: &str) -> Result<Quote, FetchError> {
            if symbol == "MSFT" {
                self.gate.notified().await;
            }
            let price = if symbol == "MSFT" { 410.0 } else { 187.0 };
            Ok(Quote {
                current: price,
                change: Some(1.0),
                percent_change: Some(0.5),
                high: price + 1.0,
                low: price - 1.0,
                open: price,
                previous_close: price - 1.0,
                timestamp: 0,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn symbol_switch_hides_previous_quote_while_loading() {
        let source = Arc::new(GatedQuotes { gate: Notify::new() });
        let poller = QuotePoller::spawn(source.clone(), "AAPL", Duration::from_secs(30));
        settle().await;

        let view = poller.view().unwrap();
        assert_eq!((view.symbol.as_str(), view.price.as_str()), ("AAPL", "$187.00"));

        assert!(poller.set_symbol("MSFT"));
        let (symbol, state) = poller.snapshot();
        assert_eq!(symbol, "MSFT");
        assert_eq!(state.status, FetchStatus::Loading);
        assert!(state.data.is_none());
        assert!(poller.view().is_none());

        settle().await;
        assert!(poller.view().is_none());

        source.gate.notify_one();
        settle().await;
        let view = poller.view().unwrap();
        assert_eq!((view.symbol.as_str(), view.price.as_str()), ("MSFT", "$410.00"));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_refresh_fetches_immediately() {
        let mock = Arc::new(MockQuotes::default());
        let poller = QuotePoller::spawn(mock.clone(), "AAPL", Duration::from_secs(30));
        settle().await;

        poller.refresh();
        settle().await;
        assert_eq!(mock.calls(), 2);
        assert_eq!(poller.state().data.unwrap().current, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn error_is_reported_without_data() {
        let mock = Arc::new(MockQuotes::default());
        let poller = QuotePoller::spawn(mock.clone(), "FAIL", Duration::from_secs(30));
        settle().await;

        let state = poller.state();
        assert_eq!(state.status, FetchStatus::Error);
        assert_eq!(state.data, None);
        assert_eq!(state.error.as_deref(), Some("rate limited"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_symbol_is_idle_without_calls() {
        let mock = Arc::new(MockQuotes::default());
        let poller = QuotePoller::spawn(mock.clone(), "  ", Duration::from_secs(30));
        settle().await;

        assert_eq!(mock.calls(), 0);
        let state = poller.state();
        assert_eq!(state.status, FetchStatus::Idle);
        assert!(state.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn no_polls_after_shutdown() {
        let mock = Arc::new(MockQuotes::default());
        let poller = QuotePoller::spawn(mock.clone(), "AAPL", Duration::from_secs(30));
        settle().await;
        assert_eq!(mock.calls(), 1);

        poller.shutdown().await;
        advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_poller_stops_it() {
        let mock = Arc::new(MockQuotes::default());
        let poller = QuotePoller::spawn(mock.clone(), "AAPL", Duration::from_secs(30));
        settle().await;
        drop(poller);

        advance(Duration::from_secs(90)).await;
        settle().await;
        assert_eq!(mock.calls(), 1);
    }

    #[test]
    fn quote_view_formats_card() {
        let quote = Quote {
            current: 150.0,
            change: Some(-1.234),
            percent_change: Some(-0.82),
            high: 160.0,
            low: 140.0,
            open: 151.0,
            previous_close: 151.234,
            timestamp: 0,
        };
        let view = QuoteView::new("AAPL", &quote);
        assert_eq!(view.price, "$150.00");
        assert_eq!(view.change, "-1.23");
        assert_eq!(view.percent_change, "-0.82%");
        assert_eq!(view.day_range_position, 50.0);
        assert!(!view.is_up);

        let flat = Quote {
            change: None,
            percent_change: None,
            high: 150.0,
            low: 150.0,
            ..quote
        };
        let view = QuoteView::new("AAPL", &flat);
        assert_eq!(view.change, "N/A");
        assert_eq!(view.day_range_position, 50.0);
    }
}
