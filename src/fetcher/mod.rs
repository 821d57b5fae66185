// =============================================================================
// Polling Data Fetchers — request-state cells and injected data sources
// =============================================================================
//
// A `FetchCell` holds one `FetchState<T>` and hands out a request token for
// every fetch it starts. A settled result is applied only when its token is
// still the newest one issued and the cell has not been closed; anything else
// is a superseded response and is dropped.
// =============================================================================

pub mod ohlc;
pub mod quote;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::error::FetchError;
use crate::providers::finnhub::Quote;
use crate::providers::polygon::{AggregateBar, AggregatesRequest};
use crate::types::{FetchState, FetchStatus};

pub use ohlc::{OhlcFetcher, OhlcOptions};
pub use quote::{QuotePoller, QuoteView};

// =============================================================================
// Sources
// =============================================================================

/// Provider of OHLC aggregate bars.
#[async_trait]
pub trait SeriesSource: Send + Sync {
    /// Bars for `request`, ascending by time. No results is an empty vec.
    async fn aggregates(&self, request: &AggregatesRequest) -> Result<Vec<AggregateBar>, FetchError>;
}

/// Provider of real-time quotes.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<Quote, FetchError>;
}

// =============================================================================
// FetchCell
// =============================================================================

/// Identifies one fetch started on a [`FetchCell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestToken(u64);

pub struct FetchCell<T> {
    state: RwLock<FetchState<T>>,
    /// Token of the newest fetch issued.
    generation: AtomicU64,
    /// Bumped on every visible state change.
    revision: AtomicU64,
    /// Value stored as `data` when a fetch fails or the input is empty.
    empty: Option<fn() -> T>,
    closed: AtomicBool,
}

impl<T: Clone> FetchCell<T> {
    /// Cell whose data becomes `None` on error.
    pub fn new() -> Self {
        Self::with_empty(None)
    }

    /// Cell whose data is reset to `empty()` on error or empty input.
    pub fn clearing_to(empty: fn() -> T) -> Self {
        Self::with_empty(Some(empty))
    }

    fn with_empty(empty: Option<fn() -> T>) -> Self {
        Self {
            state: RwLock::new(FetchState::idle()),
            generation: AtomicU64::new(0),
            revision: AtomicU64::new(0),
            empty,
            closed: AtomicBool::new(false),
        }
    }

    /// Start a fetch: Loading, error cleared, previous data kept.
    ///
    /// Returns `None` once the cell is closed.
    pub fn begin(&self) -> Option<RequestToken> {
        self.start(false)
    }

    /// Start a fetch for a different subject: like [`begin`](Self::begin),
    /// but the previous data is dropped as well.
    pub fn begin_clearing(&self) -> Option<RequestToken> {
        self.start(true)
    }

    fn start(&self, clear: bool) -> Option<RequestToken> {
        let mut state = self.state.write();
        if self.is_closed() {
            return None;
        }
        let token = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        state.status = FetchStatus::Loading;
        state.error = None;
        if clear {
            state.data = self.empty.map(|empty| empty());
        }
        drop(state);
        self.bump();
        Some(RequestToken(token))
    }

    /// Apply the outcome of the fetch identified by `token`.
    ///
    /// Returns `false` (state untouched) when a newer fetch has been started
    /// since, or the cell is closed.
    pub fn resolve(&self, token: RequestToken, result: Result<T, FetchError>) -> bool {
        let mut state = self.state.write();
        if self.is_closed() || self.generation.load(Ordering::Acquire) != token.0 {
            return false;
        }
        match result {
            Ok(data) => {
                state.status = FetchStatus::Success;
                state.data = Some(data);
                state.error = None;
            }
            Err(err) => {
                state.status = FetchStatus::Error;
                state.data = self.empty.map(|empty| empty());
                state.error = Some(err.to_string());
            }
        }
        state.updated_at = Some(Utc::now());
        drop(state);
        self.bump();
        true
    }

    /// Settle to Idle with empty data and no error, superseding any fetch
    /// still in flight.
    pub fn reset_empty(&self) {
        let mut state = self.state.write();
        if self.is_closed() {
            return;
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        state.status = FetchStatus::Idle;
        state.data = self.empty.map(|empty| empty());
        state.error = None;
        drop(state);
        self.bump();
    }

    pub fn snapshot(&self) -> FetchState<T> {
        self.state.read().clone()
    }

    pub fn status(&self) -> FetchStatus {
        self.state.read().status
    }

    /// Stop accepting updates. Irreversible.
    pub fn close(&self) {
        let _state = self.state.write();
        self.closed.store(true, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn version(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }
}

impl<T: Clone> Default for FetchCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
