// =============================================================================
// Live Trade Ticker — Push-feed ingestion into a bounded display buffer
// =============================================================================
//
// One WebSocket connection to the trade feed, one subscribe request per
// configured symbol, and every `trade` message prepended to a capped
// newest-first buffer. The supervisor task owns the connection; shutting the
// ticker down (explicitly or by dropping the handle) always releases it.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::FetchError;
use crate::market_data::trade_buffer::{Trade, TradeBuffer};
use crate::runtime_config::{ReconnectPolicy, RuntimeConfig, FINNHUB_KEY_VAR};

/// How long an explicit shutdown waits for the feed to close cleanly.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Feed status
// ---------------------------------------------------------------------------

/// Connection state of the live ticker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FeedStatus {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Stopped on request.
    Closed,
    /// Stopped after exhausting the reconnect budget.
    Failed,
    /// Never started: credential or URL missing.
    Misconfigured,
}

impl std::fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Closed => write!(f, "closed"),
            Self::Failed => write!(f, "failed"),
            Self::Misconfigured => write!(f, "misconfigured"),
        }
    }
}

// ---------------------------------------------------------------------------
// TradeTape — shared view of the ticker
// ---------------------------------------------------------------------------

/// Thread-safe holder of the ticker buffer and its connection status.
pub struct TradeTape {
    buffer: RwLock<TradeBuffer>,
    status: RwLock<FeedStatus>,
    last_error: RwLock<Option<String>>,
    last_trade_at: RwLock<Option<DateTime<Utc>>>,
    /// Total trade records received over the lifetime of the tape.
    trades_received: AtomicU64,
    /// Number of successful feed connections.
    sessions: AtomicU64,
    /// Inbound frames of any kind across all sessions.
    frames_received: AtomicU64,
    /// Bumped on every visible change.
    version: AtomicU64,
    /// Cleared once the owning ticker is torn down; late batches are dropped.
    accepting: AtomicBool,
}

/// Serialisable snapshot of the ticker for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct TickerSnapshot {
    pub status: FeedStatus,
    pub trades: Vec<Trade>,
    pub capacity: usize,
    pub trades_received: u64,
    pub last_trade_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub version: u64,
}

impl TradeTape {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: RwLock::new(TradeBuffer::new(capacity)),
            status: RwLock::new(FeedStatus::Idle),
            last_error: RwLock::new(None),
            last_trade_at: RwLock::new(None),
            trades_received: AtomicU64::new(0),
            sessions: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            version: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
        }
    }

    /// Prepend a trade batch. Returns the number of records accepted.
    pub fn ingest(&self, batch: Vec<Trade>) -> usize {
        if batch.is_empty() || !self.accepting.load(Ordering::Acquire) {
            return 0;
        }
        let count = batch.len();
        self.buffer.write().push_batch(batch);
        *self.last_trade_at.write() = Some(Utc::now());
        self.trades_received.fetch_add(count as u64, Ordering::Relaxed);
        self.bump();
        count
    }

    pub fn set_status(&self, status: FeedStatus) {
        let mut current = self.status.write();
        if *current != status {
            debug!(from = %*current, to = %status, "ticker status change");
            *current = status;
            drop(current);
            self.bump();
        }
    }

    pub fn status(&self) -> FeedStatus {
        self.status.read().clone()
    }

    pub fn record_error(&self, message: impl Into<String>) {
        *self.last_error.write() = Some(message.into());
        self.bump();
    }

    fn mark_connected(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
        self.set_status(FeedStatus::Connected);
    }

    fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    fn mark_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.buffer.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.read().is_empty()
    }

    /// Newest-first copy of the buffered trades.
    pub fn trades(&self) -> Vec<Trade> {
        self.buffer.read().to_vec()
    }

    pub fn snapshot(&self) -> TickerSnapshot {
        let buffer = self.buffer.read();
        TickerSnapshot {
            status: self.status(),
            trades: buffer.to_vec(),
            capacity: buffer.capacity(),
            trades_received: self.trades_received.load(Ordering::Relaxed),
            last_trade_at: *self.last_trade_at.read(),
            last_error: self.last_error.read().clone(),
            version: self.version(),
        }
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Feed protocol
// ---------------------------------------------------------------------------

/// Inbound feed message, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedMessage {
    Trade {
        #[serde(default)]
        data: Vec<Trade>,
    },
    Ping,
    Error {
        #[serde(default)]
        msg: String,
    },
    #[serde(other)]
    Other,
}

/// Parse a text frame from the feed.
///
/// Expected shape:
/// ```json
/// { "type": "trade", "data": [ { "p": 187.1, "s": "AAPL", "t": 1700000000000, "v": 10 } ] }
/// ```
pub fn parse_feed_message(text: &str) -> Result<FeedMessage> {
    serde_json::from_str(text).context("failed to parse feed message")
}

pub fn subscribe_message(symbol: &str) -> String {
    serde_json::json!({ "type": "subscribe", "symbol": symbol }).to_string()
}

pub fn unsubscribe_message(symbol: &str) -> String {
    serde_json::json!({ "type": "unsubscribe", "symbol": symbol }).to_string()
}

/// Append the access token to the feed endpoint.
pub fn feed_url(base: &str, token: &str) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("invalid feed url '{base}'"))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

fn handle_feed_text(text: &str, tape: &TradeTape) {
    match parse_feed_message(text) {
        Ok(FeedMessage::Trade { data }) => {
            let count = tape.ingest(data);
            debug!(count, "trade batch received");
        }
        Ok(FeedMessage::Error { msg }) => {
            warn!(message = %msg, "trade feed reported an error");
            tape.record_error(msg);
        }
        Ok(FeedMessage::Ping) | Ok(FeedMessage::Other) => {}
        Err(e) => {
            warn!(error = %e, "dropping malformed feed message");
        }
    }
}

// ---------------------------------------------------------------------------
// Trade WebSocket stream
// ---------------------------------------------------------------------------

/// Why a feed session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
    Shutdown,
    Disconnected,
}

/// Run one feed session: connect, subscribe, and ingest until the server
/// goes away, an error occurs, or `shutdown` fires.
///
/// The socket halves are owned by this future, so every return path
/// (including cancellation) releases the connection. On shutdown the
/// subscriptions are withdrawn and a Close frame is sent first.
pub async fn run_trade_stream(
    url: &Url,
    symbols: &[String],
    tape: &TradeTape,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<StreamExit> {
    if *shutdown.borrow() {
        return Ok(StreamExit::Shutdown);
    }

    let host = url.host_str().unwrap_or("?").to_string();
    info!(host = %host, symbols = ?symbols, "connecting to trade feed");

    let (ws_stream, _response) = tokio::select! {
        res = connect_async(url.as_str()) => res.context("failed to connect to trade feed")?,
        _ = shutdown.changed() => return Ok(StreamExit::Shutdown),
    };

    tape.mark_connected();
    info!(host = %host, "trade feed connected");
    let (mut write, mut read) = ws_stream.split();

    for symbol in symbols {
        write
            .send(Message::Text(subscribe_message(symbol)))
            .await
            .with_context(|| format!("failed to subscribe to {symbol}"))?;
        debug!(symbol = %symbol, "subscribed");
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                for symbol in symbols {
                    if write.send(Message::Text(unsubscribe_message(symbol))).await.is_err() {
                        break;
                    }
                }
                if let Err(e) = write.send(Message::Close(None)).await {
                    debug!(error = %e, "close frame not delivered");
                }
                info!("trade feed closed on shutdown");
                return Ok(StreamExit::Shutdown);
            }
            msg = read.next() => {
                if matches!(&msg, Some(Ok(m)) if !m.is_close()) {
                    tape.mark_frame();
                }
                match msg {
                    Some(Ok(Message::Text(text))) => handle_feed_text(&text, tape),
                    Some(Ok(Message::Close(frame))) => {
                        warn!(frame = ?frame, "trade feed closed by server");
                        return Ok(StreamExit::Disconnected);
                    }
                    // Ping / Pong / Binary: tungstenite answers pings itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "trade feed read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!("trade feed stream ended");
                        return Ok(StreamExit::Disconnected);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LiveTicker — supervised session with guaranteed teardown
// ---------------------------------------------------------------------------

/// Connection settings for the live ticker.
#[derive(Debug, Clone)]
pub struct TickerConfig {
    pub url: String,
    pub symbols: Vec<String>,
    pub reconnect: ReconnectPolicy,
}

impl TickerConfig {
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            url: config.feed_url.clone(),
            symbols: config.ticker_symbols.clone(),
            reconnect: config.reconnect.clone(),
        }
    }
}

/// Handle to a running ticker session.
///
/// Dropping the handle aborts the session task; [`LiveTicker::shutdown`]
/// additionally waits for the feed to be closed cleanly.
pub struct LiveTicker {
    tape: Arc<TradeTape>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl LiveTicker {
    /// Start streaming into `tape`.
    ///
    /// Without a token nothing is connected: the tape is marked
    /// misconfigured and a configuration error is returned.
    pub fn start(
        tape: Arc<TradeTape>,
        config: TickerConfig,
        token: Option<&str>,
    ) -> Result<Self, FetchError> {
        let Some(token) = token else {
            let err = FetchError::MissingCredential {
                provider: "Finnhub",
                env_var: FINNHUB_KEY_VAR,
            };
            error!(error = %err, "live ticker not started");
            tape.set_status(FeedStatus::Misconfigured);
            tape.record_error(err.to_string());
            return Err(err);
        };

        let url = match feed_url(&config.url, token) {
            Ok(url) => url,
            Err(e) => {
                let err = FetchError::InvalidRequest(format!("{e:#}"));
                error!(error = %err, "live ticker not started");
                tape.set_status(FeedStatus::Misconfigured);
                tape.record_error(err.to_string());
                return Err(err);
            }
        };

        tape.set_accepting(true);
        tape.set_status(FeedStatus::Connecting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(url, config, tape.clone(), shutdown_rx));

        Ok(Self {
            tape,
            shutdown_tx,
            task: Some(task),
        })
    }

    pub fn tape(&self) -> &Arc<TradeTape> {
        &self.tape
    }

    /// Stop the session and wait until the connection is released.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("live ticker did not stop in time, aborting");
                abort.abort();
            }
        }
        self.tape.set_accepting(false);
        self.tape.set_status(FeedStatus::Closed);
    }
}

impl Drop for LiveTicker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = self.shutdown_tx.send(true);
            task.abort();
            self.tape.set_accepting(false);
            self.tape.set_status(FeedStatus::Closed);
        }
    }
}

/// Reconnect loop around [`run_trade_stream`].
async fn supervise(
    url: Url,
    config: TickerConfig,
    tape: Arc<TradeTape>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    let healthy_after = config.reconnect.healthy_session();

    loop {
        let sessions_before = tape.sessions();
        let frames_before = tape.frames_received();
        let started = tokio::time::Instant::now();
        let outcome = run_trade_stream(&url, &config.symbols, &tape, &mut shutdown).await;

        // Only a session that delivered data and stayed up resets the budget.
        // Accept-then-drop servers keep counting against it.
        let healthy = tape.sessions() > sessions_before
            && tape.frames_received() > frames_before
            && started.elapsed() >= healthy_after;
        if healthy {
            attempt = 0;
        }

        match outcome {
            Ok(StreamExit::Shutdown) => break,
            Ok(StreamExit::Disconnected) => {}
            Err(e) => {
                let message = format!("{e:#}");
                error!(error = %message, "trade feed session failed");
                tape.record_error(message);
            }
        }

        attempt += 1;
        let Some(delay) = config.reconnect.delay_for(attempt) else {
            error!(
                max_attempts = config.reconnect.max_attempts,
                "trade feed not reconnecting, live ticker stopped"
            );
            tape.set_status(FeedStatus::Failed);
            return;
        };

        tape.set_status(FeedStatus::Reconnecting { attempt });
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnecting trade feed"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    tape.set_status(FeedStatus::Closed);
    info!("live ticker stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
