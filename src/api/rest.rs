// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The dashboard endpoints read and steer
// the components owned by `AppState`; the company and market endpoints pass
// straight through to the providers.
//
// Provider failures answer `{"error": ..., "kind": ...}` with a status chosen
// by error kind, and are recorded in the dashboard error log.
//
// CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::error::{ErrorKind, FetchError};
use crate::fetcher::QuoteView;
use crate::financials::{categorize, FinancialsView};
use crate::providers::rate_limit::RateLimitSnapshot;
use crate::types::TimeRange;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Service ─────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        // ── Dashboard components ────────────────────────────────────
        .route("/api/v1/ticker", get(ticker))
        .route("/api/v1/quote", get(quote))
        .route("/api/v1/quote/refresh", post(refresh_quote))
        .route("/api/v1/ohlc", get(ohlc))
        .route("/api/v1/ohlc/refresh", post(refresh_ohlc))
        .route("/api/v1/symbol", post(select_symbol))
        .route("/api/v1/time-range", post(select_time_range))
        // ── Provider pass-through ───────────────────────────────────
        .route("/api/v1/companies/:symbol/profile", get(company_profile))
        .route("/api/v1/companies/:symbol/news", get(company_news))
        .route("/api/v1/companies/:symbol/financials", get(company_financials))
        .route("/api/v1/news", get(market_news))
        .route("/api/v1/market-status", get(market_status))
        // ── Push channel ─────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error response
// =============================================================================

/// A provider failure rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub FetchError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            FetchError::MissingCredential { .. } => StatusCode::SERVICE_UNAVAILABLE,
            FetchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (self.status(), Json(body)).into_response()
    }
}

/// Log the failure, record it for the dashboard and wrap it for the response.
fn fail(state: &AppState, what: &str, err: FetchError) -> ApiError {
    let kind: ErrorKind = err.kind();
    warn!(endpoint = what, kind = kind.as_str(), error = %err, "pass-through request failed");
    state.push_error_with_code(format!("{what}: {err}"), Some(kind.as_str().to_string()));
    ApiError(err)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct CredentialStatus {
    finnhub: bool,
    polygon: bool,
    alpha_vantage: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    state_version: u64,
    server_time: i64,
    uptime_secs: u64,
    ws_clients: usize,
    finnhub_rate_limit: RateLimitSnapshot,
    credentials: CredentialStatus,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        state_version: state.current_state_version(),
        server_time: Utc::now().timestamp_millis(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        ws_clients: state.ws_clients.load(std::sync::atomic::Ordering::Relaxed),
        finnhub_rate_limit: state.finnhub.rate_limits().snapshot(),
        credentials: CredentialStatus {
            finnhub: state.finnhub.has_token(),
            polygon: state.polygon.has_key(),
            alpha_vantage: state.alpha_vantage.has_key(),
        },
    };
    Json(resp)
}

// =============================================================================
// Dashboard state
// =============================================================================

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn ticker(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.ticker())
}

async fn quote(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (symbol, quote) = state.quote_snapshot();
    let view = quote.data.as_ref().map(|q| QuoteView::new(&symbol, q));
    Json(serde_json::json!({
        "symbol": symbol,
        "state": quote,
        "view": view,
    }))
}

async fn refresh_quote(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.refresh_quote();
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "refreshing" })))
}

async fn ohlc(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (symbol, series) = state.ohlc_snapshot();
    Json(serde_json::json!({
        "symbol": symbol,
        "time_range": state.selected_time_range(),
        "state": series,
    }))
}

async fn refresh_ohlc(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.refresh_ohlc();
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "refreshing" })))
}

// =============================================================================
// Selection
// =============================================================================

#[derive(Deserialize)]
struct SymbolRequest {
    symbol: String,
}

#[derive(Serialize)]
struct SymbolResponse {
    symbol: String,
}

async fn select_symbol(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SymbolRequest>,
) -> impl IntoResponse {
    let symbol = state.select_symbol(&req.symbol);
    Json(SymbolResponse { symbol })
}

#[derive(Deserialize)]
struct TimeRangeRequest {
    range: String,
}

#[derive(Serialize)]
struct TimeRangeResponse {
    time_range: TimeRange,
    changed: bool,
}

async fn select_time_range(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TimeRangeRequest>,
) -> Result<Json<TimeRangeResponse>, ApiError> {
    let range: TimeRange = req
        .range
        .parse()
        .map_err(|e: String| ApiError(FetchError::InvalidRequest(e)))?;
    let changed = state.set_time_range(range);
    if changed {
        info!(range = %range, "Time range changed via API");
    }
    Ok(Json(TimeRangeResponse {
        time_range: range,
        changed,
    }))
}

// =============================================================================
// Company pass-through
// =============================================================================

async fn company_profile(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Response, ApiError> {
    let profile = state
        .finnhub
        .company_profile(&symbol)
        .await
        .map_err(|e| fail(&state, "company profile", e))?;

    Ok(match profile {
        Some(p) => Json(p).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no profile for '{}'", symbol.trim().to_uppercase()) })),
        )
            .into_response(),
    })
}

#[derive(Deserialize)]
struct NewsQuery {
    days: Option<u64>,
    category: Option<String>,
}

async fn company_news(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<NewsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (days_back, limit) = {
        let config = state.runtime_config.read();
        (query.days.unwrap_or(config.news_days_back), config.news_limit)
    };
    let to = Utc::now().date_naive();
    let from = to - ChronoDuration::days(days_back.min(365) as i64);

    let news = state
        .finnhub
        .company_news(&symbol, from, to, limit)
        .await
        .map_err(|e| fail(&state, "company news", e))?;
    Ok(Json(news))
}

async fn company_financials(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Json<FinancialsView>, ApiError> {
    let financials = state
        .finnhub
        .basic_financials(&symbol)
        .await
        .map_err(|e| fail(&state, "basic financials", e))?;
    Ok(Json(categorize(&financials)))
}

// =============================================================================
// Market pass-through
// =============================================================================

async fn market_news(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NewsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = state.runtime_config.read().news_limit;
    let category = query.category.unwrap_or_default();
    let news = state
        .finnhub
        .market_news(&category, limit)
        .await
        .map_err(|e| fail(&state, "market news", e))?;
    Ok(Json(news))
}

async fn market_status(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let venues = state
        .alpha_vantage
        .market_status()
        .await
        .map_err(|e| fail(&state, "market status", e))?;
    Ok(Json(venues))
}

// =============================================================================
// Tests
// =============================================================================
