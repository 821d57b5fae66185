// =============================================================================
// Polygon REST Client — OHLC aggregate bars
// =============================================================================

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::FetchError;
use crate::fetcher::SeriesSource;
use crate::providers::{endpoint, get_json};
use crate::runtime_config::POLYGON_KEY_VAR;
use crate::types::Timespan;

/// Polygon error bodies: `{"status":"ERROR","error":"..."}`.
const ENVELOPE_KEYS: &[&str] = &["error"];

/// One aggregate bar.
///
/// Wire keys: `t` (bucket start, ms), `o`, `h`, `l`, `c`, `v`, and the
/// optional `vw` (volume-weighted average) and `n` (trade count).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBar {
    #[serde(alias = "t")]
    pub timestamp_ms: i64,
    #[serde(alias = "o")]
    pub open: f64,
    #[serde(alias = "h")]
    pub high: f64,
    #[serde(alias = "l")]
    pub low: f64,
    #[serde(alias = "c")]
    pub close: f64,
    #[serde(alias = "v", default)]
    pub volume: f64,
    #[serde(alias = "vw", default)]
    pub vwap: Option<f64>,
    #[serde(alias = "n", default)]
    pub trades: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AggregatesResponse {
    #[serde(default)]
    results: Option<Vec<AggregateBar>>,
}

/// Parameters of one `/v2/aggs` call. Results are always sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatesRequest {
    pub ticker: String,
    pub multiplier: u32,
    pub timespan: Timespan,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub adjusted: bool,
    pub limit: u32,
}

impl AggregatesRequest {
    /// Reject parameters the API would refuse anyway.
    pub fn validate(&self) -> Result<(), FetchError> {
        if self.ticker.trim().is_empty() {
            return Err(FetchError::InvalidRequest("ticker is required".into()));
        }
        if self.multiplier == 0 {
            return Err(FetchError::InvalidRequest("multiplier must be at least 1".into()));
        }
        if self.from > self.to {
            return Err(FetchError::InvalidRequest(format!(
                "range starts after it ends ({} > {})",
                self.from, self.to
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct PolygonClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl PolygonClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
        }
    }

    pub fn has_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// GET /v2/aggs/ticker/{ticker}/range/{multiplier}/{timespan}/{from}/{to}
    #[instrument(skip(self), name = "polygon::aggregates", fields(ticker = %request.ticker))]
    pub async fn aggregates(&self, request: &AggregatesRequest) -> Result<Vec<AggregateBar>, FetchError> {
        let api_key = self.api_key.as_deref().ok_or(FetchError::MissingCredential {
            provider: "Polygon",
            env_var: POLYGON_KEY_VAR,
        })?;
        request.validate()?;

        let mut url = endpoint(&self.base_url, "/v2/aggs/ticker")?;
        let multiplier = request.multiplier.to_string();
        let from = request.from.format("%Y-%m-%d").to_string();
        let to = request.to.format("%Y-%m-%d").to_string();
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidRequest(format!("bad base url '{}'", self.base_url)))?
            .extend([
                request.ticker.trim(),
                "range",
                multiplier.as_str(),
                request.timespan.as_str(),
                from.as_str(),
                to.as_str(),
            ]);
        url.query_pairs_mut()
            .append_pair("adjusted", if request.adjusted { "true" } else { "false" })
            .append_pair("sort", "asc")
            .append_pair("limit", &request.limit.to_string())
            .append_pair("apiKey", api_key);

        let body: AggregatesResponse = get_json(&self.http, url, ENVELOPE_KEYS, None).await?;
        let bars = body.results.unwrap_or_default();
        debug!(bars = bars.len(), "aggregates received");
        Ok(bars)
    }
}

#[async_trait]
impl SeriesSource for PolygonClient {
    async fn aggregates(&self, request: &AggregatesRequest) -> Result<Vec<AggregateBar>, FetchError> {
        PolygonClient::aggregates(self, request).await
    }
}

impl std::fmt::Debug for PolygonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolygonClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
