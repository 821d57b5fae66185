// =============================================================================
// Finnhub REST Client — quotes, company data, news and basic financials
// =============================================================================
//
// SECURITY: the API token travels as the `token` query parameter and is
// never logged; `Debug` redacts it.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::FetchError;
use crate::fetcher::QuoteSource;
use crate::providers::rate_limit::RateLimitTracker;
use crate::providers::{endpoint, get_json};
use crate::runtime_config::FINNHUB_KEY_VAR;

/// Finnhub reports failures as `{"error": "..."}`.
const ENVELOPE_KEYS: &[&str] = &["error"];

// =============================================================================
// Payloads
// =============================================================================

/// Real-time quote. `d` and `dp` are null for symbols without a previous
/// close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    #[serde(alias = "c")]
    pub current: f64,
    #[serde(alias = "d", default)]
    pub change: Option<f64>,
    #[serde(alias = "dp", default)]
    pub percent_change: Option<f64>,
    #[serde(alias = "h", default)]
    pub high: f64,
    #[serde(alias = "l", default)]
    pub low: f64,
    #[serde(alias = "o", default)]
    pub open: f64,
    #[serde(alias = "pc", default)]
    pub previous_close: f64,
    /// UNIX seconds of the last trade.
    #[serde(alias = "t", default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(alias = "finnhubIndustry", default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub ipo: Option<String>,
    /// Millions of `currency`.
    #[serde(alias = "marketCapitalization", default)]
    pub market_capitalization: Option<f64>,
    #[serde(alias = "shareOutstanding", default)]
    pub share_outstanding: Option<f64>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(alias = "weburl", default)]
    pub web_url: Option<String>,
}

impl CompanyProfile {
    /// Finnhub answers unknown symbols with `{}`.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.ticker.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub headline: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub source: String,
    /// UNIX seconds.
    #[serde(default)]
    pub datetime: i64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub related: Option<String>,
}

/// A metric is a number for most keys and a date string for a few.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub period: String,
    pub v: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialSeries {
    #[serde(default)]
    pub annual: BTreeMap<String, Vec<SeriesPoint>>,
    #[serde(default)]
    pub quarterly: BTreeMap<String, Vec<SeriesPoint>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicFinancials {
    #[serde(default)]
    pub symbol: Option<String>,
    /// `null` values are kept as `None` and treated as absent.
    #[serde(default)]
    pub metric: BTreeMap<String, Option<MetricValue>>,
    #[serde(default)]
    pub series: FinancialSeries,
}

// =============================================================================
// Client
// =============================================================================

#[derive(Clone)]
pub struct FinnhubClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    rate_limits: Arc<RateLimitTracker>,
}

impl FinnhubClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into();
        debug!(base_url = %base_url, has_token = token.is_some(), "FinnhubClient initialised");
        Self {
            http,
            base_url,
            token,
            rate_limits: Arc::new(RateLimitTracker::new()),
        }
    }

    pub fn rate_limits(&self) -> &Arc<RateLimitTracker> {
        &self.rate_limits
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn url(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, FetchError> {
        let token = self.token.as_deref().ok_or(FetchError::MissingCredential {
            provider: "Finnhub",
            env_var: FINNHUB_KEY_VAR,
        })?;
        let mut url = endpoint(&self.base_url, path)?;
        url.query_pairs_mut()
            .extend_pairs(params)
            .append_pair("token", token);
        Ok(url)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, FetchError> {
        get_json(&self.http, url, ENVELOPE_KEYS, Some(&self.rate_limits)).await
    }

    /// GET /quote
    #[instrument(skip(self), name = "finnhub::quote")]
    pub async fn quote(&self, symbol: &str) -> Result<Quote, FetchError> {
        let symbol = required_symbol(symbol)?;
        let url = self.url("/quote", &[("symbol", symbol)])?;
        let quote: Quote = self.get(url).await?;
        debug!(current = quote.current, "quote received");
        Ok(quote)
    }

    /// GET /stock/profile2. `None` when Finnhub knows no such company.
    #[instrument(skip(self), name = "finnhub::company_profile")]
    pub async fn company_profile(&self, symbol: &str) -> Result<Option<CompanyProfile>, FetchError> {
        let symbol = required_symbol(symbol)?;
        let url = self.url("/stock/profile2", &[("symbol", symbol)])?;
        let profile: CompanyProfile = self.get(url).await?;
        Ok((!profile.is_empty()).then_some(profile))
    }

    /// GET /company-news for `[from, to]`, first `limit` items.
    #[instrument(skip(self), name = "finnhub::company_news")]
    pub async fn company_news(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
        limit: usize,
    ) -> Result<Vec<NewsItem>, FetchError> {
        let symbol = required_symbol(symbol)?;
        if from > to {
            return Err(FetchError::InvalidRequest(format!(
                "news window starts after it ends ({from} > {to})"
            )));
        }
        let from = from.format("%Y-%m-%d").to_string();
        let to = to.format("%Y-%m-%d").to_string();
        let url = self.url(
            "/company-news",
            &[("symbol", symbol), ("from", from.as_str()), ("to", to.as_str())],
        )?;
        let body: serde_json::Value = self.get(url).await?;
        news_items(body, limit)
    }

    /// GET /news?category=...
    #[instrument(skip(self), name = "finnhub::market_news")]
    pub async fn market_news(&self, category: &str, limit: usize) -> Result<Vec<NewsItem>, FetchError> {
        let category = match category.trim() {
            "" => "general",
            c => c,
        };
        let url = self.url("/news", &[("category", category)])?;
        let body: serde_json::Value = self.get(url).await?;
        news_items(body, limit)
    }

    /// GET /stock/metric?metric=all
    #[instrument(skip(self), name = "finnhub::basic_financials")]
    pub async fn basic_financials(&self, symbol: &str) -> Result<BasicFinancials, FetchError> {
        let symbol = required_symbol(symbol)?;
        let url = self.url("/stock/metric", &[("symbol", symbol), ("metric", "all")])?;
        let financials: BasicFinancials = self.get(url).await?;
        debug!(metrics = financials.metric.len(), "basic financials received");
        Ok(financials)
    }
}

#[async_trait]
impl QuoteSource for FinnhubClient {
    async fn quote(&self, symbol: &str) -> Result<Quote, FetchError> {
        FinnhubClient::quote(self, symbol).await
    }
}

impl std::fmt::Debug for FinnhubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinnhubClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn required_symbol(symbol: &str) -> Result<&str, FetchError> {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return Err(FetchError::InvalidRequest("symbol is required".into()));
    }
    Ok(symbol)
}

/// A non-array news body counts as "no news".
fn news_items(body: serde_json::Value, limit: usize) -> Result<Vec<NewsItem>, FetchError> {
    if !body.is_array() {
        return Ok(Vec::new());
    }
    let mut items: Vec<NewsItem> = serde_json::from_value(body)?;
    items.truncate(limit);
    Ok(items)
}

// =============================================================================
// Tests
// =============================================================================
