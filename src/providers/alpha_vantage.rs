// =============================================================================
// Alpha Vantage REST Client — global market status
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::FetchError;
use crate::providers::{endpoint, get_json};
use crate::runtime_config::ALPHA_VANTAGE_KEY_VAR;

/// Alpha Vantage answers errors and throttling with HTTP 200 and one of
/// these keys.
const ENVELOPE_KEYS: &[&str] = &["Error Message", "Note", "Information"];

/// Trading venue as reported by `MARKET_STATUS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketVenue {
    #[serde(default)]
    pub market_type: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub primary_exchanges: String,
    /// Local time, `HH:MM`.
    #[serde(default)]
    pub local_open: String,
    #[serde(default)]
    pub local_close: String,
    /// `open` or `closed`.
    #[serde(default)]
    pub current_status: String,
    #[serde(default)]
    pub notes: String,
}

impl MarketVenue {
    pub fn is_open(&self) -> bool {
        self.current_status.eq_ignore_ascii_case("open")
    }
}

#[derive(Debug, Deserialize)]
struct MarketStatusResponse {
    #[serde(default)]
    markets: Vec<MarketVenue>,
}

#[derive(Clone)]
pub struct AlphaVantageClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl AlphaVantageClient {
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

    /// GET /query?function=MARKET_STATUS
    #[instrument(skip(self), name = "alpha_vantage::market_status")]
    pub async fn market_status(&self) -> Result<Vec<MarketVenue>, FetchError> {
        let api_key = self.api_key.as_deref().ok_or(FetchError::MissingCredential {
            provider: "Alpha Vantage",
            env_var: ALPHA_VANTAGE_KEY_VAR,
        })?;
        let mut url = endpoint(&self.base_url, "/query")?;
        url.query_pairs_mut()
            .append_pair("function", "MARKET_STATUS")
            .append_pair("apikey", api_key);

        let body: MarketStatusResponse = get_json(&self.http, url, ENVELOPE_KEYS, None).await?;
        debug!(
            venues = body.markets.len(),
            open = body.markets.iter().filter(|m| m.is_open()).count(),
            "market status received"
        );
        Ok(body.markets)
    }
}

impl std::fmt::Debug for AlphaVantageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlphaVantageClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::serve;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;

    #[tokio::test]
    async fn parses_venues() {
        let router = Router::new().route(
            "/query",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(q["function"], "MARKET_STATUS");
                assert_eq!(q["apikey"], "av");
                Json(serde_json::json!({
                    "endpoint": "Global Market Open & Close Status",
                    "markets": [
                        {
                            "market_type": "Equity",
                            "region": "United States",
                            "primary_exchanges": "NASDAQ, NYSE, AMEX, BATS",
                            "local_open": "09:30",
                            "local_close": "16:15",
                            "current_status": "open",
                            "notes": ""
                        },
                        {
                            "market_type": "Equity",
                            "region": "Japan",
                            "primary_exchanges": "Tokyo",
                            "local_open": "09:00",
                            "local_close": "15:00",
                            "current_status": "closed",
                            "notes": ""
                        }
                    ]
                }))
            }),
        );
        let client = AlphaVantageClient::new(reqwest::Client::new(), serve(router).await, Some("av".into()));

        let venues = client.market_status().await.unwrap();
        assert_eq!(venues.len(), 2);
        assert!(venues[0].is_open());
        assert!(!venues[1].is_open());
    }

    #[tokio::test]
    async fn throttling_note_is_a_provider_error() {
        let router = Router::new().route(
            "/query",
            get(|| async {
                Json(serde_json::json!({
                    "Note": "Thank you for using Alpha Vantage! Our standard API call frequency is 5 calls per minute."
                }))
            }),
        );
        let client = AlphaVantageClient::new(reqwest::Client::new(), serve(router).await, Some("av".into()));

        match client.market_status().await {
            Err(FetchError::Provider(msg)) => assert!(msg.starts_with("Thank you")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_key_is_a_configuration_error() {
        let client = AlphaVantageClient::new(reqwest::Client::new(), "http://127.0.0.1:9", None);
        let err = client.market_status().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Alpha Vantage API key not configured (set ALPHA_VANTAGE_API_KEY)"
        );
    }
}
