// =============================================================================
// Market-data providers — REST clients for Finnhub, Polygon and Alpha Vantage
// =============================================================================
//
// Each client owns its base URL and an optional credential. A missing
// credential fails the call before any request is built. All clients share
// one `reqwest::Client` and the JSON helper below, which maps transport,
// status, envelope and decode failures onto `FetchError`.
// =============================================================================

pub mod alpha_vantage;
pub mod finnhub;
pub mod polygon;
pub mod rate_limit;

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::FetchError;
use crate::providers::rate_limit::RateLimitTracker;

pub use alpha_vantage::AlphaVantageClient;
pub use finnhub::FinnhubClient;
pub use polygon::PolygonClient;

/// Build the HTTP client shared by every provider.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("market-pulse/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

/// Join `path` onto `base` without dropping any path prefix of the base.
pub(crate) fn endpoint(base: &str, path: &str) -> Result<Url, FetchError> {
    let raw = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    Url::parse(&raw).map_err(|e| FetchError::InvalidRequest(format!("bad endpoint '{raw}': {e}")))
}

/// GET `url` and decode the JSON body into `T`.
///
/// * non-2xx: `Status`, message taken from the body's `error`/`message`
///   field when present, otherwise `HTTP error! status: N`;
/// * 2xx object carrying one of `envelope_keys` as a string: `Provider`;
/// * body not matching `T`: `Malformed`.
pub(crate) async fn get_json<T: DeserializeOwned>(
    http: &reqwest::Client,
    url: Url,
    envelope_keys: &[&str],
    rate_limits: Option<&RateLimitTracker>,
) -> Result<T, FetchError> {
    let path = url.path().to_string();
    let resp = http.get(url).send().await?;

    if let Some(tracker) = rate_limits {
        tracker.update_from_headers(resp.headers());
    }

    let status = resp.status();
    let body = resp.text().await?;
    debug!(path = %path, status = status.as_u16(), bytes = body.len(), "provider response");

    if !status.is_success() {
        return Err(FetchError::Status {
            status: status.as_u16(),
            message: status_message(status.as_u16(), &body),
        });
    }

    let value: serde_json::Value = serde_json::from_str(&body)?;
    if let Some(message) = envelope_error(&value, envelope_keys) {
        return Err(FetchError::Provider(message));
    }

    Ok(serde_json::from_value(value)?)
}

fn status_message(status: u16, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            ["error", "message"]
                .iter()
                .find_map(|k| v.get(*k).and_then(|m| m.as_str()).map(str::to_string))
        })
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| format!("HTTP error! status: {status}"))
}

fn envelope_error(value: &serde_json::Value, keys: &[&str]) -> Option<String> {
    let obj = value.as_object()?;
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(|m| m.as_str()))
        .map(str::to_string)
}

// =============================================================================
// Test support: local HTTP server standing in for a provider
// =============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keeps_base_path() {
        let url = endpoint("https://finnhub.io/api/v1/", "/quote").unwrap();
        assert_eq!(url.as_str(), "https://finnhub.io/api/v1/quote");
        assert!(endpoint("::nope", "x").is_err());
    }

    #[test]
    fn status_message_prefers_body_text() {
        assert_eq!(status_message(429, r#"{"error":"API limit reached"}"#), "API limit reached");
        assert_eq!(
            status_message(403, r#"{"status":"NOT_AUTHORIZED","message":"Bad key"}"#),
            "Bad key"
        );
        assert_eq!(status_message(500, "<html>oops</html>"), "HTTP error! status: 500");
    }

    #[test]
    fn envelope_detection_is_key_scoped() {
        let v = serde_json::json!({ "error": "rate limited" });
        assert_eq!(envelope_error(&v, &["error"]).as_deref(), Some("rate limited"));
        assert_eq!(envelope_error(&v, &["Note"]), None);
        assert_eq!(envelope_error(&serde_json::json!([1, 2]), &["error"]), None);
    }
}
