// =============================================================================
// Rate-Limit Tracker — observes Finnhub API quota headers
// =============================================================================
//
// Finnhub reports its quota on every REST response:
//   - X-Ratelimit-Limit:     calls allowed per window
//   - X-Ratelimit-Remaining: calls left in the current window
//   - X-Ratelimit-Reset:     UNIX seconds at which the window resets
//
// The tracker keeps the latest values in atomics so the health endpoint can
// read them lock-free. It only observes: requests are never blocked.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Remaining-call fraction below which a warning is logged.
const LOW_REMAINING_FRACTION: f64 = 0.1;

const UNSET: u32 = u32::MAX;

/// Thread-safe quota tracker backed by atomics.
pub struct RateLimitTracker {
    limit: AtomicU32,
    remaining: AtomicU32,
    reset_at: AtomicI64,
    /// Responses that carried quota headers.
    observed: AtomicU64,
}

/// Serialisable view of the latest quota headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// UNIX seconds.
    pub reset_at: Option<i64>,
    pub responses_observed: u64,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            limit: AtomicU32::new(UNSET),
            remaining: AtomicU32::new(UNSET),
            reset_at: AtomicI64::new(0),
            observed: AtomicU64::new(0),
        }
    }

    /// Update the counters from a response's headers. Missing or unparsable
    /// headers leave the previous values in place.
    pub fn update_from_headers(&self, headers: &HeaderMap) {
        let limit = header_num::<u32>(headers, "x-ratelimit-limit");
        let remaining = header_num::<u32>(headers, "x-ratelimit-remaining");
        let reset = header_num::<i64>(headers, "x-ratelimit-reset");

        if limit.is_none() && remaining.is_none() && reset.is_none() {
            return;
        }
        self.observed.fetch_add(1, Ordering::Relaxed);

        if let Some(l) = limit {
            self.limit.store(l, Ordering::Relaxed);
        }
        if let Some(r) = reset {
            self.reset_at.store(r, Ordering::Relaxed);
        }
        if let Some(r) = remaining {
            let prev = self.remaining.swap(r, Ordering::Relaxed);
            let limit = self.limit.load(Ordering::Relaxed);
            if limit != UNSET && limit > 0 {
                let threshold = (limit as f64 * LOW_REMAINING_FRACTION).ceil() as u32;
                if r <= threshold && (prev == UNSET || prev > threshold) {
                    warn!(
                        remaining = r,
                        limit,
                        "Finnhub quota running low"
                    );
                }
            }
            debug!(remaining = r, "rate-limit remaining updated from header");
        }
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let opt = |v: u32| (v != UNSET).then_some(v);
        let reset = self.reset_at.load(Ordering::Relaxed);
        RateLimitSnapshot {
            limit: opt(self.limit.load(Ordering::Relaxed)),
            remaining: opt(self.remaining.load(Ordering::Relaxed)),
            reset_at: (reset != 0).then_some(reset),
            responses_observed: self.observed.load(Ordering::Relaxed),
        }
    }
}

fn header_num<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
