// =============================================================================
// Rate-Limit Pacer — keeps venue API usage below 429 territory
// =============================================================================
//
// Two mechanisms, both enabled by default (EXCHANGE_RATE_LIMIT=0 disables):
//   - request pacing: a minimum interval between REST calls, per venue
//   - weight tracking: Binance reports `X-MBX-USED-WEIGHT-1M` on every
//     response; crossing the hard cap forces a backoff pause before the
//     next request
//
// Counters are atomics so the pacer can be queried lock-free from any task.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use tracing::{debug, warn};

use super::Venue;

/// Hard ceiling at which we stop and wait instead of sending more requests.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;
/// Backoff applied when the hard ceiling is reached.
const WEIGHT_BACKOFF_MS: u64 = 2_000;

pub struct RateLimitPacer {
    enabled: bool,
    min_interval_ms: i64,
    last_request_ms: AtomicI64,
    used_weight_1m: AtomicU32,
}

impl RateLimitPacer {
    pub fn new(venue: Venue, enabled: bool) -> Self {
        // Conservative spacing per venue; the loop is cadence-driven, so a
        // few tens of milliseconds between calls costs nothing.
        let min_interval_ms = match venue {
            Venue::Binance => 50,
            Venue::Bybit => 60,
            Venue::Mexc => 100,
        };
        Self {
            enabled,
            min_interval_ms,
            last_request_ms: AtomicI64::new(0),
            used_weight_1m: AtomicU32::new(0),
        }
    }

    /// Wait until a request may be sent: honors the per-venue spacing and
    /// backs off when the reported weight is at the hard ceiling.
    pub async fn pace(&self) {
        if !self.enabled {
            return;
        }

        if self.used_weight_1m.load(Ordering::Relaxed) >= WEIGHT_HARD_LIMIT {
            warn!(
                hard_limit = WEIGHT_HARD_LIMIT,
                backoff_ms = WEIGHT_BACKOFF_MS,
                "request weight at hard ceiling — backing off"
            );
            tokio::time::sleep(std::time::Duration::from_millis(WEIGHT_BACKOFF_MS)).await;
            // One backoff per observation; the next response refreshes the
            // counter from the header.
            self.used_weight_1m.store(0, Ordering::Relaxed);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let last = self.last_request_ms.load(Ordering::Relaxed);
        let elapsed = now - last;
        if elapsed < self.min_interval_ms {
            let wait = (self.min_interval_ms - elapsed) as u64;
            tokio::time::sleep(std::time::Duration::from_millis(wait)).await;
        }
        self.last_request_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Update counters from venue response headers. Only Binance reports
    /// usage this way; other venues rely on pacing alone.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(val) = headers.get("X-MBX-USED-WEIGHT-1M") else {
            return;
        };
        let Some(w) = val.to_str().ok().and_then(|s| s.parse::<u32>().ok()) else {
            return;
        };
        let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
        if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = w,
                hard_limit = WEIGHT_HARD_LIMIT,
                "rate-limit weight crossed warning threshold"
            );
        } else {
            debug!(used_weight_1m = w, "rate-limit weight updated");
        }
    }

    pub fn used_weight(&self) -> u32 {
        self.used_weight_1m.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RateLimitPacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitPacer")
            .field("enabled", &self.enabled)
            .field("min_interval_ms", &self.min_interval_ms)
            .field("used_weight_1m", &self.used_weight())
            .finish()
    }
}
