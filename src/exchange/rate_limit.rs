// =============================================================================
// Request-Weight Tracker — keeps Binance-dialect exchanges below their limit
// =============================================================================
//
// Binance (and MEXC, which speaks the same dialect) charge every REST call a
// "weight" against a per-minute budget and answer 429/418 when it is exceeded.
// The tracker reads the `X-MBX-USED-WEIGHT-1M` response header after every
// request and refuses further requests locally once the market's ceiling is
// reached, so an oversized universe degrades into per-symbol `Throttled`
// failures instead of an IP ban. Spot and futures are separate budgets with
// separate ceilings, so each market gets its own tracker.
//
// Counters are atomics so the concurrent per-symbol fetches can share one
// tracker lock-free.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use tracing::{debug, warn};

/// Binance spot request-weight budget per minute.
pub const BINANCE_SPOT_LIMIT: u32 = 6_000;
/// Binance USD-M futures request-weight budget per minute.
pub const BINANCE_FUTURES_LIMIT: u32 = 2_400;
/// MEXC spot allows 500 weight per 10 s; tracked here per minute.
pub const MEXC_SPOT_LIMIT: u32 = 3_000;

const USED_WEIGHT_HEADER: &str = "x-mbx-used-weight-1m";

/// Thread-safe weight tracker backed by atomic counters.
pub struct WeightTracker {
    /// Ceiling at which we refuse to send additional requests.
    hard_limit: u32,
    used_weight_1m: AtomicU32,
    /// Minute (unix seconds / 60) the counter belongs to.
    window_minute: AtomicI64,
}

/// Serialisable view of the tracker for status payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub used_weight_1m: u32,
    pub hard_limit: u32,
}

impl WeightTracker {
    pub fn with_limit(hard_limit: u32) -> Self {
        Self {
            hard_limit,
            used_weight_1m: AtomicU32::new(0),
            window_minute: AtomicI64::new(current_minute()),
        }
    }

    /// Warn once usage crosses 80 % of the ceiling.
    fn warn_threshold(&self) -> u32 {
        self.hard_limit / 5 * 4
    }

    /// Reset the counter when the exchange's minute window has rolled over.
    fn roll_window(&self) {
        let now = current_minute();
        let prev = self.window_minute.swap(now, Ordering::Relaxed);
        if prev != now {
            self.used_weight_1m.store(0, Ordering::Relaxed);
        }
    }

    /// Update the counter from the response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(w) = headers
            .get(USED_WEIGHT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        self.roll_window();
        let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
        let threshold = self.warn_threshold();
        if w >= threshold && prev < threshold {
            warn!(
                used_weight = w,
                hard_limit = self.hard_limit,
                "request weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = w, "request weight updated from header");
    }

    /// Reserve `weight` if it fits under the hard limit. Returns `false` when
    /// the request must not be sent.
    pub fn try_acquire(&self, weight: u32) -> bool {
        self.roll_window();
        let reserved = self
            .used_weight_1m
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (current + weight <= self.hard_limit).then_some(current + weight)
            });
        match reserved {
            Ok(_) => true,
            Err(current) => {
                warn!(
                    current_weight = current,
                    requested_weight = weight,
                    hard_limit = self.hard_limit,
                    "request blocked, would exceed weight limit"
                );
                false
            }
        }
    }

    pub fn snapshot(&self) -> WeightSnapshot {
        WeightSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            hard_limit: self.hard_limit,
        }
    }
}

impl std::fmt::Debug for WeightTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("hard_limit", &self.hard_limit)
            .finish()
    }
}

fn current_minute() -> i64 {
    chrono::Utc::now().timestamp() / 60
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn header_sets_used_weight() {
        let tracker = WeightTracker::with_limit(BINANCE_SPOT_LIMIT);
        let mut headers = HeaderMap::new();
        headers.insert(USED_WEIGHT_HEADER, HeaderValue::from_static("420"));
        tracker.update_from_headers(&headers);
        assert_eq!(tracker.snapshot().used_weight_1m, 420);
    }

    #[test]
    fn acquire_refuses_past_hard_limit() {
        let tracker = WeightTracker::with_limit(BINANCE_FUTURES_LIMIT);
        let mut headers = HeaderMap::new();
        headers.insert(USED_WEIGHT_HEADER, HeaderValue::from_static("2395"));
        tracker.update_from_headers(&headers);

        assert!(tracker.try_acquire(5));
        assert!(!tracker.try_acquire(1));
        assert_eq!(tracker.snapshot().used_weight_1m, 2400);
    }

    #[test]
    fn full_spot_universe_fits_one_minute_budget() {
        // Bulk listing plus a single-symbol fetch for each of 600 USDT pairs.
        let tracker = WeightTracker::with_limit(BINANCE_SPOT_LIMIT);
        assert!(tracker.try_acquire(80));
        let allowed = (0..600).filter(|_| tracker.try_acquire(2)).count();
        assert_eq!(allowed, 600);
    }

    #[test]
    fn markets_have_independent_budgets() {
        let spot = WeightTracker::with_limit(BINANCE_SPOT_LIMIT);
        let futures = WeightTracker::with_limit(BINANCE_FUTURES_LIMIT);
        assert!(futures.try_acquire(BINANCE_FUTURES_LIMIT));
        assert!(!futures.try_acquire(1));
        assert!(spot.try_acquire(40));
        assert_eq!(spot.snapshot().hard_limit, 6_000);
    }

    #[test]
    fn garbage_header_is_ignored() {
        let tracker = WeightTracker::with_limit(BINANCE_SPOT_LIMIT);
        let mut headers = HeaderMap::new();
        headers.insert(USED_WEIGHT_HEADER, HeaderValue::from_static("lots"));
        tracker.update_from_headers(&headers);
        assert_eq!(tracker.snapshot().used_weight_1m, 0);
    }
}
