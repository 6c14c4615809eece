// =============================================================================
// Bounded exponential backoff for adapter calls
// =============================================================================

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::exchange::AdapterError;

/// Backoff never waits longer than this between attempts.
const MAX_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Delay before attempt `n` (1-based, so the first retry is `n = 1`).
    pub fn delay(&self, n: u32) -> Duration {
        let factor = 1u32 << n.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(MAX_DELAY)
    }

    /// Run `op`, retrying connection-level failures only. Application errors
    /// (invalid symbol, rate limit, malformed payload) return immediately.
    ///
    /// No new attempt starts once `cancel` fires; the last error is returned
    /// instead. An attempt already running is not cut short.
    pub async fn run_until<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, AdapterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(err) if err.is_retryable() && attempt < self.attempts => {
                    let delay = self.delay(attempt);
                    debug!(attempt, ?delay, error = %err, "retrying after connection error");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(err),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_and_is_capped() {
        let p = RetryPolicy::new(3, Duration::from_millis(250));
        assert_eq!(p.delay(1), Duration::from_millis(250));
        assert_eq!(p.delay(2), Duration::from_millis(500));
        assert_eq!(p.delay(3), Duration::from_millis(1000));
        assert_eq!(p.delay(30), MAX_DELAY);
    }

    #[tokio::test]
    async fn retries_unreachable_up_to_attempts() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy::new(3, Duration::from_millis(1));
        let res: Result<(), _> = p
            .run_until(&CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AdapterError::Unreachable("down".into())) }
            })
            .await;
        assert!(matches!(res, Err(AdapterError::Unreachable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalid_symbol_is_not_retried() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy::new(3, Duration::from_millis(1));
        let res: Result<(), _> = p
            .run_until(&CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AdapterError::InvalidSymbol("NOPE".into())) }
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_further_attempts() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let p = RetryPolicy::new(5, Duration::from_millis(50));
        let res: Result<(), _> = p
            .run_until(&cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                cancel.cancel();
                async { Err(AdapterError::Unreachable("down".into())) }
            })
            .await;
        assert!(matches!(res, Err(AdapterError::Unreachable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy::new(3, Duration::from_millis(1));
        let res = p
            .run_until(&CancellationToken::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(AdapterError::Unreachable("blip".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(res, Ok(42));
    }
}
