// =============================================================================
// Retry operator — exponential backoff around a fallible async operation
// =============================================================================

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{IndexerError, Result};

/// Backoff schedule for a retried operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
        }
    }
}

/// Tighter schedule used by the typed /info helpers.
pub const HTTP_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    initial_delay: Duration::from_secs(1),
    max_delay: Duration::from_secs(30),
    multiplier: 2.0,
};

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): initial * m^(n-1),
    /// capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Re-attempt `op` on transient failures following `policy`.
///
/// Non-transient errors (protocol mismatches, validation) propagate
/// immediately; after the final attempt the last error propagates whatever
/// its class.
pub async fn retry<T, F, Fut>(stream_name: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(stream = stream_name, attempt, "operation recovered after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_attempts && err.is_transient() => {
                let delay = policy.delay(attempt);
                warn!(
                    stream = stream_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> IndexerError {
        IndexerError::Transient("connection reset".into())
    }

    #[test]
    fn delay_schedule_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(2), Duration::from_millis(2000));
        assert_eq!(policy.delay(3), Duration::from_millis(4000));
        assert_eq!(policy.delay(6), Duration::from_millis(30_000));
        assert_eq!(policy.delay(20), Duration::from_millis(30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry("test", RetryPolicy::default(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts_and_propagates() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry("test", RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry("test", RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(IndexerError::Protocol("bad shape".into())) }
        })
        .await;

        assert!(matches!(result, Err(IndexerError::Protocol(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
