// =============================================================================
// Stream operators — retry, circuit breaker, metrics
// =============================================================================
//
// Every source stream wraps its per-trader operations in the same three
// layers, innermost first: retry -> circuit breaker -> metrics. The breaker
// therefore counts one failure per *exhausted* retry sequence, and the
// metrics layer observes the final outcome and total latency of the guarded
// operation.
// =============================================================================

pub mod breaker;
pub mod metrics;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use metrics::StreamMetrics;
pub use retry::{retry, RetryPolicy};

use std::future::Future;
use std::time::Instant;

use crate::error::Result;

/// Run `op` through the full operator stack for the named stream.
pub async fn guarded<T, F, Fut>(
    stream_name: &str,
    policy: RetryPolicy,
    breaker: &CircuitBreaker,
    metrics: &StreamMetrics,
    op: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let result = breaker
        .call(|| retry(stream_name, policy, || op()))
        .await;

    match &result {
        Ok(_) => metrics.record_success(stream_name, started),
        Err(_) => metrics.record_error(stream_name, started),
    }

    result
}
