// =============================================================================
// Circuit breaker — closed / open / half-open load shedding per stream
// =============================================================================
//
// Counts consecutive failures while closed; at the threshold the circuit
// opens and every call is rejected for `reset_timeout`. The first calls
// afterwards run as half-open probes: if they all succeed the circuit closes,
// any failure re-opens it. State transitions are published on a watch channel
// so monitoring can follow along.
// =============================================================================

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{IndexerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures in `closed` before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub reset_timeout: Duration,
    /// Number of probe calls admitted while half-open.
    pub half_open_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_requests: 1,
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let (state_tx, _) = watch::channel(BreakerState::Closed);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
            }),
            state_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Observe state transitions (for monitoring).
    pub fn subscribe(&self) -> watch::Receiver<BreakerState> {
        self.state_tx.subscribe()
    }

    /// Admission check. While open, returns `CircuitOpen`; after the reset
    /// timeout the caller becomes a half-open probe.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_in_flight = 1;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(IndexerError::CircuitOpen(self.name.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_requests {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(IndexerError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_requests {
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    self.transition(&mut inner, BreakerState::Closed);
                    info!(stream = %self.name, "circuit closed after successful probes");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, BreakerState::Open);
                    warn!(
                        stream = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = 0;
                inner.half_open_successes = 0;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
                warn!(stream = %self.name, "probe failed, circuit re-opened");
            }
            BreakerState::Open => {}
        }
    }

    /// Wrap one operation: acquire, run, record the outcome.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire()?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    fn transition(&self, inner: &mut Inner, next: BreakerState) {
        inner.state = next;
        let _ = self.state_tx.send(next);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config(threshold: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(20),
            half_open_requests: 1,
        }
    }

    #[test]
    fn single_failure_opens_with_threshold_one() {
        let breaker = CircuitBreaker::new("fills", quick_config(1));
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Rejected while open.
        assert!(matches!(
            breaker.try_acquire(),
            Err(IndexerError::CircuitOpen(_))
        ));
    }

    #[test]
    fn closes_after_successful_probe() {
        let breaker = CircuitBreaker::new("fills", quick_config(1));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(25));

        // First call after the timeout is the half-open probe.
        breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn probe_failure_reopens() {
        let breaker = CircuitBreaker::new("funding", quick_config(1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(25));

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn success_resets_failure_count_in_closed() {
        let breaker = CircuitBreaker::new("positions", quick_config(3));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        // Two more failures stay below the threshold after the reset.
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn half_open_admits_limited_probes() {
        let breaker = CircuitBreaker::new("fills", quick_config(1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(25));

        breaker.try_acquire().unwrap();
        // Only one probe admitted while the first is in flight.
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn transitions_are_observable() {
        let breaker = CircuitBreaker::new("fills", quick_config(1));
        let rx = breaker.subscribe();
        assert_eq!(*rx.borrow(), BreakerState::Closed);

        breaker.record_failure();
        assert_eq!(*rx.borrow(), BreakerState::Open);
    }

    #[tokio::test]
    async fn call_records_outcomes() {
        let breaker = CircuitBreaker::new("fills", quick_config(1));

        let err: Result<()> = breaker
            .call(|| async { Err(IndexerError::Transient("boom".into())) })
            .await;
        assert!(err.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);

        // While open, the operation itself must not run.
        let ran = std::sync::atomic::AtomicBool::new(false);
        let shed: Result<()> = breaker
            .call(|| {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(shed, Err(IndexerError::CircuitOpen(_))));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
