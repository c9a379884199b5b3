// =============================================================================
// Fills poll — userFillsByTime with a per-trader high-water mark
// =============================================================================
//
// The HWM is monotonically non-decreasing: it advances to the newest fill
// time after each emission and never moves on an empty response. It seeds
// from the latest persisted fill, falling back to one poll interval ago for
// traders with no history (the backfill worker owns anything older).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::SourceContext;
use crate::budget::Priority;
use crate::storage::TraderRow;
use crate::stream::{guarded, CircuitBreaker, RetryPolicy};
use crate::types::SourceEvent;

const STREAM_NAME: &str = "fills";
/// Concurrent per-trader requests (20-weight endpoint, keep it modest).
const POLL_CONCURRENCY: usize = 5;

/// Per-trader monotone high-water marks (UTC ms of the newest fill seen).
#[derive(Default)]
pub struct HighWaterMarks {
    marks: Mutex<HashMap<String, i64>>,
}

impl HighWaterMarks {
    pub fn get(&self, address: &str) -> Option<i64> {
        self.marks.lock().get(address).copied()
    }

    /// Install an initial mark; a no-op when one already exists.
    pub fn seed(&self, address: &str, mark: i64) {
        self.marks.lock().entry(address.to_string()).or_insert(mark);
    }

    /// Monotone advance: `max(current, newest)`.
    pub fn advance(&self, address: &str, newest: i64) {
        let mut marks = self.marks.lock();
        let entry = marks.entry(address.to_string()).or_insert(newest);
        if newest > *entry {
            *entry = newest;
        }
    }
}

pub struct FillsPoller {
    ctx: SourceContext,
    breaker: Arc<CircuitBreaker>,
    period: Duration,
    hwm: HighWaterMarks,
}

impl FillsPoller {
    pub fn new(ctx: SourceContext, breaker: Arc<CircuitBreaker>, period: Duration) -> Self {
        Self {
            ctx,
            breaker,
            period,
            hwm: HighWaterMarks::default(),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(period_secs = self.period.as_secs(), "fills poll started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("fills poll stopping");
                    return;
                }
            }

            let traders = match self.ctx.db.get_active_traders().await {
                Ok(traders) => traders,
                Err(e) => {
                    warn!(error = %e, "fills tick could not load traders");
                    continue;
                }
            };
            if traders.is_empty() {
                continue;
            }

            let results = futures_util::stream::iter(traders.into_iter())
                .map(|trader| {
                    let poller = self.clone();
                    async move {
                        let address = trader.address.clone();
                        let outcome = poller.poll_trader(trader).await;
                        (address, outcome)
                    }
                })
                .buffer_unordered(POLL_CONCURRENCY)
                .collect::<Vec<_>>()
                .await;

            for (address, outcome) in results {
                if let Err(e) = outcome {
                    warn!(address = %address, error = %e, "fills fetch failed");
                }
            }
        }
    }

    async fn poll_trader(&self, trader: TraderRow) -> crate::error::Result<()> {
        let since = self.since_for(&trader).await;

        let fills = guarded(
            STREAM_NAME,
            RetryPolicy::default(),
            &self.breaker,
            &self.ctx.metrics,
            || {
                self.ctx
                    .client
                    .user_fills_by_time(&trader.address, since, Priority::Polling)
            },
        )
        .await?;

        if fills.is_empty() {
            // No new fills: the HWM stays where it was.
            return Ok(());
        }

        let newest = fills.iter().map(|f| f.time).max().unwrap_or(since);
        let count = fills.len();

        let event = SourceEvent::Fills {
            address: trader.address.clone(),
            fills,
            at: Utc::now(),
        };
        if self.ctx.events.send(event).await.is_ok() {
            self.hwm.advance(&trader.address, newest);
            debug!(address = %trader.address, count, newest, "fills emitted");
        }

        Ok(())
    }

    /// Start of the next request window (exclusive of everything seen).
    async fn since_for(&self, trader: &TraderRow) -> i64 {
        if let Some(mark) = self.hwm.get(&trader.address) {
            return mark + 1;
        }

        let seed = match self.ctx.db.max_fill_time(trader.id).await {
            Ok(Some(ms)) => ms,
            Ok(None) => Utc::now().timestamp_millis() - self.period.as_millis() as i64,
            Err(e) => {
                warn!(address = %trader.address, error = %e, "HWM seed query failed");
                Utc::now().timestamp_millis() - self.period.as_millis() as i64
            }
        };

        self.hwm.seed(&trader.address, seed);
        seed + 1
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hwm_advances_monotonically() {
        let hwm = HighWaterMarks::default();
        let addr = "0xabc";

        hwm.advance(addr, 1_000);
        assert_eq!(hwm.get(addr), Some(1_000));

        hwm.advance(addr, 5_000);
        assert_eq!(hwm.get(addr), Some(5_000));

        // An older batch never moves the mark backwards.
        hwm.advance(addr, 2_000);
        assert_eq!(hwm.get(addr), Some(5_000));
    }

    #[test]
    fn seed_does_not_overwrite_existing_mark() {
        let hwm = HighWaterMarks::default();
        hwm.seed("0xabc", 10);
        hwm.seed("0xabc", 99);
        assert_eq!(hwm.get("0xabc"), Some(10));
        assert_eq!(hwm.get("0xdef"), None);
    }
}
