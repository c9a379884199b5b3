// =============================================================================
// Funding poll — hourly userFunding sweep, sequential per trader
// =============================================================================
//
// Funding settles hourly, so this source runs sequentially at low rate. The
// request window overlaps the previous poll by one period; duplicates are
// absorbed by the `(trader, coin, time)` upsert-ignore in storage.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::fills::HighWaterMarks;
use super::SourceContext;
use crate::budget::Priority;
use crate::storage::TraderRow;
use crate::stream::{guarded, CircuitBreaker, RetryPolicy};
use crate::types::SourceEvent;

const STREAM_NAME: &str = "funding";

pub struct FundingPoller {
    ctx: SourceContext,
    breaker: Arc<CircuitBreaker>,
    period: Duration,
    hwm: HighWaterMarks,
}

impl FundingPoller {
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
        info!(period_secs = self.period.as_secs(), "funding poll started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("funding poll stopping");
                    return;
                }
            }

            let traders = match self.ctx.db.get_active_traders().await {
                Ok(traders) => traders,
                Err(e) => {
                    warn!(error = %e, "funding tick could not load traders");
                    continue;
                }
            };

            for trader in traders {
                if *shutdown.borrow() {
                    return;
                }
                if let Err(e) = self.poll_trader(&trader).await {
                    warn!(address = %trader.address, error = %e, "funding fetch failed");
                }
            }
        }
    }

    async fn poll_trader(&self, trader: &TraderRow) -> crate::error::Result<()> {
        let since = self.since_for(&trader.address);

        let entries = guarded(
            STREAM_NAME,
            RetryPolicy::default(),
            &self.breaker,
            &self.ctx.metrics,
            || {
                self.ctx
                    .client
                    .user_funding(&trader.address, since, Priority::Polling)
            },
        )
        .await?;

        if entries.is_empty() {
            return Ok(());
        }

        let newest = entries.iter().map(|e| e.time).max().unwrap_or(since);
        let count = entries.len();

        let event = SourceEvent::Funding {
            address: trader.address.clone(),
            entries,
            at: Utc::now(),
        };
        if self.ctx.events.send(event).await.is_ok() {
            self.hwm.advance(&trader.address, newest);
            debug!(address = %trader.address, count, "funding entries emitted");
        }

        Ok(())
    }

    fn since_for(&self, address: &str) -> i64 {
        if let Some(mark) = self.hwm.get(address) {
            return mark + 1;
        }
        // First poll: reach back two periods so a payment settled right
        // before startup is not missed.
        let seed = Utc::now().timestamp_millis() - 2 * self.period.as_millis() as i64;
        self.hwm.seed(address, seed);
        seed + 1
    }
}
