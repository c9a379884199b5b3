// =============================================================================
// Positions poll — authoritative clearinghouse state every 30 seconds
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::SourceContext;
use crate::budget::Priority;
use crate::stream::{guarded, CircuitBreaker, RetryPolicy};
use crate::types::SourceEvent;

const STREAM_NAME: &str = "positions";
/// Traders fetched per batch; batches are separated by a 1 s pause so a
/// large roster spreads its weight across the window.
const BATCH_SIZE: usize = 50;
/// Concurrent requests within one batch.
const BATCH_CONCURRENCY: usize = 10;
const BATCH_DELAY: Duration = Duration::from_secs(1);

/// Poll `clearinghouseState` for every active trader on a fixed cadence.
/// The first tick fires immediately.
pub async fn run_positions_poll(
    ctx: SourceContext,
    breaker: Arc<CircuitBreaker>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(period_secs = period.as_secs(), "positions poll started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("positions poll stopping");
                return;
            }
        }

        let traders = match ctx.db.get_active_traders().await {
            Ok(traders) => traders,
            Err(e) => {
                warn!(error = %e, "positions tick could not load traders");
                continue;
            }
        };
        if traders.is_empty() {
            continue;
        }

        for (batch_idx, batch) in traders.chunks(BATCH_SIZE).enumerate() {
            if batch_idx > 0 {
                tokio::time::sleep(BATCH_DELAY).await;
            }

            let results = futures_util::stream::iter(batch.iter().cloned())
                .map(|trader| {
                    let client = ctx.client.clone();
                    let metrics = ctx.metrics.clone();
                    let breaker = breaker.clone();
                    async move {
                        let outcome = guarded(
                            STREAM_NAME,
                            RetryPolicy::default(),
                            &breaker,
                            &metrics,
                            || client.clearinghouse_state(&trader.address, Priority::Polling),
                        )
                        .await;
                        (trader.address, outcome)
                    }
                })
                .buffer_unordered(BATCH_CONCURRENCY)
                .collect::<Vec<_>>()
                .await;

            for (address, outcome) in results {
                match outcome {
                    Ok(state) => {
                        let event = SourceEvent::Positions {
                            address,
                            state,
                            at: Utc::now(),
                        };
                        if ctx.events.send(event).await.is_err() {
                            debug!("event channel closed, positions poll exiting");
                            return;
                        }
                    }
                    // Exhausted retries or an open breaker: skip this trader
                    // for the tick and move on.
                    Err(e) => warn!(address = %address, error = %e, "positions fetch failed"),
                }
            }
        }
    }
}
