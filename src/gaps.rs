// =============================================================================
// Gap Detector — records intervals the ingester was down for a trader
// =============================================================================
//
// A trader's snapshot cadence is expected every 5 minutes; silence longer
// than twice that (10 min) means the ingester was unavailable. On startup
// the detector scans every active trader's latest snapshot and opens a
// `data_gaps` row for the downtime interval. At runtime, the first
// successful snapshot write after a gap closes the open rows.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::Result;
use crate::storage::{Database, GapStats};

/// Silence threshold: 2x the expected 5-minute snapshot cadence.
pub const GAP_THRESHOLD: Duration = Duration::from_secs(10 * 60);

pub struct GapDetector {
    db: Arc<Database>,
    threshold: chrono::Duration,
}

impl GapDetector {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            threshold: chrono::Duration::from_std(GAP_THRESHOLD)
                .expect("gap threshold fits chrono range"),
        }
    }

    /// Startup scan: open a gap row for every active trader whose last
    /// snapshot is older than the threshold. Traders with no snapshot at
    /// all are new and have no coverage to be missing.
    pub async fn scan_on_startup(&self) -> Result<usize> {
        let now = Utc::now();
        let traders = self.db.get_active_traders().await?;
        let mut opened = 0usize;

        for trader in &traders {
            let last = match self.db.latest_snapshot_ts(trader.id).await {
                Ok(Some(ts)) => ts,
                Ok(None) => continue,
                Err(e) => {
                    warn!(address = %trader.address, error = %e, "gap scan read failed");
                    continue;
                }
            };

            let silence = now - last;
            if silence > self.threshold {
                match self.db.insert_gap(trader.id, last, now).await {
                    Ok(true) => {
                        opened += 1;
                        info!(
                            address = %trader.address,
                            gap_start = %last,
                            duration_minutes = silence.num_minutes(),
                            "data gap recorded"
                        );
                    }
                    Ok(false) => {}
                    Err(e) => warn!(address = %trader.address, error = %e, "gap insert failed"),
                }
            }
        }

        if opened > 0 {
            info!(opened, traders = traders.len(), "startup gap scan complete");
        }
        Ok(opened)
    }

    /// Called after a successful snapshot write: coverage has resumed, so
    /// any still-open gaps for the trader are resolved.
    pub async fn mark_recovered(&self, trader_id: i32) -> Result<()> {
        let resolved = self.db.resolve_open_gaps(trader_id, Utc::now()).await?;
        if resolved > 0 {
            info!(trader_id, resolved, "open data gaps resolved");
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<GapStats> {
        self.db.gap_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_twice_the_snapshot_cadence() {
        assert_eq!(GAP_THRESHOLD, Duration::from_secs(600));
    }

    #[test]
    fn silence_comparison_uses_chrono_duration() {
        let threshold = chrono::Duration::from_std(GAP_THRESHOLD).unwrap();
        let now = Utc::now();

        let fresh = now - chrono::Duration::minutes(5);
        assert!(now - fresh <= threshold);

        let stale = now - chrono::Duration::minutes(20);
        let silence = now - stale;
        assert!(silence > threshold);
        assert_eq!(silence.num_minutes(), 20);
    }
}
