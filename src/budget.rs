// =============================================================================
// Rate-Budget Scheduler — weight-accounted fair share of the exchange quota
// =============================================================================
//
// The exchange enforces a weight-per-minute cap, not a request count. Every
// /info endpoint carries a known weight; this scheduler arbitrates the shared
// budget between three priority classes:
//
//   user     — read-API traffic, may saturate the hard ceiling (1200/min)
//   polling  — the ingestion polls, capped at the 80% target (960/min)
//   backfill — gets whatever user + polling leave unclaimed below the target
//
// The 1-minute window rolls lazily: every `record` and stats read checks the
// clock. The previous window's counters are retained for exactly one more
// rotation so the reporting view has a non-empty estimate right after a roll.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

/// Hard per-minute weight ceiling published by the exchange.
pub const MAX_WEIGHT_PER_MINUTE: u32 = 1200;

/// Self-imposed target for polling and backfill traffic (80% of the cap).
pub const POLLING_TARGET: u32 = MAX_WEIGHT_PER_MINUTE * 80 / 100;

/// Weight of one backfill day-chunk (fills 20 + funding 20).
const DAY_CHUNK_WEIGHT: u32 = 40;

const WINDOW: Duration = Duration::from_secs(60);

/// Priority class charged for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    User,
    Polling,
    Backfill,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Polling => write!(f, "polling"),
            Self::Backfill => write!(f, "backfill"),
        }
    }
}

/// Per-class weight counters inside one 60 s window.
#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    user: u32,
    polling: u32,
    backfill: u32,
}

impl Counters {
    fn total(&self) -> u32 {
        self.user + self.polling + self.backfill
    }
}

struct Inner {
    window_start: Instant,
    current: Counters,
    /// Counters of the window that just ended; dropped after one rotation.
    previous: Option<Counters>,
}

/// Weight breakdown exposed through the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetBreakdown {
    pub user: u32,
    pub polling: u32,
    pub backfill: u32,
}

/// Snapshot of the scheduler for the read API and dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStats {
    pub weight_per_min: u32,
    /// Percent of the hard cap in use, rounded.
    pub utilization: u32,
    pub target: u32,
    pub max: u32,
    pub breakdown: BudgetBreakdown,
    pub recommended_workers: u32,
    pub backfill_budget: u32,
}

/// Shared weight-budget scheduler. One instance per process, used by every
/// concurrent producer; all admission decisions happen under one mutex.
pub struct RateBudget {
    inner: Mutex<Inner>,
}

impl RateBudget {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                window_start: Instant::now(),
                current: Counters::default(),
                previous: None,
            }),
        }
    }

    /// Try to admit a request of `weight` under `priority`.
    ///
    /// Returns `true` and charges the weight on admission; `false` means the
    /// caller must back off and retry (see the info client's refusal loop).
    pub fn record(&self, priority: Priority, weight: u32) -> bool {
        let mut inner = self.inner.lock();
        Self::roll(&mut inner);

        let total = inner.current.total();
        let cap = match priority {
            Priority::User => MAX_WEIGHT_PER_MINUTE,
            Priority::Polling | Priority::Backfill => POLLING_TARGET,
        };

        if total + weight > cap {
            debug!(
                %priority,
                weight,
                current_total = total,
                cap,
                "rate budget refused request"
            );
            return false;
        }

        match priority {
            Priority::User => inner.current.user += weight,
            Priority::Polling => inner.current.polling += weight,
            Priority::Backfill => inner.current.backfill += weight,
        }

        if inner.current.total() as f64 >= MAX_WEIGHT_PER_MINUTE as f64 * 0.9 {
            warn!(
                total = inner.current.total(),
                max = MAX_WEIGHT_PER_MINUTE,
                "weight budget above 90% of the hard cap"
            );
        }

        true
    }

    /// Weight still available to backfill workers in this window.
    pub fn backfill_budget(&self) -> u32 {
        let mut inner = self.inner.lock();
        Self::roll(&mut inner);
        POLLING_TARGET.saturating_sub(inner.current.user + inner.current.polling)
    }

    /// How many backfill workers the current budget supports, clamped to
    /// [1, 5]. One worker consumes one day-chunk (weight 40) per request.
    pub fn recommended_workers(&self) -> u32 {
        (self.backfill_budget() / DAY_CHUNK_WEIGHT).clamp(1, 5)
    }

    /// Reporting snapshot. If the current window was just reset, the
    /// retained previous window backs the estimate instead of zeros.
    pub fn stats(&self) -> BudgetStats {
        let mut inner = self.inner.lock();
        Self::roll(&mut inner);

        let reported = if inner.current.total() == 0 {
            inner.previous.unwrap_or(inner.current)
        } else {
            inner.current
        };
        let total = reported.total();

        let backfill_budget =
            POLLING_TARGET.saturating_sub(inner.current.user + inner.current.polling);

        BudgetStats {
            weight_per_min: total,
            utilization: ((total as f64 / MAX_WEIGHT_PER_MINUTE as f64) * 100.0).round() as u32,
            target: POLLING_TARGET,
            max: MAX_WEIGHT_PER_MINUTE,
            breakdown: BudgetBreakdown {
                user: reported.user,
                polling: reported.polling,
                backfill: reported.backfill,
            },
            recommended_workers: (backfill_budget / DAY_CHUNK_WEIGHT).clamp(1, 5),
            backfill_budget,
        }
    }

    /// Lazy window rotation. Called with the lock held on every access.
    fn roll(inner: &mut Inner) {
        let elapsed = inner.window_start.elapsed();
        if elapsed < WINDOW {
            return;
        }

        let finished = std::mem::take(&mut inner.current);
        // Keep the just-finished window for one rotation only; if more than
        // two windows have passed the retained counters are stale too.
        inner.previous = if elapsed < WINDOW * 2 {
            Some(finished)
        } else {
            None
        };
        inner.window_start = Instant::now();
    }
}

impl Default for RateBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RateBudget")
            .field("user", &inner.current.user)
            .field("polling", &inner.current.polling)
            .field("backfill", &inner.current.backfill)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn admission_sequence_against_cap_and_target() {
        let budget = RateBudget::new();

        assert!(budget.record(Priority::User, 60));
        assert!(budget.record(Priority::Polling, 900)); // total 960 == target
        assert!(!budget.record(Priority::Polling, 1)); // would exceed target
        assert!(!budget.record(Priority::Backfill, 1));
        assert!(budget.record(Priority::User, 240)); // total 1200 == max
        assert!(!budget.record(Priority::User, 1));
    }

    #[test]
    fn backfill_gets_only_the_unclaimed_target() {
        let budget = RateBudget::new();
        assert!(budget.record(Priority::User, 100));
        assert!(budget.record(Priority::Polling, 400));
        assert_eq!(budget.backfill_budget(), 960 - 500);

        assert!(budget.record(Priority::Backfill, 460));
        // Backfill consumption does not shrink its own reported budget.
        assert_eq!(budget.backfill_budget(), 460);
        assert!(!budget.record(Priority::Backfill, 1));
    }

    #[test]
    fn recommended_workers_clamped() {
        let budget = RateBudget::new();
        // Full budget: 960 / 40 = 24, clamped to 5.
        assert_eq!(budget.recommended_workers(), 5);

        assert!(budget.record(Priority::Polling, 900));
        // 60 / 40 = 1.
        assert_eq!(budget.recommended_workers(), 1);

        assert!(budget.record(Priority::User, 300));
        // Target fully claimed: floor(0 / 40) = 0, clamped up to 1.
        assert_eq!(budget.recommended_workers(), 1);
    }

    #[test]
    fn stats_reflect_breakdown_and_utilization() {
        let budget = RateBudget::new();
        assert!(budget.record(Priority::User, 60));
        assert!(budget.record(Priority::Polling, 540));

        let stats = budget.stats();
        assert_eq!(stats.weight_per_min, 600);
        assert_eq!(stats.utilization, 50);
        assert_eq!(stats.max, 1200);
        assert_eq!(stats.target, 960);
        assert_eq!(stats.breakdown.user, 60);
        assert_eq!(stats.breakdown.polling, 540);
        assert_eq!(stats.breakdown.backfill, 0);
        assert_eq!(stats.backfill_budget, 960 - 600);
    }

    #[test]
    fn concurrent_records_never_exceed_caps() {
        let budget = Arc::new(RateBudget::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let b = budget.clone();
            handles.push(std::thread::spawn(move || {
                let mut admitted = 0u32;
                for _ in 0..200 {
                    if b.record(Priority::Polling, 7) {
                        admitted += 7;
                    }
                }
                admitted
            }));
        }

        let admitted_total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(admitted_total <= POLLING_TARGET);

        let stats = budget.stats();
        assert!(stats.weight_per_min <= POLLING_TARGET);
        assert_eq!(stats.breakdown.polling, admitted_total);
    }
}
