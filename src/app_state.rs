// =============================================================================
// Central Application State — Meridian PnL Indexer
// =============================================================================
//
// The single source of truth shared by every async task via `Arc<AppState>`.
// The process-wide singletons (rate budget, WebSocket client, price service)
// are constructed once in main and injected here; nothing hides in module
// scope.
//
// Thread safety:
//   - parking_lot::RwLock for the live PnL state map.
//   - Arc wrappers for subsystems that manage their own interior mutability.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::budget::RateBudget;
use crate::config::RuntimeConfig;
use crate::exchange::{InfoClient, WsClient};
use crate::gaps::GapDetector;
use crate::pnl::{self, PnlBreakdown, PnlState};
use crate::prices::PriceService;
use crate::storage::Database;
use crate::stream::{CircuitBreaker, StreamMetrics};
use crate::types::IndexerEvent;

/// Downstream event fan-out capacity before slow consumers lag.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// One circuit breaker per source stream, exposed for the status endpoint.
pub struct StreamBreakers {
    pub positions: Arc<CircuitBreaker>,
    pub fills: Arc<CircuitBreaker>,
    pub funding: Arc<CircuitBreaker>,
}

impl StreamBreakers {
    pub fn all(&self) -> [&Arc<CircuitBreaker>; 3] {
        [&self.positions, &self.fills, &self.funding]
    }
}

/// Central application state shared across all async tasks.
pub struct AppState {
    pub config: RuntimeConfig,

    // ── Process-wide services (constructed in main, shut down in reverse) ──
    pub budget: Arc<RateBudget>,
    pub client: Arc<InfoClient>,
    pub ws: WsClient,
    pub db: Arc<Database>,
    pub prices: Arc<PriceService>,

    // ── Observability ───────────────────────────────────────────────────
    pub registry: prometheus::Registry,
    pub metrics: Arc<StreamMetrics>,
    pub breakers: StreamBreakers,

    // ── Live PnL state, keyed by normalized address ─────────────────────
    pub pnl_states: RwLock<HashMap<String, PnlState>>,

    // ── Coverage tracking ───────────────────────────────────────────────
    pub gaps: Arc<GapDetector>,

    // ── Downstream event feed ───────────────────────────────────────────
    pub events_out: broadcast::Sender<IndexerEvent>,

    pub start_time: Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        budget: Arc<RateBudget>,
        client: Arc<InfoClient>,
        ws: WsClient,
        db: Arc<Database>,
        prices: Arc<PriceService>,
        registry: prometheus::Registry,
        metrics: Arc<StreamMetrics>,
        breakers: StreamBreakers,
        gaps: Arc<GapDetector>,
    ) -> Self {
        let (events_out, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            budget,
            client,
            ws,
            db,
            prices,
            registry,
            metrics,
            breakers,
            pnl_states: RwLock::new(HashMap::new()),
            gaps,
            events_out,
            start_time: Instant::now(),
        }
    }

    /// Subscribe to the typed downstream event feed. Late subscribers miss
    /// earlier events; replays come from the database.
    pub fn subscribe_events(&self) -> broadcast::Receiver<IndexerEvent> {
        self.events_out.subscribe()
    }

    /// Live PnL view for one trader: a state clone plus its derived
    /// breakdown, or None when the trader is not subscribed.
    pub fn pnl_view(&self, address: &str) -> Option<(PnlState, PnlBreakdown)> {
        let states = self.pnl_states.read();
        states.get(address).map(|state| {
            let breakdown = pnl::calculate_pnl(state);
            (state.clone(), breakdown)
        })
    }

    pub fn tracked_traders(&self) -> usize {
        self.pnl_states.read().len()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
