// =============================================================================
// Meridian PnL Indexer — Main Entry Point
// =============================================================================
//
// Wires the process-wide services (rate budget, info client, WebSocket,
// price service, database), subscribes the configured trader roster, and
// spawns the ingestion loops. Shutdown tears everything down in reverse
// construction order after draining in-flight events.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod budget;
mod config;
mod error;
mod exchange;
mod gaps;
mod ingester;
mod pnl;
mod prices;
mod sources;
mod storage;
mod stream;
mod types;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, StreamBreakers};
use crate::budget::RateBudget;
use crate::config::RuntimeConfig;
use crate::exchange::{InfoClient, WsClient};
use crate::gaps::GapDetector;
use crate::ingester::Ingester;
use crate::prices::PriceService;
use crate::sources::{FillsPoller, FundingPoller, SourceContext};
use crate::storage::Database;
use crate::stream::{BreakerConfig, CircuitBreaker, StreamMetrics};

/// Ingest channel depth; sources block briefly when the fold loop lags.
const INGEST_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Meridian PnL Indexer — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load("meridian_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config file, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();
    config.validate()?;

    info!(
        traders = config.traders.len(),
        hybrid = config.use_hybrid_mode,
        api_url = %config.api_url,
        "configuration ready"
    );

    // ── 2. Storage ───────────────────────────────────────────────────────
    let db = Arc::new(Database::connect(&config.database_url, config.db_max_connections).await?);
    db.ensure_schema().await?;

    // ── 3. Process-wide services ─────────────────────────────────────────
    let budget = Arc::new(RateBudget::new());
    let client = Arc::new(InfoClient::new(config.api_url.clone(), budget.clone()));
    let ws = WsClient::new(config.ws_url.clone());

    let prices = Arc::new(PriceService::new());
    prices.start(&ws);

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(StreamMetrics::new(&registry)?);

    let breakers = StreamBreakers {
        positions: Arc::new(CircuitBreaker::new("positions", BreakerConfig::default())),
        fills: Arc::new(CircuitBreaker::new("fills", BreakerConfig::default())),
        funding: Arc::new(CircuitBreaker::new("funding", BreakerConfig::default())),
    };

    let gaps = Arc::new(GapDetector::new(db.clone()));

    let state = Arc::new(AppState::new(
        config.clone(),
        budget,
        client.clone(),
        ws.clone(),
        db.clone(),
        prices.clone(),
        registry,
        metrics.clone(),
        breakers,
        gaps.clone(),
    ));

    // ── 4. Startup gap scan ──────────────────────────────────────────────
    if let Err(e) = gaps.scan_on_startup().await {
        warn!(error = %e, "startup gap scan failed");
    }

    // ── 5. Ingester & trader roster ──────────────────────────────────────
    let (events_tx, events_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
    let ingester = Arc::new(Ingester::new(state.clone(), events_tx.clone()));

    let started = ingester.start(&config.traders).await?;
    info!(started, "trader roster subscribed");

    // Traders still active from a previous run keep flowing without being
    // re-listed in the config.
    for trader in db.get_active_traders().await? {
        ingester.start_one(&trader.address).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 6. Source streams ────────────────────────────────────────────────
    let ctx = SourceContext {
        db: db.clone(),
        client,
        metrics,
        events: events_tx,
    };

    tokio::spawn(sources::positions::run_positions_poll(
        ctx.clone(),
        state.breakers.positions.clone(),
        config.position_poll_interval(),
        shutdown_rx.clone(),
    ));

    let fills_poller = Arc::new(FillsPoller::new(
        ctx.clone(),
        state.breakers.fills.clone(),
        config.fills_poll_interval(),
    ));
    tokio::spawn(fills_poller.run(shutdown_rx.clone()));

    let funding_poller = Arc::new(FundingPoller::new(
        ctx,
        state.breakers.funding.clone(),
        config.funding_poll_interval(),
    ));
    tokio::spawn(funding_poller.run(shutdown_rx.clone()));

    info!("source streams launched");

    // ── 7. Fold & snapshot loops ─────────────────────────────────────────
    let event_loop = tokio::spawn(ingester.clone().run_event_loop(events_rx));
    let snapshot_loop = tokio::spawn(ingester.clone().run_snapshot_loop(shutdown_rx));

    // ── 8. Read API ──────────────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind read API");
                return;
            }
        };
        info!(addr = %bind_addr, "read API listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "read API server failed");
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    // Stop new ticks, then drop every ingest sender so the fold loop drains.
    let _ = shutdown_tx.send(true);
    ingester.shutdown();
    prices.stop(&ws);
    ws.close();

    let (fold, snapshots) = tokio::join!(event_loop, snapshot_loop);
    if let Err(e) = fold {
        warn!(error = %e, "event loop join failed");
    }
    if let Err(e) = snapshots {
        warn!(error = %e, "snapshot loop join failed");
    }

    db.close().await;
    info!("Meridian shut down complete");
    Ok(())
}
