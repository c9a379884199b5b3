// =============================================================================
// Read API — Axum 0.7
// =============================================================================
//
// Thin reads over AppState and the repositories. Everything lives under
// `/api/v1/`; the prometheus exposition is mounted at `/metrics`. No
// authentication by design. CORS is permissive for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;
use crate::storage::{repos::ms_to_utc, Granularity};
use crate::types::validate_address;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/rate-budget", get(rate_budget))
        .route("/api/v1/traders", get(traders))
        .route("/api/v1/traders/:address/pnl", get(trader_pnl))
        .route("/api/v1/traders/:address/snapshots", get(trader_snapshots))
        .route("/api/v1/traders/:address/portfolio", get(trader_portfolio))
        .route("/api/v1/gaps", get(gaps))
        .route("/api/v1/streams", get(streams))
        .route("/metrics", get(metrics))
        .layer(cors)
        .with_state(state)
}

fn internal_error(err: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    warn!(error = %err, "read API request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
}

fn bad_request(msg: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": msg.into() })),
    )
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "ws_state": state.ws.connection_state(),
        "tracked_traders": state.tracked_traders(),
        "priced_coins": state.prices.count(),
        "server_time": Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Rate budget
// =============================================================================

async fn rate_budget(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.budget.stats())
}

// =============================================================================
// Traders
// =============================================================================

async fn traders(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.db.get_active_traders().await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn trader_pnl(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let address = match validate_address(&address) {
        Ok(address) => address,
        Err(e) => return bad_request(e.to_string()).into_response(),
    };

    match state.pnl_view(&address) {
        Some((live, breakdown)) => Json(serde_json::json!({
            "address": address,
            "pnl": breakdown,
            "trade_count": live.trade_count,
            "liquidation_count": live.liquidation_count,
            "flip_count": live.flip_count,
            "total_volume": live.total_volume,
            "positions": live.positions,
            "last_updated": live.last_updated,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "trader not subscribed" })),
        )
            .into_response(),
    }
}

/// Proxy the exchange's portfolio summary. Served at `user` priority: read
/// traffic may use the budget headroom above the polling target.
async fn trader_portfolio(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let address = match validate_address(&address) {
        Ok(address) => address,
        Err(e) => return bad_request(e.to_string()).into_response(),
    };

    match state
        .client
        .portfolio(&address, crate::budget::Priority::User)
        .await
    {
        Ok(payload) => Json(payload).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

// =============================================================================
// Snapshot ranges
// =============================================================================

#[derive(Deserialize)]
struct SnapshotRangeQuery {
    /// UTC milliseconds; defaults to 24 h ago.
    from: Option<i64>,
    /// UTC milliseconds; defaults to now.
    to: Option<i64>,
    /// raw | hourly | daily (default raw).
    granularity: Option<String>,
}

async fn trader_snapshots(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
    Query(query): Query<SnapshotRangeQuery>,
) -> impl IntoResponse {
    let address = match validate_address(&address) {
        Ok(address) => address,
        Err(e) => return bad_request(e.to_string()).into_response(),
    };

    let granularity = match query.granularity.as_deref() {
        None => Granularity::Raw,
        Some(raw) => match Granularity::parse(raw) {
            Some(g) => g,
            None => return bad_request("granularity must be raw, hourly or daily").into_response(),
        },
    };

    let now_ms = Utc::now().timestamp_millis();
    let to = ms_to_utc(query.to.unwrap_or(now_ms));
    let from = ms_to_utc(query.from.unwrap_or(now_ms - 24 * 3600 * 1000));
    if from > to {
        return bad_request("from must not be after to").into_response();
    }

    let trader = match state.db.get_trader(&address).await {
        Ok(Some(trader)) => trader,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "unknown trader" })),
            )
                .into_response()
        }
        Err(e) => return internal_error(e).into_response(),
    };

    match granularity {
        Granularity::Raw => match state.db.snapshots_range(trader.id, from, to).await {
            Ok(rows) => Json(rows).into_response(),
            Err(e) => internal_error(e).into_response(),
        },
        bucketed => match state.db.bucketed_range(trader.id, from, to, bucketed).await {
            Ok(rows) => Json(rows).into_response(),
            Err(e) => internal_error(e).into_response(),
        },
    }
}

// =============================================================================
// Gaps & stream health
// =============================================================================

async fn gaps(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.gaps.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn streams(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let breakers: Vec<_> = state
        .breakers
        .all()
        .iter()
        .map(|b| serde_json::json!({ "stream": b.name(), "state": b.state() }))
        .collect();
    Json(serde_json::json!({ "breakers": breakers }))
}

// =============================================================================
// Prometheus exposition
// =============================================================================

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let families = state.registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        return internal_error(e).into_response();
    }

    (
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}
