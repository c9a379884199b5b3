// =============================================================================
// Ingester — per-trader subscription lifecycle and the event fan-in loop
// =============================================================================
//
// All source events funnel into one mpsc channel consumed here, so folds for
// a given trader apply in arrival order. Writes happen before folds: the
// idempotent insert RETURNING tells us exactly which fills/funding rows are
// new, and only those reach the in-memory state, so hybrid WS + poll overlap
// never double-counts.
//
// The snapshot loop marks open positions to market with live mids, derives
// the PnL breakdown, bulk-upserts the snapshot rows, and resolves any open
// data gaps for traders that just regained coverage.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::error::Result;
use crate::exchange::types::{Fill, UserFundingEntry, WsSubscription};
use crate::pnl::{self, PnlState, Position};
use crate::sources::user_events::run_user_events;
use crate::storage::{repos::ms_to_utc, SnapshotRow};
use crate::types::{validate_address, IndexerEvent, SourceEvent};

struct SubHandle {
    sub: WsSubscription,
    forwarder: JoinHandle<()>,
}

pub struct Ingester {
    state: Arc<AppState>,
    /// Sender side of the ingest channel; dropped on shutdown so the event
    /// loop can drain and exit.
    intake: Mutex<Option<mpsc::Sender<SourceEvent>>>,
    subscriptions: Mutex<HashMap<String, SubHandle>>,
    /// Last account value per trader, from the latest clearinghouse poll.
    account_values: Mutex<HashMap<String, Decimal>>,
}

impl Ingester {
    pub fn new(state: Arc<AppState>, events_tx: mpsc::Sender<SourceEvent>) -> Self {
        Self {
            state,
            intake: Mutex::new(Some(events_tx)),
            subscriptions: Mutex::new(HashMap::new()),
            account_values: Mutex::new(HashMap::new()),
        }
    }

    fn intake_sender(&self) -> Option<mpsc::Sender<SourceEvent>> {
        self.intake.lock().clone()
    }

    // -------------------------------------------------------------------------
    // Subscription lifecycle
    // -------------------------------------------------------------------------

    /// Subscribe a batch of traders. Invalid addresses are fatal; an address
    /// already subscribed is a no-op.
    pub async fn start(&self, addresses: &[String]) -> Result<usize> {
        let mut started = 0;
        for raw in addresses {
            if self.start_one(raw).await? {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Subscribe one trader. Returns false when already subscribed.
    pub async fn start_one(&self, raw_address: &str) -> Result<bool> {
        let address = validate_address(raw_address)?;

        if self.subscriptions.lock().contains_key(&address)
            || self.state.pnl_states.read().contains_key(&address)
        {
            debug!(address = %address, "already subscribed");
            return Ok(false);
        }

        let trader = self.state.db.upsert_trader(&address).await?;
        let rebuilt = self.rebuild_state(trader.id, &address).await?;
        self.state.pnl_states.write().insert(address.clone(), rebuilt);

        if self.state.config.use_hybrid_mode {
            if let Some(events_tx) = self.intake_sender() {
                let sub = WsSubscription::UserEvents { user: address.clone() };
                let rx = self.state.ws.subscribe(sub.clone());
                let forwarder = tokio::spawn(run_user_events(address.clone(), rx, events_tx));
                self.subscriptions
                    .lock()
                    .insert(address.clone(), SubHandle { sub, forwarder });
            }
        }

        info!(address = %address, trader_id = trader.id, "trader subscribed");
        Ok(true)
    }

    /// Unsubscribe a trader and deactivate it so the polls skip it.
    pub async fn stop(&self, raw_address: &str) -> Result<()> {
        let address = validate_address(raw_address)?;

        if let Some(handle) = self.subscriptions.lock().remove(&address) {
            self.state.ws.unsubscribe(&handle.sub);
            handle.forwarder.abort();
        }

        self.state.db.deactivate_trader(&address).await?;
        self.state.pnl_states.write().remove(&address);
        self.account_values.lock().remove(&address);

        info!(address = %address, "trader unsubscribed");
        Ok(())
    }

    /// Tear down every subscription and close the intake channel so the
    /// event loop drains in-flight work and exits.
    pub fn shutdown(&self) {
        let mut subs = self.subscriptions.lock();
        for (_, handle) in subs.drain() {
            self.state.ws.unsubscribe(&handle.sub);
            handle.forwarder.abort();
        }
        drop(subs);

        self.intake.lock().take();
        info!("ingester shutdown: subscriptions removed, intake closed");
    }

    /// Rebuild in-memory state after a restart: seed the accumulators from
    /// the latest persisted snapshot and replay rows persisted after it.
    /// Fees before the snapshot are already folded into its trading PnL, so
    /// the seed starts with zero fees; positions arrive with the first
    /// clearinghouse poll.
    async fn rebuild_state(&self, trader_id: i32, address: &str) -> Result<PnlState> {
        let mut state = pnl::initial(trader_id, address);

        let snapshot = match self.state.db.latest_snapshot(trader_id).await? {
            Some(snapshot) => snapshot,
            None => return Ok(state),
        };

        state.realized_trading_pnl = snapshot.trading_pnl;
        state.realized_funding_pnl = snapshot.funding_pnl;
        state.total_volume = snapshot.total_volume;
        state.last_updated = snapshot.timestamp;

        let trades = self.state.db.trades_after(trader_id, snapshot.timestamp).await?;
        for trade in &trades {
            state.realized_trading_pnl += trade.closed_pnl;
            state.total_fees += trade.fee;
            state.total_volume += trade.size * trade.price;
            state.trade_count += 1;
        }

        let funding = self.state.db.funding_after(trader_id, snapshot.timestamp).await?;
        for row in &funding {
            state.realized_funding_pnl += row.payment;
        }

        if !trades.is_empty() || !funding.is_empty() {
            info!(
                address = %address,
                replayed_trades = trades.len(),
                replayed_funding = funding.len(),
                since = %snapshot.timestamp,
                "state rebuilt from snapshot + replay"
            );
        }

        Ok(state)
    }

    // -------------------------------------------------------------------------
    // Event fan-in
    // -------------------------------------------------------------------------

    /// Consume source events until every sender is gone, applying folds in
    /// arrival order per trader.
    pub async fn run_event_loop(self: Arc<Self>, mut events_rx: mpsc::Receiver<SourceEvent>) {
        info!("ingest event loop started");
        while let Some(event) = events_rx.recv().await {
            let address = event.address().to_string();
            if let Err(e) = self.handle_event(event).await {
                // Persistence errors drop the item for this tick; the write
                // path is idempotent so the next tick re-emits it.
                warn!(address = %address, error = %e, "event handling failed");
            }
        }
        info!("ingest event loop drained");
    }

    async fn handle_event(&self, event: SourceEvent) -> Result<()> {
        match event {
            SourceEvent::Positions { address, state, .. } => {
                self.handle_positions(&address, state).await
            }
            SourceEvent::Fills { address, fills, .. } => {
                self.handle_fills(&address, fills).await
            }
            SourceEvent::Funding { address, entries, .. } => {
                self.handle_funding(&address, entries).await
            }
        }
    }

    async fn handle_positions(
        &self,
        address: &str,
        clearinghouse: crate::exchange::types::ClearinghouseState,
    ) -> Result<()> {
        let positions: Vec<Position> = clearinghouse
            .asset_positions
            .iter()
            .map(|ap| Position::from_exchange(&ap.position))
            .collect();

        self.account_values
            .lock()
            .insert(address.to_string(), clearinghouse.margin_summary.account_value);

        let mut states = self.state.pnl_states.write();
        if let Some(state) = states.get_mut(address) {
            pnl::update_positions(state, positions);
        }
        Ok(())
    }

    async fn handle_fills(&self, address: &str, mut fills: Vec<Fill>) -> Result<()> {
        let trader_id = match self.trader_id(address) {
            Some(id) => id,
            None => return Ok(()), // not subscribed (late event after stop)
        };

        fills.sort_by_key(|f| (f.time, f.tid));

        // The write decides novelty: only tids that actually landed get
        // folded into memory.
        let inserted: HashSet<i64> = self
            .state
            .db
            .insert_trades(trader_id, &fills)
            .await?
            .into_iter()
            .collect();
        if inserted.is_empty() {
            return Ok(());
        }

        let new_fills: Vec<&Fill> = fills.iter().filter(|f| inserted.contains(&f.tid)).collect();

        {
            let mut states = self.state.pnl_states.write();
            if let Some(state) = states.get_mut(address) {
                for fill in &new_fills {
                    pnl::apply_trade(state, fill);
                }
            }
        }

        for fill in &new_fills {
            let _ = self.state.events_out.send(IndexerEvent::Fill {
                address: address.to_string(),
                coin: fill.coin.clone(),
                side: fill.side,
                size: fill.sz,
                price: fill.px,
                closed_pnl: fill.closed_pnl,
                timestamp: ms_to_utc(fill.time),
            });
        }

        debug!(address = %address, new = new_fills.len(), total = fills.len(), "fills applied");
        Ok(())
    }

    async fn handle_funding(&self, address: &str, mut entries: Vec<UserFundingEntry>) -> Result<()> {
        let trader_id = match self.trader_id(address) {
            Some(id) => id,
            None => return Ok(()),
        };

        entries.sort_by_key(|e| e.time);

        let inserted: HashSet<(String, DateTime<Utc>)> = self
            .state
            .db
            .insert_funding(trader_id, &entries)
            .await?
            .into_iter()
            .collect();
        if inserted.is_empty() {
            return Ok(());
        }

        let new_entries: Vec<&UserFundingEntry> = entries
            .iter()
            .filter(|e| inserted.contains(&(e.delta.coin.clone(), ms_to_utc(e.time))))
            .collect();

        {
            let mut states = self.state.pnl_states.write();
            if let Some(state) = states.get_mut(address) {
                for entry in &new_entries {
                    pnl::apply_funding(state, entry.delta.usdc);
                }
            }
        }

        for entry in &new_entries {
            let _ = self.state.events_out.send(IndexerEvent::Funding {
                address: address.to_string(),
                coin: entry.delta.coin.clone(),
                payment: entry.delta.usdc,
                timestamp: ms_to_utc(entry.time),
            });
        }

        debug!(address = %address, new = new_entries.len(), "funding applied");
        Ok(())
    }

    fn trader_id(&self, address: &str) -> Option<i32> {
        self.state.pnl_states.read().get(address).map(|s| s.trader_id)
    }

    // -------------------------------------------------------------------------
    // Snapshot cadence
    // -------------------------------------------------------------------------

    /// Emit a snapshot row per tracked trader every `snapshot_interval`.
    pub async fn run_snapshot_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.state.config.snapshot_interval();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(period_secs = period.as_secs(), "snapshot loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    // One final flush so shutdown loses at most nothing.
                    self.write_snapshots().await;
                    info!("snapshot loop stopping");
                    return;
                }
            }
            self.write_snapshots().await;
        }
    }

    async fn write_snapshots(&self) {
        let now = Utc::now();
        let mids = self.state.prices.get_all();
        let account_values = self.account_values.lock().clone();

        // Mark to market and derive rows under one short write lock.
        let pending: Vec<(String, SnapshotRow, pnl::PnlBreakdown, usize)> = {
            let mut states = self.state.pnl_states.write();
            states
                .iter_mut()
                .map(|(address, state)| {
                    pnl::mark_to_market(state, &mids);
                    let breakdown = pnl::calculate_pnl(state);
                    let row = SnapshotRow::from_state(
                        state,
                        &breakdown,
                        account_values.get(address).copied(),
                        now,
                    );
                    (address.clone(), row, breakdown, state.positions.len())
                })
                .collect()
        };

        if pending.is_empty() {
            return;
        }

        let rows: Vec<SnapshotRow> = pending.iter().map(|(_, row, _, _)| row.clone()).collect();
        if let Err(e) = self.state.db.upsert_snapshots(&rows).await {
            warn!(error = %e, count = rows.len(), "snapshot write failed, will retry next tick");
            return;
        }

        for (address, row, breakdown, open_positions) in pending {
            if let Err(e) = self.state.gaps.mark_recovered(row.trader_id).await {
                warn!(address = %address, error = %e, "gap resolution failed");
            }
            let _ = self.state.events_out.send(IndexerEvent::Snapshot {
                address,
                breakdown,
                open_positions,
                timestamp: now,
            });
        }

        debug!(count = rows.len(), "snapshots persisted");
    }
}
