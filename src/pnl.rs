// =============================================================================
// PnL Calculator — deterministic folds over per-trader state
// =============================================================================
//
// Every transition is a pure function of (state, event); callers own the
// ordering guarantees. Position membership changes only through
// `update_positions` (wholesale replacement from a clearinghouse snapshot):
// a fill does NOT touch the positions map, so between a fill and the next
// positions poll the unrealized side reflects the older snapshot. That skew
// is accepted; `mark_to_market` refreshes the per-position unrealized PnL
// from live mids without changing membership.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::exchange::types::{Fill, PositionData};
use crate::types::MarginType;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// One open position held by a trader.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub coin: String,
    /// Signed size: positive long, negative short.
    pub size: Decimal,
    pub entry_price: Decimal,
    /// Unrealized PnL as of the last update (clearinghouse or mark-to-market).
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
    pub liquidation_price: Option<Decimal>,
    pub margin_used: Decimal,
    pub margin_type: MarginType,
}

impl Position {
    /// Build from the exchange's clearinghouse representation.
    pub fn from_exchange(data: &PositionData) -> Self {
        let (leverage, margin_type) = match &data.leverage {
            Some(lev) => (lev.value, MarginType::from_leverage_kind(&lev.kind)),
            None => (1, MarginType::Cross),
        };

        Self {
            coin: data.coin.clone(),
            size: data.szi,
            entry_price: data.entry_px.unwrap_or_default(),
            unrealized_pnl: data.unrealized_pnl.unwrap_or_default(),
            leverage,
            liquidation_price: data.liquidation_px,
            margin_used: data.margin_used.unwrap_or_default(),
            margin_type,
        }
    }
}

/// Accumulated PnL state for one trader.
#[derive(Debug, Clone, Serialize)]
pub struct PnlState {
    pub trader_id: i32,
    pub address: String,
    pub realized_trading_pnl: Decimal,
    pub realized_funding_pnl: Decimal,
    pub total_fees: Decimal,
    pub total_volume: Decimal,
    pub trade_count: u64,
    pub liquidation_count: u64,
    pub flip_count: u64,
    /// Keys are exactly the coins with non-zero size.
    pub positions: HashMap<String, Position>,
    pub last_updated: DateTime<Utc>,
}

/// Derived PnL figures for one state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PnlBreakdown {
    pub realized: Decimal,
    pub unrealized: Decimal,
    pub total: Decimal,
    pub funding: Decimal,
    pub trading: Decimal,
    pub fees: Decimal,
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Fresh state with every accumulator at zero.
pub fn initial(trader_id: i32, address: impl Into<String>) -> PnlState {
    PnlState {
        trader_id,
        address: address.into(),
        realized_trading_pnl: Decimal::ZERO,
        realized_funding_pnl: Decimal::ZERO,
        total_fees: Decimal::ZERO,
        total_volume: Decimal::ZERO,
        trade_count: 0,
        liquidation_count: 0,
        flip_count: 0,
        positions: HashMap::new(),
        last_updated: Utc::now(),
    }
}

/// Fold one fill into the accumulators. Positions are untouched here.
pub fn apply_trade(state: &mut PnlState, fill: &Fill) {
    state.realized_trading_pnl += fill.closed_pnl;
    state.total_fees += fill.fee;
    state.total_volume += fill.notional();
    state.trade_count += 1;
    if fill.is_liquidation() {
        state.liquidation_count += 1;
    }
    if is_flip(fill) {
        state.flip_count += 1;
    }
    if let Some(ts) = DateTime::from_timestamp_millis(fill.time) {
        state.last_updated = ts;
    }
}

/// A flip is a single fill that crosses the position through zero.
///
/// Requires both the pre-fill signed position and the direction label; when
/// either is missing the fill is conservatively not counted.
pub fn is_flip(fill: &Fill) -> bool {
    let start = match (fill.start_position, fill.dir.as_deref()) {
        (Some(start), Some(_)) => start,
        _ => return false,
    };
    if start.is_zero() {
        return false;
    }

    let crosses = fill.sz > start.abs();
    if start > Decimal::ZERO {
        !fill.side.is_buy() && crosses
    } else {
        fill.side.is_buy() && crosses
    }
}

/// Fold one funding payment (signed USDC delta to the trader).
pub fn apply_funding(state: &mut PnlState, payment: Decimal) {
    state.realized_funding_pnl += payment;
}

/// Replace the positions map wholesale; zero-size entries are dropped so the
/// map keys stay exactly the open coins.
pub fn update_positions(state: &mut PnlState, positions: Vec<Position>) {
    state.positions = positions
        .into_iter()
        .filter(|p| !p.size.is_zero())
        .map(|p| (p.coin.clone(), p))
        .collect();
}

/// Mark-to-market unrealized PnL for a single position.
///
/// `(mark - entry) * |size| * sign(size)` — longs gain when the mark rises,
/// shorts when it falls.
pub fn unrealized_for(size: Decimal, entry: Decimal, mark: Decimal) -> Decimal {
    (mark - entry) * size.abs() * sign(size)
}

/// Refresh each position's unrealized PnL from the live mid map. Coins
/// without a mid keep their last cached value.
pub fn mark_to_market(state: &mut PnlState, mids: &HashMap<String, Decimal>) {
    for position in state.positions.values_mut() {
        if let Some(mark) = mids.get(&position.coin) {
            position.unrealized_pnl =
                unrealized_for(position.size, position.entry_price, *mark);
        }
    }
}

/// Derive the full breakdown from the current state.
pub fn calculate_pnl(state: &PnlState) -> PnlBreakdown {
    let fees = state.total_fees;
    let trading = state.realized_trading_pnl - fees;
    let funding = state.realized_funding_pnl;
    let realized = trading + funding;
    let unrealized: Decimal = state.positions.values().map(|p| p.unrealized_pnl).sum();

    PnlBreakdown {
        realized,
        unrealized,
        total: realized + unrealized,
        funding,
        trading,
        fees,
    }
}

fn sign(value: Decimal) -> Decimal {
    if value.is_zero() {
        Decimal::ZERO
    } else if value > Decimal::ZERO {
        Decimal::ONE
    } else {
        Decimal::NEGATIVE_ONE
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn fill(side: Side, sz: &str, start_position: Option<&str>, dir: Option<&str>) -> Fill {
        Fill {
            coin: "ETH".into(),
            px: dec("2000"),
            sz: dec(sz),
            side,
            time: 1_700_000_000_000,
            start_position: start_position.map(dec),
            dir: dir.map(str::to_string),
            closed_pnl: Decimal::ZERO,
            fee: Decimal::ZERO,
            tid: 1,
            oid: None,
            hash: None,
            liquidation: None,
        }
    }

    fn position(coin: &str, size: &str, entry: &str, unrealized: &str) -> Position {
        Position {
            coin: coin.into(),
            size: dec(size),
            entry_price: dec(entry),
            unrealized_pnl: dec(unrealized),
            leverage: 1,
            liquidation_price: None,
            margin_used: Decimal::ZERO,
            margin_type: MarginType::Cross,
        }
    }

    #[test]
    fn flip_detection_scenarios() {
        // Long 5, sell 8: crosses through zero.
        assert!(is_flip(&fill(Side::Sell, "8", Some("5"), Some("Long > Short"))));
        // Long 5, sell 3: partial close, no flip.
        assert!(!is_flip(&fill(Side::Sell, "3", Some("5"), Some("Close Long"))));
        // Flat start is never a flip.
        assert!(!is_flip(&fill(Side::Sell, "8", Some("0"), Some("Open Short"))));
        // Short -2, buy 5: crosses.
        assert!(is_flip(&fill(Side::Buy, "5", Some("-2"), Some("Short > Long"))));
        // Short -2, buy 2: exact close, not a cross.
        assert!(!is_flip(&fill(Side::Buy, "2", Some("-2"), Some("Close Short"))));
        // Missing metadata disables detection.
        assert!(!is_flip(&fill(Side::Sell, "8", None, Some("Close Long"))));
        assert!(!is_flip(&fill(Side::Sell, "8", Some("5"), None)));
    }

    #[test]
    fn apply_trade_accumulates() {
        let mut state = initial(1, "0xabc");
        let mut f = fill(Side::Buy, "2", Some("0"), Some("Open Long"));
        f.closed_pnl = dec("10.5");
        f.fee = dec("1.25");

        apply_trade(&mut state, &f);
        assert_eq!(state.realized_trading_pnl, dec("10.5"));
        assert_eq!(state.total_fees, dec("1.25"));
        assert_eq!(state.total_volume, dec("4000")); // 2 * 2000
        assert_eq!(state.trade_count, 1);
        assert_eq!(state.flip_count, 0);
        assert_eq!(state.liquidation_count, 0);
        assert_eq!(state.last_updated.timestamp_millis(), 1_700_000_000_000);
        // Positions untouched by trades.
        assert!(state.positions.is_empty());
    }

    #[test]
    fn liquidation_and_flip_counters() {
        let mut state = initial(1, "0xabc");

        let mut liq = fill(Side::Sell, "8", Some("5"), Some("Long > Short"));
        liq.liquidation = Some(serde_json::json!({"liquidatedUser": "0xabc"}));
        apply_trade(&mut state, &liq);

        assert_eq!(state.liquidation_count, 1);
        assert_eq!(state.flip_count, 1);
    }

    #[test]
    fn pnl_sum_invariant() {
        let mut state = initial(7, "0xabc");
        state.realized_trading_pnl = dec("100");
        state.total_fees = dec("5");
        state.realized_funding_pnl = dec("10");
        update_positions(
            &mut state,
            vec![
                position("ETH", "2", "100", "20"),
                position("BTC", "-1", "50", "-5"),
            ],
        );

        let pnl = calculate_pnl(&state);
        assert_eq!(pnl.trading, dec("95"));
        assert_eq!(pnl.funding, dec("10"));
        assert_eq!(pnl.realized, dec("105"));
        assert_eq!(pnl.unrealized, dec("15"));
        assert_eq!(pnl.total, dec("120"));
        assert_eq!(pnl.fees, dec("5"));

        // total == (trading - fees already folded) + funding + unrealized
        assert_eq!(
            pnl.total,
            (state.realized_trading_pnl - state.total_fees)
                + state.realized_funding_pnl
                + pnl.unrealized
        );
    }

    #[test]
    fn unrealized_for_short_position() {
        // Short 2 @ 100, mark 90: (90-100) * 2 * (-1) = +20.
        assert_eq!(unrealized_for(dec("-2"), dec("100"), dec("90")), dec("20"));
        // Long 2 @ 100, mark 90: -20.
        assert_eq!(unrealized_for(dec("2"), dec("100"), dec("90")), dec("-20"));
        // Flat contributes nothing.
        assert_eq!(unrealized_for(dec("0"), dec("100"), dec("90")), dec("0"));
    }

    #[test]
    fn update_positions_drops_zero_sizes() {
        let mut state = initial(1, "0xabc");
        update_positions(
            &mut state,
            vec![
                position("ETH", "2", "100", "0"),
                position("BTC", "0", "50", "0"),
                position("SOL", "-3", "20", "0"),
            ],
        );

        let mut coins: Vec<_> = state.positions.keys().cloned().collect();
        coins.sort();
        assert_eq!(coins, vec!["ETH", "SOL"]);

        // A later snapshot replaces wholesale.
        update_positions(&mut state, vec![position("BTC", "1", "40000", "0")]);
        assert_eq!(state.positions.len(), 1);
        assert!(state.positions.contains_key("BTC"));
    }

    #[test]
    fn mark_to_market_refreshes_known_coins_only() {
        let mut state = initial(1, "0xabc");
        update_positions(
            &mut state,
            vec![
                position("ETH", "2", "2000", "0"),
                position("BTC", "-1", "40000", "123"),
            ],
        );

        let mut mids = HashMap::new();
        mids.insert("ETH".to_string(), dec("2100"));
        mark_to_market(&mut state, &mids);

        assert_eq!(state.positions["ETH"].unrealized_pnl, dec("200"));
        // No BTC mid: cached value survives.
        assert_eq!(state.positions["BTC"].unrealized_pnl, dec("123"));
    }

    #[test]
    fn funding_folds_into_realized_funding() {
        let mut state = initial(1, "0xabc");
        apply_funding(&mut state, dec("-1.5"));
        apply_funding(&mut state, dec("0.25"));
        assert_eq!(state.realized_funding_pnl, dec("-1.25"));

        let pnl = calculate_pnl(&state);
        assert_eq!(pnl.funding, dec("-1.25"));
        assert_eq!(pnl.total, dec("-1.25"));
    }

    #[test]
    fn decimal_addition_is_exact() {
        assert_eq!(dec("0.1") + dec("0.2"), dec("0.3"));
    }

    #[test]
    fn empty_state_is_all_zero() {
        let state = initial(1, "0xabc");
        let pnl = calculate_pnl(&state);
        assert_eq!(pnl.total, Decimal::ZERO);
        assert_eq!(pnl.realized, Decimal::ZERO);
        assert_eq!(pnl.unrealized, Decimal::ZERO);
    }
}
