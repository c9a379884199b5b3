// =============================================================================
// Exchange wire types — /info requests, typed responses, WebSocket frames
// =============================================================================
//
// The exchange speaks schemaless JSON; every request type gets a tagged
// struct here and responses are rejected on shape mismatch instead of being
// coerced. All monetary fields arrive as JSON strings and deserialize into
// `Decimal` directly.
// =============================================================================

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::Side;

// ---------------------------------------------------------------------------
// /info requests
// ---------------------------------------------------------------------------

/// Typed body for `POST /info`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InfoRequest {
    ClearinghouseState {
        user: String,
    },
    #[serde(rename_all = "camelCase")]
    UserFillsByTime {
        user: String,
        start_time: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    UserFunding {
        user: String,
        start_time: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<i64>,
    },
    Portfolio {
        user: String,
    },
    AllMids,
}

impl InfoRequest {
    /// Weight charged against the per-minute budget. Endpoints not listed by
    /// the exchange's docs default to 20.
    pub fn weight(&self) -> u32 {
        match self {
            Self::ClearinghouseState { .. } => 2,
            Self::AllMids => 2,
            Self::UserFillsByTime { .. } => 20,
            Self::UserFunding { .. } => 20,
            Self::Portfolio { .. } => 20,
        }
    }

    /// Stable name used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClearinghouseState { .. } => "clearinghouseState",
            Self::UserFillsByTime { .. } => "userFillsByTime",
            Self::UserFunding { .. } => "userFunding",
            Self::Portfolio { .. } => "portfolio",
            Self::AllMids => "allMids",
        }
    }
}

// ---------------------------------------------------------------------------
// clearinghouseState
// ---------------------------------------------------------------------------

/// Authoritative account snapshot for one trader.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearinghouseState {
    #[serde(default)]
    pub asset_positions: Vec<AssetPosition>,
    pub margin_summary: MarginSummary,
    #[serde(default)]
    pub time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPosition {
    pub position: PositionData,
    /// Exchange position mode label, e.g. "oneWay".
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionData {
    pub coin: String,
    /// Signed position size ("szi" on the wire): positive long, negative short.
    pub szi: Decimal,
    #[serde(default)]
    pub entry_px: Option<Decimal>,
    #[serde(default)]
    pub unrealized_pnl: Option<Decimal>,
    #[serde(default)]
    pub liquidation_px: Option<Decimal>,
    #[serde(default)]
    pub margin_used: Option<Decimal>,
    #[serde(default)]
    pub leverage: Option<Leverage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Leverage {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginSummary {
    pub account_value: Decimal,
    #[serde(default)]
    pub total_margin_used: Option<Decimal>,
    #[serde(default)]
    pub total_ntl_pos: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// userFillsByTime
// ---------------------------------------------------------------------------

/// One executed fill for a trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub coin: String,
    pub px: Decimal,
    /// Unsigned fill size.
    pub sz: Decimal,
    pub side: Side,
    /// Fill time, UTC milliseconds.
    pub time: i64,
    /// Signed position size immediately before this fill.
    #[serde(default)]
    pub start_position: Option<Decimal>,
    /// Direction label, e.g. "Open Long", "Long > Short".
    #[serde(default)]
    pub dir: Option<String>,
    pub closed_pnl: Decimal,
    pub fee: Decimal,
    /// Exchange-unique trade id; `(trader, tid)` is the dedupe key.
    pub tid: i64,
    #[serde(default)]
    pub oid: Option<i64>,
    #[serde(default)]
    pub hash: Option<String>,
    /// Present only on liquidation fills.
    #[serde(default)]
    pub liquidation: Option<serde_json::Value>,
}

impl Fill {
    pub fn is_liquidation(&self) -> bool {
        self.liquidation.is_some()
            || self
                .dir
                .as_deref()
                .is_some_and(|d| d.contains("Liquidat"))
    }

    /// Quote-denominated notional of this fill.
    pub fn notional(&self) -> Decimal {
        self.sz * self.px
    }
}

// ---------------------------------------------------------------------------
// userFunding
// ---------------------------------------------------------------------------

/// One funding ledger entry: `{time, delta: {coin, usdc, ...}}` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFundingEntry {
    /// Payment time, UTC milliseconds.
    pub time: i64,
    pub delta: FundingDelta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingDelta {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub coin: String,
    /// Signed USDC payment to the trader.
    pub usdc: Decimal,
    /// Position size at payment time.
    pub szi: Decimal,
    pub funding_rate: Decimal,
}

// ---------------------------------------------------------------------------
// allMids
// ---------------------------------------------------------------------------

/// The HTTP `allMids` response is a flat coin -> mid-price map.
pub type AllMids = HashMap<String, Decimal>;

// ---------------------------------------------------------------------------
// WebSocket frames
// ---------------------------------------------------------------------------

/// Channels pushed by the exchange socket.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WsSubscription {
    AllMids,
    UserEvents { user: String },
    WebData2 { user: String },
}

impl WsSubscription {
    /// Registry key; one fan-out channel exists per distinct key.
    pub fn key(&self) -> String {
        match self {
            Self::AllMids => "allMids".to_string(),
            Self::UserEvents { user } => format!("userEvents:{user}"),
            Self::WebData2 { user } => format!("webData2:{user}"),
        }
    }
}

/// Outbound control frame: `{"method": "subscribe", "subscription": {...}}`.
#[derive(Debug, Serialize)]
pub struct WsRequest<'a> {
    pub method: &'static str,
    pub subscription: &'a WsSubscription,
}

/// Every inbound frame is `{channel, data}`.
#[derive(Debug, Deserialize)]
pub struct WsFrame {
    pub channel: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// `allMids` frames wrap the map: `{"mids": {coin: px}}`.
#[derive(Debug, Deserialize)]
pub struct AllMidsData {
    pub mids: HashMap<String, Decimal>,
}

/// `userEvents` frame payload; exactly one of the variants is populated.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEventsData {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub fills: Option<Vec<Fill>>,
    #[serde(default)]
    pub funding: Option<WsFundingData>,
    #[serde(default)]
    pub liquidation: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsFundingData {
    pub time: i64,
    pub coin: String,
    pub usdc: Decimal,
    pub szi: Decimal,
    pub funding_rate: Decimal,
}

/// `webData2` frame payload: a periodic clearinghouse snapshot push.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebData2Data {
    #[serde(default)]
    pub user: Option<String>,
    pub clearinghouse_state: ClearinghouseState,
}

/// Typed event fanned out to WebSocket subscribers.
#[derive(Debug, Clone)]
pub enum WsEvent {
    AllMids(HashMap<String, Decimal>),
    Fills { user: String, fills: Vec<Fill> },
    Funding { user: String, entry: UserFundingEntry },
    PositionSnapshot { user: String, state: ClearinghouseState },
    /// Terminal signal: the client is closing, no more events will arrive.
    Closed,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_request_serializes_with_type_tag() {
        let req = InfoRequest::UserFillsByTime {
            user: "0xabc".into(),
            start_time: 1_700_000_000_000,
            end_time: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "userFillsByTime");
        assert_eq!(json["user"], "0xabc");
        assert_eq!(json["startTime"], 1_700_000_000_000i64);
        assert!(json.get("endTime").is_none());

        let req = InfoRequest::AllMids;
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "allMids");
    }

    #[test]
    fn request_weights_match_published_table() {
        assert_eq!(InfoRequest::ClearinghouseState { user: String::new() }.weight(), 2);
        assert_eq!(InfoRequest::AllMids.weight(), 2);
        assert_eq!(
            InfoRequest::UserFillsByTime { user: String::new(), start_time: 0, end_time: None }
                .weight(),
            20
        );
        assert_eq!(
            InfoRequest::UserFunding { user: String::new(), start_time: 0, end_time: None }
                .weight(),
            20
        );
        assert_eq!(InfoRequest::Portfolio { user: String::new() }.weight(), 20);
    }

    #[test]
    fn clearinghouse_state_deserializes() {
        let raw = r#"{
            "assetPositions": [
                {
                    "type": "oneWay",
                    "position": {
                        "coin": "ETH",
                        "szi": "2.5",
                        "entryPx": "1800.5",
                        "unrealizedPnl": "120.25",
                        "liquidationPx": null,
                        "marginUsed": "450.1",
                        "leverage": {"type": "cross", "value": 10}
                    }
                }
            ],
            "marginSummary": {
                "accountValue": "10000.75",
                "totalMarginUsed": "450.1",
                "totalNtlPos": "4501.25"
            },
            "time": 1700000000000
        }"#;

        let state: ClearinghouseState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.asset_positions.len(), 1);
        let pos = &state.asset_positions[0].position;
        assert_eq!(pos.coin, "ETH");
        assert_eq!(pos.szi, "2.5".parse::<Decimal>().unwrap());
        assert_eq!(pos.entry_px, Some("1800.5".parse().unwrap()));
        assert!(pos.liquidation_px.is_none());
        assert_eq!(pos.leverage.as_ref().unwrap().value, 10);
        assert_eq!(
            state.margin_summary.account_value,
            "10000.75".parse::<Decimal>().unwrap()
        );
    }

    #[test]
    fn fill_deserializes_and_flags_liquidations() {
        let raw = r#"{
            "coin": "BTC",
            "px": "43250.0",
            "sz": "0.5",
            "side": "A",
            "time": 1700000000123,
            "startPosition": "1.2",
            "dir": "Close Long",
            "closedPnl": "55.5",
            "fee": "9.7",
            "tid": 987654321,
            "oid": 12345,
            "hash": "0xdeadbeef"
        }"#;

        let fill: Fill = serde_json::from_str(raw).unwrap();
        assert_eq!(fill.side, Side::Sell);
        assert_eq!(fill.tid, 987654321);
        assert_eq!(fill.start_position, Some("1.2".parse().unwrap()));
        assert!(!fill.is_liquidation());
        assert_eq!(fill.notional(), "21625.0".parse::<Decimal>().unwrap());

        let liq = r#"{
            "coin": "BTC", "px": "40000", "sz": "1", "side": "A",
            "time": 1, "closedPnl": "-500", "fee": "0", "tid": 2,
            "dir": "Liquidated Isolated Long"
        }"#;
        let fill: Fill = serde_json::from_str(liq).unwrap();
        assert!(fill.is_liquidation());
    }

    #[test]
    fn funding_entry_unwraps_delta() {
        let raw = r#"{
            "time": 1700003600000,
            "delta": {
                "type": "funding",
                "coin": "ETH",
                "usdc": "-1.2345",
                "szi": "2.5",
                "fundingRate": "0.0000125"
            }
        }"#;

        let entry: UserFundingEntry = serde_json::from_str(raw).unwrap();
        assert_eq!(entry.delta.coin, "ETH");
        assert_eq!(entry.delta.usdc, "-1.2345".parse::<Decimal>().unwrap());
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        // Missing required `tid`.
        let raw = r#"{"coin":"BTC","px":"1","sz":"1","side":"B","time":1,"closedPnl":"0","fee":"0"}"#;
        assert!(serde_json::from_str::<Fill>(raw).is_err());

        // marginSummary missing entirely.
        let raw = r#"{"assetPositions": []}"#;
        assert!(serde_json::from_str::<ClearinghouseState>(raw).is_err());
    }

    #[test]
    fn ws_subscription_keys_and_frames() {
        let sub = WsSubscription::UserEvents { user: "0xabc".into() };
        assert_eq!(sub.key(), "userEvents:0xabc");

        let frame = serde_json::to_value(WsRequest { method: "subscribe", subscription: &sub })
            .unwrap();
        assert_eq!(frame["method"], "subscribe");
        assert_eq!(frame["subscription"]["type"], "userEvents");
        assert_eq!(frame["subscription"]["user"], "0xabc");

        let mids: AllMidsData =
            serde_json::from_str(r#"{"mids": {"BTC": "43000.5", "ETH": "2250.25"}}"#).unwrap();
        assert_eq!(mids.mids["BTC"], "43000.5".parse::<Decimal>().unwrap());
    }
}
