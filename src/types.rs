// =============================================================================
// Shared types used across the Meridian indexer
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::exchange::types::{ClearinghouseState, Fill, UserFundingEntry};
use crate::pnl::PnlBreakdown;

/// Fill side as reported by the exchange: `B` = buy, `A` = ask/sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "B")]
    Buy,
    #[serde(rename = "A")]
    Sell,
}

impl Side {
    pub fn is_buy(&self) -> bool {
        matches!(self, Self::Buy)
    }

    /// Single-letter wire form, also used as the DB column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "B",
            Self::Sell => "A",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Margin mode of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginType {
    Cross,
    Isolated,
}

impl MarginType {
    /// Parse the exchange's leverage `type` field; anything unknown is
    /// treated as cross (the exchange default).
    pub fn from_leverage_kind(kind: &str) -> Self {
        if kind.eq_ignore_ascii_case("isolated") {
            Self::Isolated
        } else {
            Self::Cross
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cross => "cross",
            Self::Isolated => "isolated",
        }
    }
}

// ---------------------------------------------------------------------------
// Address handling
// ---------------------------------------------------------------------------

/// Lowercase an address without validating it.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Validate and normalize a trader address.
///
/// Accepts exactly `0x` followed by 40 hex characters (either case) and
/// returns the lowercase form used as the canonical key everywhere.
pub fn validate_address(address: &str) -> Result<String, IndexerError> {
    let normalized = normalize_address(address);
    let hex_part = normalized
        .strip_prefix("0x")
        .ok_or_else(|| IndexerError::Validation(format!("address must start with 0x: {address}")))?;

    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(IndexerError::Validation(format!(
            "address must be 0x followed by 40 hex chars: {address}"
        )));
    }

    Ok(normalized)
}

// ---------------------------------------------------------------------------
// Decimal helpers
// ---------------------------------------------------------------------------

/// Round a monetary value to the 8 fractional digits persisted in the
/// database. Half-up rounding, never banker's.
pub fn db_decimal(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(8, RoundingStrategy::MidpointAwayFromZero)
}

// ---------------------------------------------------------------------------
// Pipeline events
// ---------------------------------------------------------------------------

/// Raw updates flowing from the source streams into the ingester.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// Authoritative clearinghouse snapshot for one trader.
    Positions {
        address: String,
        state: ClearinghouseState,
        at: DateTime<Utc>,
    },
    /// A batch of fills (from the poll or the WebSocket push).
    Fills {
        address: String,
        fills: Vec<Fill>,
        at: DateTime<Utc>,
    },
    /// A batch of funding payments.
    Funding {
        address: String,
        entries: Vec<UserFundingEntry>,
        at: DateTime<Utc>,
    },
}

impl SourceEvent {
    pub fn address(&self) -> &str {
        match self {
            Self::Positions { address, .. }
            | Self::Fills { address, .. }
            | Self::Funding { address, .. } => address,
        }
    }
}

/// Typed events published to downstream consumers (persistence observers,
/// the read API's live feed).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexerEvent {
    Fill {
        address: String,
        coin: String,
        side: Side,
        size: Decimal,
        price: Decimal,
        closed_pnl: Decimal,
        timestamp: DateTime<Utc>,
    },
    Funding {
        address: String,
        coin: String,
        payment: Decimal,
        timestamp: DateTime<Utc>,
    },
    Snapshot {
        address: String,
        breakdown: PnlBreakdown,
        open_positions: usize,
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_canonical_address() {
        let addr = "0x1234567890abcdef1234567890abcdef12345678";
        assert_eq!(validate_address(addr).unwrap(), addr);
    }

    #[test]
    fn validate_is_case_insensitive_and_idempotent() {
        let mixed = "0x1234567890ABCDEF1234567890abcdef12345678";
        let once = validate_address(mixed).unwrap();
        assert_eq!(once, mixed.to_lowercase());
        // Normalizing twice changes nothing.
        assert_eq!(validate_address(&once).unwrap(), once);
    }

    #[test]
    fn validate_rejects_bad_input() {
        assert!(validate_address("1234567890abcdef1234567890abcdef12345678").is_err());
        assert!(validate_address("0x1234").is_err());
        assert!(validate_address("0x1234567890abcdef1234567890abcdef1234567890").is_err());
        assert!(validate_address("0xz234567890abcdef1234567890abcdef12345678").is_err());
        assert!(validate_address("").is_err());
    }

    #[test]
    fn side_wire_form() {
        assert_eq!(Side::Buy.as_str(), "B");
        assert_eq!(Side::Sell.as_str(), "A");
        let side: Side = serde_json::from_str("\"A\"").unwrap();
        assert_eq!(side, Side::Sell);
        assert!(Side::Buy.is_buy());
    }

    #[test]
    fn db_decimal_rounds_half_up_to_8dp() {
        let d: Decimal = "0.123456785".parse().unwrap();
        assert_eq!(db_decimal(d).to_string(), "0.12345679");
        let neg: Decimal = "-0.123456785".parse().unwrap();
        assert_eq!(db_decimal(neg).to_string(), "-0.12345679");
    }

    #[test]
    fn margin_type_from_leverage_kind() {
        assert_eq!(MarginType::from_leverage_kind("isolated"), MarginType::Isolated);
        assert_eq!(MarginType::from_leverage_kind("cross"), MarginType::Cross);
        assert_eq!(MarginType::from_leverage_kind("oneWay"), MarginType::Cross);
    }
}
