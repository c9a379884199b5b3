// =============================================================================
// Repositories — idempotent writes and range reads
// =============================================================================
//
// Write contracts:
//   trades    ON CONFLICT (trader_id, tid) DO NOTHING, RETURNING the keys
//             that actually landed (the write is the dedupe source of truth)
//   funding   ON CONFLICT (trader_id, coin, time) DO NOTHING, same RETURNING
//   snapshots ON CONFLICT (trader_id, timestamp) DO UPDATE, all numeric
//             columns replaced by the incoming row
//   gaps      ON CONFLICT DO NOTHING on (trader_id, gap_start, gap_type)
//
// Bulk inserts build a single multi-row statement; empty input is a no-op.
// Every decimal is rounded to 8 fractional digits before binding.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{QueryBuilder, Row};

use super::Database;
use crate::error::Result;
use crate::exchange::types::{Fill, UserFundingEntry};
use crate::pnl::{PnlBreakdown, PnlState};
use crate::types::db_decimal;

/// Millisecond wire timestamps become TIMESTAMPTZ columns.
pub fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TraderRow {
    pub id: i32,
    pub address: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TradeRow {
    pub coin: String,
    pub side: String,
    pub size: Decimal,
    pub price: Decimal,
    pub closed_pnl: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
    pub tid: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FundingRow {
    pub coin: String,
    pub time: DateTime<Utc>,
    pub payment: Decimal,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SnapshotRow {
    pub trader_id: i32,
    pub timestamp: DateTime<Utc>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
    pub funding_pnl: Decimal,
    pub trading_pnl: Decimal,
    pub open_positions: i32,
    pub total_volume: Decimal,
    pub account_value: Option<Decimal>,
}

impl SnapshotRow {
    /// Build the persisted row from the live state and its derived
    /// breakdown, rounding every decimal to the stored precision.
    pub fn from_state(
        state: &PnlState,
        pnl: &PnlBreakdown,
        account_value: Option<Decimal>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            trader_id: state.trader_id,
            timestamp,
            realized_pnl: db_decimal(pnl.realized),
            unrealized_pnl: db_decimal(pnl.unrealized),
            total_pnl: db_decimal(pnl.total),
            funding_pnl: db_decimal(pnl.funding),
            trading_pnl: db_decimal(pnl.trading),
            open_positions: state.positions.len() as i32,
            total_volume: db_decimal(state.total_volume),
            account_value: account_value.map(db_decimal),
        }
    }
}

/// Time-bucketed pre-aggregated view (pnl_hourly / pnl_daily).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BucketRow {
    pub bucket: DateTime<Utc>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
    pub funding_pnl: Decimal,
    pub trading_pnl: Decimal,
    pub positions: i32,
    pub volume: Decimal,
    pub account_value: Option<Decimal>,
}

/// Read granularity for snapshot range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Raw,
    Hourly,
    Daily,
}

impl Granularity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(Self::Raw),
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            _ => None,
        }
    }

    /// Pre-aggregated table backing this granularity (None for raw).
    pub fn bucket_table(&self) -> Option<&'static str> {
        match self {
            Self::Raw => None,
            Self::Hourly => Some("pnl_hourly"),
            Self::Daily => Some("pnl_daily"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GapStats {
    pub unresolved: i64,
    pub traders_affected: i64,
    pub oldest_open: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Traders
// ---------------------------------------------------------------------------

impl Database {
    /// Create the trader on first subscription, or touch and re-activate an
    /// existing row. The address must already be normalized lowercase.
    pub async fn upsert_trader(&self, address: &str) -> Result<TraderRow> {
        let row = sqlx::query_as::<_, TraderRow>(
            r#"
            INSERT INTO traders (address) VALUES ($1)
            ON CONFLICT (address) DO UPDATE
                SET last_updated_at = NOW(), is_active = TRUE
            RETURNING id, address, first_seen_at, last_updated_at, is_active
            "#,
        )
        .bind(address)
        .fetch_one(self.pool())
        .await?;

        Ok(row)
    }

    pub async fn get_trader(&self, address: &str) -> Result<Option<TraderRow>> {
        let row = sqlx::query_as::<_, TraderRow>(
            "SELECT id, address, first_seen_at, last_updated_at, is_active
             FROM traders WHERE address = $1",
        )
        .bind(address)
        .fetch_optional(self.pool())
        .await?;

        Ok(row)
    }

    pub async fn get_active_traders(&self) -> Result<Vec<TraderRow>> {
        let rows = sqlx::query_as::<_, TraderRow>(
            "SELECT id, address, first_seen_at, last_updated_at, is_active
             FROM traders WHERE is_active ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    pub async fn deactivate_trader(&self, address: &str) -> Result<()> {
        sqlx::query(
            "UPDATE traders SET is_active = FALSE, last_updated_at = NOW() WHERE address = $1",
        )
        .bind(address)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

impl Database {
    /// Bulk-insert fills; duplicates on `(trader_id, tid)` are ignored.
    /// Returns the tids that were actually inserted, which callers use to
    /// apply each fill to in-memory state at most once.
    pub async fn insert_trades(&self, trader_id: i32, fills: &[Fill]) -> Result<Vec<i64>> {
        if fills.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::new(
            "INSERT INTO trades \
             (trader_id, coin, side, size, price, closed_pnl, fee, timestamp, tx_hash, oid, tid) ",
        );
        qb.push_values(fills, |mut b, fill| {
            b.push_bind(trader_id)
                .push_bind(&fill.coin)
                .push_bind(fill.side.as_str())
                .push_bind(db_decimal(fill.sz))
                .push_bind(db_decimal(fill.px))
                .push_bind(db_decimal(fill.closed_pnl))
                .push_bind(db_decimal(fill.fee))
                .push_bind(ms_to_utc(fill.time))
                .push_bind(fill.hash.clone())
                .push_bind(fill.oid)
                .push_bind(fill.tid);
        });
        qb.push(" ON CONFLICT (trader_id, tid) DO NOTHING RETURNING tid");

        let rows = qb.build().fetch_all(self.pool()).await?;
        Ok(rows.iter().map(|row| row.get::<i64, _>("tid")).collect())
    }

    /// High-water mark seed: latest persisted fill time in milliseconds.
    pub async fn max_fill_time(&self, trader_id: i32) -> Result<Option<i64>> {
        // MAX over zero rows yields a single NULL row.
        let row = sqlx::query("SELECT MAX(timestamp) AS max_ts FROM trades WHERE trader_id = $1")
            .bind(trader_id)
            .fetch_one(self.pool())
            .await?;

        let max_ts: Option<DateTime<Utc>> = row.get("max_ts");
        Ok(max_ts.map(|ts| ts.timestamp_millis()))
    }

    /// Replay feed for restart reconstruction, oldest first.
    pub async fn trades_after(
        &self,
        trader_id: i32,
        after: DateTime<Utc>,
    ) -> Result<Vec<TradeRow>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT coin, side, size, price, closed_pnl, fee, timestamp, tid
             FROM trades
             WHERE trader_id = $1 AND timestamp > $2
             ORDER BY timestamp ASC, tid ASC",
        )
        .bind(trader_id)
        .bind(after)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Funding
// ---------------------------------------------------------------------------

impl Database {
    /// Bulk-insert funding payments; duplicates on `(trader_id, coin, time)`
    /// are ignored. Returns the `(coin, time)` keys actually inserted.
    pub async fn insert_funding(
        &self,
        trader_id: i32,
        entries: &[UserFundingEntry],
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::new(
            "INSERT INTO funding_events \
             (trader_id, coin, time, funding_rate, payment, position_size) ",
        );
        qb.push_values(entries, |mut b, entry| {
            b.push_bind(trader_id)
                .push_bind(&entry.delta.coin)
                .push_bind(ms_to_utc(entry.time))
                .push_bind(db_decimal(entry.delta.funding_rate))
                .push_bind(db_decimal(entry.delta.usdc))
                .push_bind(db_decimal(entry.delta.szi));
        });
        qb.push(" ON CONFLICT (trader_id, coin, time) DO NOTHING RETURNING coin, time");

        let rows = qb.build().fetch_all(self.pool()).await?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<String, _>("coin"), row.get::<DateTime<Utc>, _>("time")))
            .collect())
    }

    pub async fn funding_after(
        &self,
        trader_id: i32,
        after: DateTime<Utc>,
    ) -> Result<Vec<FundingRow>> {
        let rows = sqlx::query_as::<_, FundingRow>(
            "SELECT coin, time, payment
             FROM funding_events
             WHERE trader_id = $1 AND time > $2
             ORDER BY time ASC",
        )
        .bind(trader_id)
        .bind(after)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

impl Database {
    /// Bulk upsert; an existing `(trader_id, timestamp)` row has every
    /// numeric column replaced by the incoming values.
    pub async fn upsert_snapshots(&self, rows: &[SnapshotRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut qb = QueryBuilder::new(
            "INSERT INTO pnl_snapshots \
             (trader_id, timestamp, realized_pnl, unrealized_pnl, total_pnl, funding_pnl, \
              trading_pnl, open_positions, total_volume, account_value) ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(row.trader_id)
                .push_bind(row.timestamp)
                .push_bind(row.realized_pnl)
                .push_bind(row.unrealized_pnl)
                .push_bind(row.total_pnl)
                .push_bind(row.funding_pnl)
                .push_bind(row.trading_pnl)
                .push_bind(row.open_positions)
                .push_bind(row.total_volume)
                .push_bind(row.account_value);
        });
        qb.push(
            " ON CONFLICT (trader_id, timestamp) DO UPDATE SET \
             realized_pnl = EXCLUDED.realized_pnl, \
             unrealized_pnl = EXCLUDED.unrealized_pnl, \
             total_pnl = EXCLUDED.total_pnl, \
             funding_pnl = EXCLUDED.funding_pnl, \
             trading_pnl = EXCLUDED.trading_pnl, \
             open_positions = EXCLUDED.open_positions, \
             total_volume = EXCLUDED.total_volume, \
             account_value = EXCLUDED.account_value",
        );

        qb.build().execute(self.pool()).await?;
        Ok(())
    }

    pub async fn latest_snapshot(&self, trader_id: i32) -> Result<Option<SnapshotRow>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT trader_id, timestamp, realized_pnl, unrealized_pnl, total_pnl, funding_pnl,
                    trading_pnl, open_positions, total_volume, account_value
             FROM pnl_snapshots
             WHERE trader_id = $1
             ORDER BY timestamp DESC
             LIMIT 1",
        )
        .bind(trader_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row)
    }

    pub async fn latest_snapshot_ts(&self, trader_id: i32) -> Result<Option<DateTime<Utc>>> {
        Ok(self.latest_snapshot(trader_id).await?.map(|row| row.timestamp))
    }

    /// Raw snapshot rows over `[from, to]`, oldest first.
    pub async fn snapshots_range(
        &self,
        trader_id: i32,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SnapshotRow>> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            "SELECT trader_id, timestamp, realized_pnl, unrealized_pnl, total_pnl, funding_pnl,
                    trading_pnl, open_positions, total_volume, account_value
             FROM pnl_snapshots
             WHERE trader_id = $1 AND timestamp BETWEEN $2 AND $3
             ORDER BY timestamp ASC",
        )
        .bind(trader_id)
        .bind(from)
        .bind(to)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Pre-aggregated rows over `[from, to]` for hourly/daily reads.
    pub async fn bucketed_range(
        &self,
        trader_id: i32,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<BucketRow>> {
        let table = granularity
            .bucket_table()
            .expect("bucketed_range called with raw granularity");

        let query = format!(
            "SELECT bucket, realized_pnl, unrealized_pnl, total_pnl, funding_pnl, trading_pnl,
                    positions, volume, account_value
             FROM {table}
             WHERE trader_id = $1 AND bucket BETWEEN $2 AND $3
             ORDER BY bucket ASC"
        );

        let rows = sqlx::query_as::<_, BucketRow>(&query)
            .bind(trader_id)
            .bind(from)
            .bind(to)
            .fetch_all(self.pool())
            .await?;

        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Data gaps
// ---------------------------------------------------------------------------

impl Database {
    /// Record an unavailability interval; duplicate `(trader, gap_start)`
    /// rows are ignored. Returns whether a new row landed.
    pub async fn insert_gap(
        &self,
        trader_id: i32,
        gap_start: DateTime<Utc>,
        gap_end: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO data_gaps (trader_id, gap_start, gap_end, gap_type)
             VALUES ($1, $2, $3, 'snapshots')
             ON CONFLICT (trader_id, gap_start, gap_type) DO NOTHING",
        )
        .bind(trader_id)
        .bind(gap_start)
        .bind(gap_end)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Close every open gap for the trader. Returns how many were resolved.
    pub async fn resolve_open_gaps(&self, trader_id: i32, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE data_gaps SET resolved_at = $2
             WHERE trader_id = $1 AND resolved_at IS NULL",
        )
        .bind(trader_id)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn gap_stats(&self) -> Result<GapStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS unresolved,
                    COUNT(DISTINCT trader_id) AS traders_affected,
                    MIN(gap_start) AS oldest_open
             FROM data_gaps
             WHERE resolved_at IS NULL",
        )
        .fetch_one(self.pool())
        .await?;

        Ok(GapStats {
            unresolved: row.get("unresolved"),
            traders_affected: row.get("traders_affected"),
            oldest_open: row.get("oldest_open"),
        })
    }
}

// =============================================================================
// Tests (pure helpers only; queries need a live Postgres)
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::pnl;

    #[test]
    fn ms_conversion_round_trips() {
        let ms = 1_700_000_000_123i64;
        assert_eq!(ms_to_utc(ms).timestamp_millis(), ms);
        // Out-of-range input degrades to the epoch rather than panicking.
        assert_eq!(ms_to_utc(i64::MAX).timestamp_millis(), 0);
    }

    #[test]
    fn granularity_parse_and_tables() {
        assert_eq!(Granularity::parse("raw"), Some(Granularity::Raw));
        assert_eq!(Granularity::parse("hourly"), Some(Granularity::Hourly));
        assert_eq!(Granularity::parse("daily"), Some(Granularity::Daily));
        assert_eq!(Granularity::parse("weekly"), None);

        assert_eq!(Granularity::Raw.bucket_table(), None);
        assert_eq!(Granularity::Hourly.bucket_table(), Some("pnl_hourly"));
        assert_eq!(Granularity::Daily.bucket_table(), Some("pnl_daily"));
    }

    #[test]
    fn snapshot_row_rounds_to_8dp() {
        let mut state = pnl::initial(9, "0xabc");
        state.realized_trading_pnl = "100.123456789".parse().unwrap();
        state.total_volume = "5000.000000015".parse().unwrap();

        let breakdown = pnl::calculate_pnl(&state);
        let now = Utc::now();
        let row = SnapshotRow::from_state(&state, &breakdown, None, now);

        assert_eq!(row.trader_id, 9);
        assert_eq!(row.timestamp, now);
        assert_eq!(row.trading_pnl.to_string(), "100.12345679");
        assert_eq!(row.total_volume.to_string(), "5000.00000002");
        assert_eq!(row.open_positions, 0);
        assert!(row.account_value.is_none());
    }
}
