// =============================================================================
// Storage — Postgres handle and schema bootstrap
// =============================================================================

pub mod repos;

pub use repos::{BucketRow, FundingRow, GapStats, Granularity, SnapshotRow, TradeRow, TraderRow};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::error::Result;

/// Shared database handle. Cloning is cheap (the pool is internally shared).
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect and verify the pool with a ping.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!(max_connections, "database pool connected");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the pool, waiting for in-flight connections to finish.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create every table and index the indexer writes to. Idempotent; runs
    /// at startup before any ingestion begins. The hourly/daily tables are
    /// written by the out-of-process aggregation job and only read here.
    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS traders (
                id              SERIAL PRIMARY KEY,
                address         TEXT NOT NULL UNIQUE,
                first_seen_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                is_active       BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id         BIGSERIAL PRIMARY KEY,
                trader_id  INTEGER NOT NULL REFERENCES traders(id),
                coin       TEXT NOT NULL,
                side       TEXT NOT NULL,
                size       NUMERIC(30,8) NOT NULL,
                price      NUMERIC(30,8) NOT NULL,
                closed_pnl NUMERIC(30,8) NOT NULL,
                fee        NUMERIC(30,8) NOT NULL,
                timestamp  TIMESTAMPTZ NOT NULL,
                tx_hash    TEXT,
                oid        BIGINT,
                tid        BIGINT NOT NULL,
                UNIQUE (trader_id, tid)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_trades_trader_time ON trades (trader_id, timestamp DESC)",
            r#"
            CREATE TABLE IF NOT EXISTS funding_events (
                id            BIGSERIAL PRIMARY KEY,
                trader_id     INTEGER NOT NULL REFERENCES traders(id),
                coin          TEXT NOT NULL,
                time          TIMESTAMPTZ NOT NULL,
                funding_rate  NUMERIC(30,12) NOT NULL,
                payment       NUMERIC(30,8) NOT NULL,
                position_size NUMERIC(30,8) NOT NULL,
                UNIQUE (trader_id, coin, time)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pnl_snapshots (
                trader_id      INTEGER NOT NULL REFERENCES traders(id),
                timestamp      TIMESTAMPTZ NOT NULL,
                realized_pnl   NUMERIC(30,8) NOT NULL,
                unrealized_pnl NUMERIC(30,8) NOT NULL,
                total_pnl      NUMERIC(30,8) NOT NULL,
                funding_pnl    NUMERIC(30,8) NOT NULL,
                trading_pnl    NUMERIC(30,8) NOT NULL,
                open_positions INTEGER NOT NULL,
                total_volume   NUMERIC(30,8) NOT NULL,
                account_value  NUMERIC(30,8),
                PRIMARY KEY (trader_id, timestamp)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pnl_hourly (
                trader_id      INTEGER NOT NULL,
                bucket         TIMESTAMPTZ NOT NULL,
                realized_pnl   NUMERIC(30,8) NOT NULL,
                unrealized_pnl NUMERIC(30,8) NOT NULL,
                total_pnl      NUMERIC(30,8) NOT NULL,
                funding_pnl    NUMERIC(30,8) NOT NULL,
                trading_pnl    NUMERIC(30,8) NOT NULL,
                positions      INTEGER NOT NULL,
                volume         NUMERIC(30,8) NOT NULL,
                account_value  NUMERIC(30,8),
                PRIMARY KEY (trader_id, bucket)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pnl_daily (
                trader_id      INTEGER NOT NULL,
                bucket         TIMESTAMPTZ NOT NULL,
                realized_pnl   NUMERIC(30,8) NOT NULL,
                unrealized_pnl NUMERIC(30,8) NOT NULL,
                total_pnl      NUMERIC(30,8) NOT NULL,
                funding_pnl    NUMERIC(30,8) NOT NULL,
                trading_pnl    NUMERIC(30,8) NOT NULL,
                positions      INTEGER NOT NULL,
                volume         NUMERIC(30,8) NOT NULL,
                account_value  NUMERIC(30,8),
                PRIMARY KEY (trader_id, bucket)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS data_gaps (
                id          BIGSERIAL PRIMARY KEY,
                trader_id   INTEGER NOT NULL REFERENCES traders(id),
                gap_start   TIMESTAMPTZ NOT NULL,
                gap_end     TIMESTAMPTZ NOT NULL,
                gap_type    TEXT NOT NULL DEFAULT 'snapshots',
                resolved_at TIMESTAMPTZ,
                UNIQUE (trader_id, gap_start, gap_type)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_data_gaps_open ON data_gaps (trader_id) WHERE resolved_at IS NULL",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("database schema verified");
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}
