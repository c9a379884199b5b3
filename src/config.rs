// =============================================================================
// Runtime Configuration — serde-defaulted JSON file plus env overrides
// =============================================================================
//
// Every field carries a `#[serde(default)]` so older config files keep
// loading as fields are added. Secrets and deployment-specific values
// (database URL, bind address, trader roster) can be overridden from the
// environment after the file loads.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_position_poll_interval_secs() -> u64 {
    30
}

fn default_fills_poll_interval_secs() -> u64 {
    300
}

fn default_funding_poll_interval_secs() -> u64 {
    3600
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    300_000
}

fn default_backfill_days() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

fn default_database_url() -> String {
    "postgres://localhost:5432/meridian".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_api_url() -> String {
    "https://api.hyperliquid.xyz".to_string()
}

fn default_ws_url() -> String {
    "wss://api.hyperliquid.xyz/ws".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the Meridian indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Ingestion cadences --------------------------------------------------

    /// Clearinghouse positions poll period (seconds).
    #[serde(default = "default_position_poll_interval_secs")]
    pub position_poll_interval_secs: u64,

    /// Fills poll period when running poll-only (seconds).
    #[serde(default = "default_fills_poll_interval_secs")]
    pub fills_poll_interval_secs: u64,

    /// Funding poll period (seconds).
    #[serde(default = "default_funding_poll_interval_secs")]
    pub funding_poll_interval_secs: u64,

    /// In-memory snapshot emission period (seconds).
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    /// Fills poll period in hybrid mode, where the WebSocket push carries
    /// the real-time load and the poll only reconciles (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How far back the backfill worker reaches (days).
    #[serde(default = "default_backfill_days")]
    pub backfill_days: u32,

    /// Fuse the WebSocket push with the reconciling poll. Off means
    /// poll-only ingestion.
    #[serde(default = "default_true")]
    pub use_hybrid_mode: bool,

    // --- Endpoints & stores --------------------------------------------------

    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Exchange HTTP API base (the `/info` endpoint lives under it).
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Exchange WebSocket endpoint.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Read-API listen address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Roster --------------------------------------------------------------

    /// Trader addresses to subscribe at startup.
    #[serde(default)]
    pub traders: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            position_poll_interval_secs: default_position_poll_interval_secs(),
            fills_poll_interval_secs: default_fills_poll_interval_secs(),
            funding_poll_interval_secs: default_funding_poll_interval_secs(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            backfill_days: default_backfill_days(),
            use_hybrid_mode: true,
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            api_url: default_api_url(),
            ws_url: default_ws_url(),
            bind_addr: default_bind_addr(),
            traders: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Apply environment overrides on top of the loaded file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(addr) = std::env::var("MERIDIAN_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(url) = std::env::var("MERIDIAN_API_URL") {
            self.api_url = url;
        }
        if let Ok(url) = std::env::var("MERIDIAN_WS_URL") {
            self.ws_url = url;
        }
        if let Ok(roster) = std::env::var("MERIDIAN_TRADERS") {
            self.traders = roster
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    /// Reject configurations the ingester cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.position_poll_interval_secs == 0
            || self.fills_poll_interval_secs == 0
            || self.funding_poll_interval_secs == 0
            || self.snapshot_interval_secs == 0
            || self.poll_interval_ms == 0
        {
            anyhow::bail!("poll intervals must be positive");
        }
        if self.db_max_connections == 0 {
            anyhow::bail!("db_max_connections must be positive");
        }
        Ok(())
    }

    // --- Duration accessors --------------------------------------------------

    pub fn position_poll_interval(&self) -> Duration {
        Duration::from_secs(self.position_poll_interval_secs)
    }

    /// Effective fills-poll cadence: the hybrid reconcile interval when the
    /// WebSocket carries the push load, the plain poll interval otherwise.
    pub fn fills_poll_interval(&self) -> Duration {
        if self.use_hybrid_mode {
            Duration::from_millis(self.poll_interval_ms)
        } else {
            Duration::from_secs(self.fills_poll_interval_secs)
        }
    }

    pub fn funding_poll_interval(&self) -> Duration {
        Duration::from_secs(self.funding_poll_interval_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.position_poll_interval_secs, 30);
        assert_eq!(cfg.fills_poll_interval_secs, 300);
        assert_eq!(cfg.funding_poll_interval_secs, 3600);
        assert_eq!(cfg.snapshot_interval_secs, 60);
        assert_eq!(cfg.poll_interval_ms, 300_000);
        assert_eq!(cfg.backfill_days, 30);
        assert!(cfg.use_hybrid_mode);
        assert_eq!(cfg.db_max_connections, 10);
        assert!(cfg.traders.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.position_poll_interval_secs, 30);
        assert!(cfg.use_hybrid_mode);
        assert_eq!(cfg.api_url, "https://api.hyperliquid.xyz");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "use_hybrid_mode": false, "traders": ["0xAbC"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert!(!cfg.use_hybrid_mode);
        assert_eq!(cfg.traders, vec!["0xAbC"]);
        assert_eq!(cfg.snapshot_interval_secs, 60);
    }

    #[test]
    fn hybrid_mode_selects_fills_cadence() {
        let mut cfg = RuntimeConfig::default();
        assert_eq!(cfg.fills_poll_interval(), Duration::from_millis(300_000));
        cfg.use_hybrid_mode = false;
        assert_eq!(cfg.fills_poll_interval(), Duration::from_secs(300));
    }

    #[test]
    fn zero_intervals_rejected() {
        let mut cfg = RuntimeConfig::default();
        cfg.snapshot_interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.database_url, cfg2.database_url);
        assert_eq!(cfg.poll_interval_ms, cfg2.poll_interval_ms);
        assert_eq!(cfg.use_hybrid_mode, cfg2.use_hybrid_mode);
    }
}
