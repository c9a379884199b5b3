// =============================================================================
// Error taxonomy for the ingestion pipeline
// =============================================================================
//
// Classes map onto distinct handling policies:
//   - Transient / Exchange 5xx / CircuitOpen  -> retried by the retry operator
//   - BudgetExhausted                         -> surfaced after 30 refusals
//   - Protocol                                -> never retried, logged, skipped
//   - Persistence                             -> item dropped, next tick re-emits
//   - Validation                              -> fatal at the API boundary only
// =============================================================================

use thiserror::Error;

/// Unified error type for the indexer core.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Timeouts, connection resets, WebSocket closes.
    #[error("transient network error: {0}")]
    Transient(String),

    /// The rate-budget scheduler refused the request 30 times in a row.
    #[error("rate budget exhausted after {attempts} refusals")]
    BudgetExhausted { attempts: u32 },

    /// The exchange answered with a non-2xx status.
    #[error("exchange returned HTTP {status}: {body}")]
    Exchange { status: u16, body: String },

    /// The response parsed as JSON but did not match the expected shape.
    #[error("unexpected response shape: {0}")]
    Protocol(String),

    /// The circuit breaker for `{0}` is open; the item was shed.
    #[error("circuit open for stream '{0}'")]
    CircuitOpen(String),

    /// A database write or read failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Caller-supplied input was invalid (bad address, negative interval).
    #[error("validation error: {0}")]
    Validation(String),
}

impl IndexerError {
    /// Whether the retry operator should re-attempt after this error.
    ///
    /// 429 and 5xx responses are treated as transient; 4xx responses other
    /// than 429 are not (re-sending the same request cannot succeed).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) | Self::CircuitOpen(_) => true,
            Self::Exchange { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Shorthand constructor used at reqwest/tungstenite seams.
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }

    /// Shorthand constructor for shape mismatches.
    pub fn protocol(context: impl std::fmt::Display) -> Self {
        Self::Protocol(context.to_string())
    }
}

impl From<reqwest::Error> for IndexerError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(IndexerError::Transient("timeout".into()).is_transient());
        assert!(IndexerError::CircuitOpen("fills".into()).is_transient());
        assert!(IndexerError::Exchange { status: 503, body: String::new() }.is_transient());
        assert!(IndexerError::Exchange { status: 429, body: String::new() }.is_transient());
        assert!(!IndexerError::Exchange { status: 422, body: String::new() }.is_transient());
        assert!(!IndexerError::Protocol("bad shape".into()).is_transient());
        assert!(!IndexerError::Validation("bad address".into()).is_transient());
        assert!(!IndexerError::BudgetExhausted { attempts: 30 }.is_transient());
    }
}
