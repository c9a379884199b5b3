// =============================================================================
// Source streams — periodic polls and WebSocket pushes feeding the ingester
// =============================================================================
//
// Each poll recomputes the active trader set from storage on every tick, so
// newly subscribed traders are picked up without restarts. Per-trader errors
// that survive the retry/breaker stack are logged and swallowed; one bad
// trader never stalls a tick. A tick with zero active traders emits nothing.
// =============================================================================

pub mod fills;
pub mod funding;
pub mod positions;
pub mod user_events;

pub use fills::FillsPoller;
pub use funding::FundingPoller;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::exchange::InfoClient;
use crate::storage::Database;
use crate::stream::StreamMetrics;
use crate::types::SourceEvent;

/// Shared handles every source needs. Cheap to clone per spawned task.
#[derive(Clone)]
pub struct SourceContext {
    pub db: Arc<Database>,
    pub client: Arc<InfoClient>,
    pub metrics: Arc<StreamMetrics>,
    pub events: mpsc::Sender<SourceEvent>,
}
