// =============================================================================
// WebSocket user events — real-time fills/funding complement to the polls
// =============================================================================

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::exchange::types::WsEvent;
use crate::types::SourceEvent;

/// Forward pushed fills and funding for one trader into the ingest channel.
/// Runs until the subscription delivers its terminal `Closed` signal or the
/// ingest channel goes away.
pub async fn run_user_events(
    address: String,
    mut rx: broadcast::Receiver<WsEvent>,
    events: mpsc::Sender<SourceEvent>,
) {
    debug!(address = %address, "user events forwarder started");

    loop {
        match rx.recv().await {
            Ok(WsEvent::Fills { user, fills }) if user == address => {
                let count = fills.len();
                let event = SourceEvent::Fills {
                    address: address.clone(),
                    fills,
                    at: Utc::now(),
                };
                if events.send(event).await.is_err() {
                    break;
                }
                debug!(address = %address, count, "pushed fills forwarded");
            }
            Ok(WsEvent::Funding { user, entry }) if user == address => {
                let event = SourceEvent::Funding {
                    address: address.clone(),
                    entries: vec![entry],
                    at: Utc::now(),
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Ok(WsEvent::Closed) => {
                info!(address = %address, "user events subscription closed");
                break;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Missed pushes are recovered by the next fills poll.
                warn!(address = %address, skipped, "user events stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
