// =============================================================================
// Price Service — live coin -> mid-price map fed by the allMids channel
// =============================================================================
//
// The last received mid is authoritative until replaced; there is no
// staleness expiry. `stop` cancels the subscription and clears the map, and
// `start` may be called again afterwards.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::exchange::types::{WsEvent, WsSubscription};
use crate::exchange::ws::WsClient;

pub struct PriceService {
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PriceService {
    pub fn new() -> Self {
        Self {
            prices: Arc::new(RwLock::new(HashMap::new())),
            worker: Mutex::new(None),
        }
    }

    /// Subscribe to `allMids` and start folding pushes into the map.
    /// Calling `start` while already running is a no-op.
    pub fn start(&self, ws: &WsClient) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("price service already running");
            return;
        }

        let mut rx = ws.subscribe(WsSubscription::AllMids);
        let prices = self.prices.clone();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(WsEvent::AllMids(mids)) => {
                        let mut map = prices.write();
                        for (coin, px) in mids {
                            map.insert(coin, px);
                        }
                    }
                    Ok(WsEvent::Closed) => {
                        info!("price service stream closed");
                        break;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        // Mid ticks are snapshots; skipping some only delays
                        // freshness by one push.
                        warn!(skipped, "price stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *worker = Some(handle);
        info!("price service started");
    }

    /// Cancel the subscription and clear the map.
    pub fn stop(&self, ws: &WsClient) {
        let mut worker = self.worker.lock();
        if let Some(handle) = worker.take() {
            handle.abort();
            ws.unsubscribe(&WsSubscription::AllMids);
            self.prices.write().clear();
            info!("price service stopped");
        }
    }

    pub fn get(&self, coin: &str) -> Option<Decimal> {
        self.prices.read().get(coin).copied()
    }

    pub fn get_all(&self) -> HashMap<String, Decimal> {
        self.prices.read().clone()
    }

    pub fn count(&self) -> usize {
        self.prices.read().len()
    }
}

impl Default for PriceService {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn map_updates_and_clears_across_start_stop() {
        let ws = WsClient::new("wss://example.invalid/ws");
        let service = PriceService::new();

        service.start(&ws);
        // Idempotent double start.
        service.start(&ws);
        assert_eq!(service.count(), 0);

        // Feed the map directly; the worker task exercises the same path.
        service
            .prices
            .write()
            .insert("BTC".into(), "43000.5".parse().unwrap());
        assert_eq!(service.get("BTC"), Some("43000.5".parse().unwrap()));
        assert_eq!(service.count(), 1);
        assert!(service.get("ETH").is_none());

        service.stop(&ws);
        assert_eq!(service.count(), 0);

        // start is valid again after stop.
        service.start(&ws);
        assert_eq!(service.count(), 0);
        service.stop(&ws);
        ws.close();
    }

    #[tokio::test]
    async fn last_value_wins() {
        let ws = WsClient::new("wss://example.invalid/ws");
        let service = PriceService::new();
        service.start(&ws);

        service.prices.write().insert("ETH".into(), "2000".parse().unwrap());
        service.prices.write().insert("ETH".into(), "2100".parse().unwrap());
        assert_eq!(service.get("ETH"), Some("2100".parse().unwrap()));

        service.stop(&ws);
        ws.close();
    }
}
