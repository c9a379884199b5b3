// =============================================================================
// Exchange WebSocket client — one durable connection, typed fan-out
// =============================================================================
//
// A single run-loop task owns the socket. Subscribers register through a
// shared registry; the run loop replays every active subscription after each
// (re)connect, so subscribers never notice a reconnect beyond a delivery gap.
// Reconnects back off exponentially (1 s doubling to 30 s).
//
// Fan-out is one broadcast channel per distinct subscription; dropping the
// last subscriber removes the upstream subscription. `close()` delivers a
// terminal `WsEvent::Closed` to every subscriber and shuts the socket.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::exchange::types::{
    AllMidsData, FundingDelta, UserEventsData, UserFundingEntry, WebData2Data, WsEvent, WsFrame,
    WsRequest, WsSubscription,
};
use crate::types::normalize_address;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Buffered events per subscription before slow consumers start lagging.
const CHANNEL_CAPACITY: usize = 256;

/// Connection lifecycle, exposed for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

enum WsCommand {
    Subscribe(WsSubscription),
    Unsubscribe(WsSubscription),
    Close,
}

struct SubEntry {
    sub: WsSubscription,
    tx: broadcast::Sender<WsEvent>,
    subscribers: usize,
}

struct WsInner {
    url: String,
    subs: Mutex<HashMap<String, SubEntry>>,
    conn_state: Mutex<ConnState>,
}

/// Handle to the shared WebSocket client. Cheap to clone.
#[derive(Clone)]
pub struct WsClient {
    inner: Arc<WsInner>,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
}

impl WsClient {
    /// Create the client and spawn its run loop. The socket connects lazily
    /// on the first loop iteration.
    pub fn new(url: impl Into<String>) -> Self {
        let inner = Arc::new(WsInner {
            url: url.into(),
            subs: Mutex::new(HashMap::new()),
            conn_state: Mutex::new(ConnState::Disconnected),
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_loop(inner.clone(), cmd_rx));

        Self { inner, cmd_tx }
    }

    pub fn connection_state(&self) -> ConnState {
        *self.inner.conn_state.lock()
    }

    /// Register interest in `sub` and receive its event stream. The upstream
    /// subscription is created on first use and shared by later callers.
    pub fn subscribe(&self, sub: WsSubscription) -> broadcast::Receiver<WsEvent> {
        let mut subs = self.inner.subs.lock();
        let key = sub.key();
        let entry = subs.entry(key).or_insert_with(|| {
            let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
            let _ = self.cmd_tx.send(WsCommand::Subscribe(sub.clone()));
            SubEntry { sub: sub.clone(), tx, subscribers: 0 }
        });
        entry.subscribers += 1;
        entry.tx.subscribe()
    }

    /// Drop one subscriber; the upstream subscription is removed when the
    /// last one goes.
    pub fn unsubscribe(&self, sub: &WsSubscription) {
        let mut subs = self.inner.subs.lock();
        let key = sub.key();
        if let Some(entry) = subs.get_mut(&key) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers == 0 {
                subs.remove(&key);
                let _ = self.cmd_tx.send(WsCommand::Unsubscribe(sub.clone()));
                debug!(subscription = %key, "last subscriber gone, removing upstream subscription");
            }
        }
    }

    /// Terminate all subscriptions and shut the socket down.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(WsCommand::Close);
    }

    /// Subscriptions currently registered (for the health endpoint).
    pub fn subscription_count(&self) -> usize {
        self.inner.subs.lock().len()
    }
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("url", &self.inner.url)
            .field("state", &self.connection_state())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

async fn run_loop(inner: Arc<WsInner>, mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        set_state(&inner, ConnState::Connecting);

        let stream = match connect_async(inner.url.as_str()).await {
            Ok((stream, _resp)) => stream,
            Err(e) => {
                warn!(url = %inner.url, error = %e, backoff_secs = backoff.as_secs(), "WebSocket connect failed");
                set_state(&inner, ConnState::Reconnecting);
                if wait_backoff(&inner, &mut cmd_rx, backoff).await {
                    return;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        info!(url = %inner.url, "WebSocket connected");
        set_state(&inner, ConnState::Connected);
        backoff = INITIAL_BACKOFF;

        let (mut write, mut read) = stream.split();

        // Replay all active subscriptions on this fresh connection.
        let mut sent: HashSet<String> = HashSet::new();
        let active: Vec<WsSubscription> = {
            let subs = inner.subs.lock();
            subs.values().map(|e| e.sub.clone()).collect()
        };
        for sub in &active {
            if send_request(&mut write, "subscribe", sub).await.is_err() {
                break;
            }
            sent.insert(sub.key());
        }
        if !active.is_empty() {
            info!(count = active.len(), "subscriptions replayed");
        }

        // Connected message loop.
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(WsCommand::Subscribe(sub)) => {
                        if sent.insert(sub.key()) {
                            let _ = send_request(&mut write, "subscribe", &sub).await;
                        }
                    }
                    Some(WsCommand::Unsubscribe(sub)) => {
                        sent.remove(&sub.key());
                        let _ = send_request(&mut write, "unsubscribe", &sub).await;
                    }
                    Some(WsCommand::Close) | None => {
                        notify_closed(&inner);
                        let _ = write.send(Message::Close(None)).await;
                        set_state(&inner, ConnState::Disconnected);
                        info!("WebSocket client closed");
                        return;
                    }
                },
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => dispatch(&inner, &text),
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        warn!("server closed the WebSocket");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket read error");
                        break;
                    }
                    None => {
                        warn!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }

        set_state(&inner, ConnState::Reconnecting);
        if wait_backoff(&inner, &mut cmd_rx, backoff).await {
            return;
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Sleep through the reconnect delay, still honouring `Close`. Returns true
/// when the loop should terminate.
async fn wait_backoff(
    inner: &Arc<WsInner>,
    cmd_rx: &mut mpsc::UnboundedReceiver<WsCommand>,
    backoff: Duration,
) -> bool {
    let sleep = tokio::time::sleep(backoff);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(WsCommand::Close) | None => {
                    notify_closed(inner);
                    set_state(inner, ConnState::Disconnected);
                    return true;
                }
                // Subscription changes while disconnected are picked up by
                // the replay on the next connect.
                Some(_) => {}
            }
        }
    }
}

async fn send_request<S>(write: &mut S, method: &'static str, sub: &WsSubscription) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let frame = match serde_json::to_string(&WsRequest { method, subscription: sub }) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "failed to serialize subscription frame");
            return Err(());
        }
    };
    if write.send(Message::Text(frame)).await.is_err() {
        warn!(method, subscription = %sub.key(), "failed to send subscription frame");
        return Err(());
    }
    debug!(method, subscription = %sub.key(), "subscription frame sent");
    Ok(())
}

fn set_state(inner: &Arc<WsInner>, state: ConnState) {
    *inner.conn_state.lock() = state;
}

fn notify_closed(inner: &Arc<WsInner>) {
    let subs = inner.subs.lock();
    for entry in subs.values() {
        let _ = entry.tx.send(WsEvent::Closed);
    }
}

// ---------------------------------------------------------------------------
// Frame dispatch
// ---------------------------------------------------------------------------

fn dispatch(inner: &Arc<WsInner>, text: &str) {
    let frame: WsFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "unparseable WebSocket frame");
            return;
        }
    };

    match frame.channel.as_str() {
        "allMids" => match serde_json::from_value::<AllMidsData>(frame.data) {
            Ok(data) => send_to(inner, "allMids", WsEvent::AllMids(data.mids)),
            Err(e) => warn!(error = %e, "malformed allMids frame"),
        },
        "userEvents" | "user" => match serde_json::from_value::<UserEventsData>(frame.data) {
            Ok(data) => dispatch_user_events(inner, data),
            Err(e) => warn!(error = %e, "malformed userEvents frame"),
        },
        "webData2" => match serde_json::from_value::<WebData2Data>(frame.data) {
            Ok(data) => {
                let user = data.user.as_deref().map(normalize_address);
                route_user_scoped(inner, "webData2", user, |user| WsEvent::PositionSnapshot {
                    user,
                    state: data.clearinghouse_state.clone(),
                });
            }
            Err(e) => warn!(error = %e, "malformed webData2 frame"),
        },
        "subscriptionResponse" | "pong" => {}
        other => debug!(channel = other, "ignoring frame on unknown channel"),
    }
}

fn dispatch_user_events(inner: &Arc<WsInner>, data: UserEventsData) {
    let user = data.user.as_deref().map(normalize_address);

    if let Some(fills) = data.fills {
        if !fills.is_empty() {
            route_user_scoped(inner, "userEvents", user.clone(), |user| WsEvent::Fills {
                user,
                fills: fills.clone(),
            });
        }
    }

    if let Some(funding) = data.funding {
        let entry = UserFundingEntry {
            time: funding.time,
            delta: FundingDelta {
                kind: Some("funding".to_string()),
                coin: funding.coin.clone(),
                usdc: funding.usdc,
                szi: funding.szi,
                funding_rate: funding.funding_rate,
            },
        };
        route_user_scoped(inner, "userEvents", user, |user| WsEvent::Funding {
            user,
            entry: entry.clone(),
        });
    }
}

/// Deliver a user-scoped event to the matching subscription. Frames that do
/// not name a user are routed to the sole subscription of that kind; with
/// several active, an unattributed frame is dropped rather than miscredited.
fn route_user_scoped<F>(inner: &Arc<WsInner>, prefix: &str, user: Option<String>, make: F)
where
    F: Fn(String) -> WsEvent,
{
    let subs = inner.subs.lock();

    match user {
        Some(user) => {
            let key = format!("{prefix}:{user}");
            if let Some(entry) = subs.get(&key) {
                let _ = entry.tx.send(make(user));
            }
        }
        None => {
            let mut matching = subs
                .values()
                .filter(|e| e.sub.key().starts_with(prefix))
                .collect::<Vec<_>>();
            if matching.len() == 1 {
                let entry = matching.pop().unwrap();
                let user = match &entry.sub {
                    WsSubscription::UserEvents { user } | WsSubscription::WebData2 { user } => {
                        user.clone()
                    }
                    WsSubscription::AllMids => return,
                };
                let _ = entry.tx.send(make(user));
            } else if !matching.is_empty() {
                warn!(
                    prefix,
                    candidates = matching.len(),
                    "unattributed user frame with multiple subscriptions, dropping"
                );
            }
        }
    }
}

fn send_to(inner: &Arc<WsInner>, key: &str, event: WsEvent) {
    let subs = inner.subs.lock();
    if let Some(entry) = subs.get(key) {
        let _ = entry.tx.send(event);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn test_inner() -> Arc<WsInner> {
        Arc::new(WsInner {
            url: "wss://example.invalid/ws".into(),
            subs: Mutex::new(HashMap::new()),
            conn_state: Mutex::new(ConnState::Disconnected),
        })
    }

    fn register(inner: &Arc<WsInner>, sub: WsSubscription) -> broadcast::Receiver<WsEvent> {
        let mut subs = inner.subs.lock();
        let (tx, rx) = broadcast::channel(16);
        subs.insert(sub.key(), SubEntry { sub, tx, subscribers: 1 });
        rx
    }

    #[tokio::test]
    async fn all_mids_frames_reach_subscribers() {
        let inner = test_inner();
        let mut rx = register(&inner, WsSubscription::AllMids);

        dispatch(
            &inner,
            r#"{"channel":"allMids","data":{"mids":{"BTC":"43000.5"}}}"#,
        );

        match rx.try_recv().unwrap() {
            WsEvent::AllMids(mids) => {
                assert_eq!(mids["BTC"], "43000.5".parse::<Decimal>().unwrap())
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn user_fills_route_by_address() {
        let inner = test_inner();
        let user = "0x1234567890abcdef1234567890abcdef12345678";
        let mut rx = register(&inner, WsSubscription::UserEvents { user: user.into() });
        let mut other_rx = register(
            &inner,
            WsSubscription::UserEvents {
                user: "0xffffffffffffffffffffffffffffffffffffffff".into(),
            },
        );

        let frame = format!(
            r#"{{"channel":"userEvents","data":{{"user":"{user}","fills":[
                {{"coin":"ETH","px":"2000","sz":"1","side":"B","time":5,"closedPnl":"0","fee":"0.5","tid":77}}
            ]}}}}"#
        );
        dispatch(&inner, &frame);

        match rx.try_recv().unwrap() {
            WsEvent::Fills { user: got, fills } => {
                assert_eq!(got, user);
                assert_eq!(fills.len(), 1);
                assert_eq!(fills[0].tid, 77);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unattributed_frame_routes_to_sole_subscription() {
        let inner = test_inner();
        let user = "0x1234567890abcdef1234567890abcdef12345678";
        let mut rx = register(&inner, WsSubscription::UserEvents { user: user.into() });

        let frame = r#"{"channel":"userEvents","data":{"fills":[
            {"coin":"ETH","px":"2000","sz":"1","side":"A","time":5,"closedPnl":"1","fee":"0.5","tid":78}
        ]}}"#;
        dispatch(&inner, frame);

        match rx.try_recv().unwrap() {
            WsEvent::Fills { user: got, .. } => assert_eq!(got, user),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_silently() {
        let inner = test_inner();
        let mut rx = register(&inner, WsSubscription::AllMids);

        dispatch(&inner, "not json at all");
        dispatch(&inner, r#"{"channel":"allMids","data":{"wrong":"shape"}}"#);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_unsubscribe_refcounts() {
        let client = WsClient::new("wss://example.invalid/ws");
        let sub = WsSubscription::AllMids;

        let _rx1 = client.subscribe(sub.clone());
        let _rx2 = client.subscribe(sub.clone());
        assert_eq!(client.subscription_count(), 1);

        client.unsubscribe(&sub);
        assert_eq!(client.subscription_count(), 1);
        client.unsubscribe(&sub);
        assert_eq!(client.subscription_count(), 0);

        client.close();
    }
}
