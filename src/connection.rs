use crate::error::{LinkError, Result};
use crate::protocol::OutgoingMessage;
use crate::subscription::{NodeReceiver, NodeSignal, SignalReceiver};
use crate::types::{NodeConfig, NodeStats, UserId};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SIGNAL_CAPACITY: usize = 256;
const MIN_RECONNECT_INTERVAL: Duration = Duration::from_millis(10);

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Open,
}

/// Identity of the bot, sent in the handshake of every node connection
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub user_id: UserId,
    pub shard_count: u64,
}

/// Reader and writer tasks of one socket
struct SocketTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct ConnectionState {
    status: ConnectionStatus,
    /// Bumped on every connect attempt and on destroy. Tasks of an older
    /// socket compare against it and become inert.
    generation: u64,
    ws_tx: Option<mpsc::UnboundedSender<Message>>,
    socket: Option<SocketTasks>,
    stats: Option<NodeStats>,
    reconnect: Option<JoinHandle<()>>,
}

struct NodeInner {
    config: NodeConfig,
    identity: ClientIdentity,
    state: Mutex<ConnectionState>,
    signal_tx: broadcast::Sender<NodeSignal>,
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.reconnect.take() {
            timer.abort();
        }
        if let Some(socket) = state.socket.take() {
            socket.reader.abort();
            socket.writer.abort();
        }
    }
}

/// Persistent WebSocket connection to one audio node
///
/// Cloning yields another handle to the same connection. Only the
/// connection writes to its socket: every send goes through a single
/// writer task, so frames leave in the order they were issued.
#[derive(Clone)]
pub struct NodeConnection {
    inner: Arc<NodeInner>,
}

impl NodeConnection {
    /// Create a connection in the `Disconnected` state
    pub fn new(config: NodeConfig, identity: ClientIdentity) -> Self {
        let (signal_tx, _) = broadcast::channel(SIGNAL_CAPACITY);

        Self {
            inner: Arc::new(NodeInner {
                config,
                identity,
                state: Mutex::new(ConnectionState {
                    status: ConnectionStatus::Disconnected,
                    generation: 0,
                    ws_tx: None,
                    socket: None,
                    stats: None,
                    reconnect: None,
                }),
                signal_tx,
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.config.host
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock_state().status
    }

    pub fn is_open(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    /// Last stats report received on the current socket
    pub fn stats(&self) -> Option<NodeStats> {
        self.lock_state().stats.clone()
    }

    /// Load penalty from the cached stats; zero if no report arrived yet
    pub fn penalty(&self) -> i64 {
        self.lock_state().stats.as_ref().map(NodeStats::penalty).unwrap_or(0)
    }

    /// Subscribe to lifecycle signals and inbound messages
    pub fn subscribe(&self) -> NodeReceiver {
        SignalReceiver::new(self.inner.signal_tx.subscribe())
    }

    /// Whether two handles refer to the same connection
    pub fn ptr_eq(&self, other: &NodeConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Open the socket
    ///
    /// Any previous socket is detached first. On success the state becomes
    /// `Open` and `Ready` is emitted; on failure it becomes `Disconnected`
    /// and `Disconnected` is emitted. A failed attempt is not retried unless
    /// [`arm_reconnect`](Self::arm_reconnect) was called.
    pub async fn connect(&self) -> Result<()> {
        let generation = {
            let mut state = self.lock_state();
            state.generation += 1;
            state.status = ConnectionStatus::Connecting;
            Self::detach(&mut state);
            state.generation
        };

        let request = match self.handshake_request() {
            Ok(request) => request,
            Err(e) => {
                self.mark_disconnected(generation, None, e.to_string());
                return Err(e);
            }
        };

        tracing::info!("Connecting to node {}", self.inner.config.address());

        let ws_stream = match connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                tracing::warn!("Failed to connect to node {}: {}", self.host(), e);
                self.mark_disconnected(generation, None, e.to_string());
                return Err(e.into());
            }
        };

        let (mut write, mut read) = ws_stream.split();
        let (ws_tx, mut ws_rx) = mpsc::unbounded_channel::<Message>();

        let mut state = self.lock_state();
        if state.generation != generation {
            // Destroyed or superseded while the handshake was in flight
            tracing::debug!("Discarding stale socket for node {}", self.host());
            return Err(LinkError::ConnectionClosed);
        }

        state.status = ConnectionStatus::Open;
        state.ws_tx = Some(ws_tx);
        tracing::info!("Connected to node {}", self.host());
        self.emit(NodeSignal::Ready);

        // Forward outgoing messages to the socket
        let signal_tx = self.inner.signal_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send message: {}", e);
                    let _ = signal_tx.send(NodeSignal::Error(e.to_string()));
                    break;
                }
            }
        });

        // Receive and dispatch incoming frames
        let weak = Arc::downgrade(&self.inner);
        let reader = tokio::spawn(async move {
            let mut code = None;
            let mut reason = String::from("connection lost");

            while let Some(msg_result) = read.next().await {
                let Some(node) = Self::upgrade(&weak) else {
                    return;
                };

                match msg_result {
                    Ok(Message::Text(text)) => node.handle_frame(generation, text.as_bytes()),
                    Ok(Message::Binary(data)) => node.handle_frame(generation, &data),
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            code = Some(u16::from(frame.code));
                            reason = frame.reason.into_owned();
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("WebSocket error on node {}: {}", node.host(), e);
                        node.emit(NodeSignal::Error(e.to_string()));
                        reason = e.to_string();
                        break;
                    }
                }
            }

            if let Some(node) = Self::upgrade(&weak) {
                node.mark_disconnected(generation, code, reason);
            }
        });

        state.socket = Some(SocketTasks { reader, writer });
        Ok(())
    }

    /// Serialize and queue a message for the node
    ///
    /// Returns `false` and emits `Error` if the connection is not open or the
    /// message cannot be encoded. Callers should treat `false` as a
    /// recoverable condition.
    pub fn send(&self, message: &OutgoingMessage) -> bool {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                self.emit(NodeSignal::Error(e.to_string()));
                return false;
            }
        };

        let state = self.lock_state();
        let queued = match (&state.status, &state.ws_tx) {
            (ConnectionStatus::Open, Some(tx)) => tx.send(Message::Text(json.clone())).is_ok(),
            _ => false,
        };
        drop(state);

        if queued {
            tracing::debug!("Sending to {}: {}", self.host(), json);
        } else {
            tracing::debug!("Dropping {} for node {}: not connected", message.op(), self.host());
            self.emit(NodeSignal::Error(format!(
                "Cannot send {} to node {}: not connected",
                message.op(),
                self.host()
            )));
        }

        queued
    }

    /// Start the periodic reconnect timer
    ///
    /// Every `reconnect_interval` the timer checks the current state and, if
    /// the connection is not open, emits `Reconnecting` and connects again.
    /// Re-arming replaces the previous timer.
    pub fn arm_reconnect(&self) {
        let period = self.inner.config.reconnect_interval().max(MIN_RECONNECT_INTERVAL);
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let Some(node) = Self::upgrade(&weak) else {
                    break;
                };

                if node.is_open() {
                    continue;
                }

                tracing::info!("Reconnecting to node {}", node.host());
                node.emit(NodeSignal::Reconnecting);

                if let Err(e) = node.connect().await {
                    tracing::debug!("Reconnect to node {} failed: {}", node.host(), e);
                }
            }
        });

        let mut state = self.lock_state();
        if let Some(previous) = state.reconnect.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the reconnect timer without touching the socket
    pub fn disarm_reconnect(&self) {
        if let Some(timer) = self.lock_state().reconnect.take() {
            timer.abort();
        }
    }

    pub fn is_reconnect_armed(&self) -> bool {
        self.lock_state().reconnect.is_some()
    }

    /// Close the connection and disarm the reconnect timer
    ///
    /// Returns whether an open socket was closed. Calling it again is a
    /// no-op.
    pub fn destroy(&self) -> bool {
        let mut state = self.lock_state();
        if let Some(timer) = state.reconnect.take() {
            timer.abort();
        }

        let was_open = state.status == ConnectionStatus::Open;
        state.generation += 1;
        state.status = ConnectionStatus::Disconnected;
        state.stats = None;

        if let Some(tx) = state.ws_tx.take() {
            let _ = tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "destroy".into(),
            })));
        }
        // The writer drains the close frame and exits once `ws_tx` is gone
        if let Some(socket) = state.socket.take() {
            socket.reader.abort();
        }
        drop(state);

        if was_open {
            tracing::info!("Destroyed connection to node {}", self.host());
            self.emit(NodeSignal::Disconnected {
                code: Some(u16::from(CloseCode::Normal)),
                reason: "destroy".to_string(),
            });
        }

        was_open
    }

    fn handshake_request(&self) -> Result<Request<()>> {
        let mut request = self.inner.config.address().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Authorization", HeaderValue::from_str(&self.inner.config.password)?);
        headers.insert("Num-Shards", HeaderValue::from(self.inner.identity.shard_count));
        headers.insert("User-Id", HeaderValue::from(self.inner.identity.user_id));
        Ok(request)
    }

    fn handle_frame(&self, generation: u64, bytes: &[u8]) {
        let value: serde_json::Value = match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Error parsing message from node {}: {}", self.host(), e);
                self.emit(NodeSignal::Error(format!("Failed to parse node message: {}", e)));
                return;
            }
        };

        tracing::trace!("Received from {}: {}", self.host(), value);

        if value.get("op").and_then(|v| v.as_str()) == Some("stats") {
            match serde_json::from_value::<NodeStats>(value) {
                Ok(stats) => {
                    let mut state = self.lock_state();
                    if state.generation == generation {
                        state.stats = Some(stats);
                    }
                }
                Err(e) => self.emit(NodeSignal::Error(format!("Malformed stats report: {}", e))),
            }
            return;
        }

        if self.lock_state().generation == generation {
            self.emit(NodeSignal::Message(Box::new(value)));
        }
    }

    fn mark_disconnected(&self, generation: u64, code: Option<u16>, reason: String) {
        let mut state = self.lock_state();
        if state.generation != generation {
            return;
        }

        state.status = ConnectionStatus::Disconnected;
        state.ws_tx = None;
        state.stats = None;
        state.socket = None;
        drop(state);

        tracing::warn!("Node {} disconnected ({:?}): {}", self.host(), code, reason);
        self.emit(NodeSignal::Disconnected { code, reason });
    }

    fn detach(state: &mut ConnectionState) {
        state.ws_tx = None;
        state.stats = None;
        if let Some(socket) = state.socket.take() {
            socket.reader.abort();
            socket.writer.abort();
        }
    }

    fn emit(&self, signal: NodeSignal) {
        // No receivers is fine
        let _ = self.inner.signal_tx.send(signal);
    }

    fn upgrade(weak: &Weak<NodeInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the connection open with a captured outbound channel instead of
    /// a socket.
    #[cfg(test)]
    pub(crate) fn open_detached(config: NodeConfig) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let node = Self::new(
            config,
            ClientIdentity {
                user_id: 1,
                shard_count: 1,
            },
        );
        let (ws_tx, ws_rx) = mpsc::unbounded_channel();
        {
            let mut state = node.lock_state();
            state.status = ConnectionStatus::Open;
            state.ws_tx = Some(ws_tx);
        }
        (node, ws_rx)
    }

    #[cfg(test)]
    pub(crate) fn simulate_close(&self) {
        let generation = self.lock_state().generation;
        self.mark_disconnected(generation, Some(1006), "test".to_string());
    }

    /// Reopen a detached connection and emit `Ready`, returning the new
    /// outbound frames.
    #[cfg(test)]
    pub(crate) fn simulate_reopen(&self) -> mpsc::UnboundedReceiver<Message> {
        let (ws_tx, ws_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock_state();
            state.generation += 1;
            state.status = ConnectionStatus::Open;
            state.ws_tx = Some(ws_tx);
        }
        self.emit(NodeSignal::Ready);
        ws_rx
    }

    #[cfg(test)]
    pub(crate) fn simulate_frame(&self, text: &str) {
        let generation = self.lock_state().generation;
        self.handle_frame(generation, text.as_bytes());
    }
}
