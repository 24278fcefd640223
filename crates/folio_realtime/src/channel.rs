//! Persistent, auto-reconnecting event channel.
//!
//! `EventChannel` is a cheaply cloneable handle shared by every document
//! session in the process. It owns:
//!
//! - the connection task (connect, reconnect with backoff, keepalive)
//! - the [`OutboundQueue`] every emit goes through
//! - the durable [`ListenerRegistry`]
//! - the set of joined page rooms, replayed after every reconnect
//!
//! # Connection lifecycle
//!
//! ```text
//!            connect(token)
//! Disconnected ───────────▶ Connecting ──ok──▶ Connected
//!      ▲                        │                 │
//!      │ disconnect()           │ err             │ dropped / server close
//!      │                        ▼                 ▼
//!      └──────────────── Reconnecting{n} ◀────────┘
//!                               │ n > max_attempts
//!                               ▼
//!                       Exhausted{attempts}
//! ```
//!
//! After every successful (re)connect, in this order: `join_page` is re-sent
//! for each joined room, the outbound queue is drained, and the local
//! `connect` event is dispatched. Only then are inbound frames read.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ChannelConfig;
use crate::error::RealtimeError;
use crate::listeners::{ListenerId, ListenerRegistry};
use crate::protocol::{Envelope, MAX_CHANNEL_NAME_LEN, events, unframe_message};
use crate::queue::{OutboundMessage, OutboundQueue};
use crate::transport::{Transport, TransportConnector, WsMessage};

/// Status of the event channel.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Not connected and not trying to.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Waiting for / performing a reconnection attempt.
    Reconnecting {
        /// Current reconnection attempt number.
        attempt: u32,
    },
    /// Reconnection attempts were abandoned. Emits keep queueing until an
    /// explicit `connect`.
    Exhausted {
        /// Number of reconnection attempts that failed.
        attempts: u32,
    },
}

/// Connection bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// Whether a transport is currently live.
    pub connected: bool,
    /// Consecutive failed attempts; reset to 0 on a successful (re)connect.
    pub reconnect_attempts: u32,
}

struct ConnectionTask {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

struct ChannelInner {
    config: ChannelConfig,
    connector: Arc<dyn TransportConnector>,
    listeners: ListenerRegistry,
    queue: OutboundQueue,
    rooms: Mutex<BTreeSet<String>>,
    state: Mutex<ConnectionState>,
    status: watch::Sender<ConnectionStatus>,
    wake: Notify,
    /// True from `connect` until the connection loop gives up or is shut down.
    active: AtomicBool,
    task: Mutex<Option<ConnectionTask>>,
}

/// Why a live connection ended.
enum SessionEnd {
    /// `disconnect()` was called.
    Shutdown,
    /// The server sent a close frame.
    ServerClosed,
    /// The transport failed or dropped.
    Lost(RealtimeError),
}

/// Handle to the shared event channel.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

impl EventChannel {
    /// Create a channel that opens connections through `connector`.
    ///
    /// Nothing happens on the network until [`connect`](Self::connect).
    pub fn new(config: ChannelConfig, connector: Arc<dyn TransportConnector>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                config,
                connector,
                listeners: ListenerRegistry::new(),
                queue: OutboundQueue::new(),
                rooms: Mutex::new(BTreeSet::new()),
                state: Mutex::new(ConnectionState::default()),
                status,
                wake: Notify::new(),
                active: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    /// Create a channel backed by the tokio-tungstenite transport.
    #[cfg(feature = "native")]
    pub fn native(config: ChannelConfig) -> Self {
        Self::new(config, Arc::new(crate::tokio_transport::TokioConnector))
    }

    /// Start the connection task.
    ///
    /// No-op if a connection task is already running. Returns without effect
    /// when no token is available; the caller retries once one is issued.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self, auth_token: Option<&str>) {
        let Some(token) = auth_token.filter(|t| !t.is_empty()) else {
            log::warn!("[EventChannel] No auth token available, not connecting");
            return;
        };

        let mut task = self.inner.task.lock().unwrap();
        if self.inner.active.swap(true, Ordering::SeqCst) {
            log::debug!("[EventChannel] Already connected or connecting");
            return;
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let token = token.to_string();
        let handle = tokio::spawn(async move {
            inner.run(token, shutdown_rx).await;
        });
        *task = Some(ConnectionTask {
            shutdown: Some(shutdown_tx),
            handle,
        });
    }

    /// Tear down the channel.
    ///
    /// Sends a best-effort `leave_page` for each joined room before closing.
    /// Queued messages stay queued for a later `connect`; joined rooms stay
    /// registered and are re-joined on that connect.
    pub async fn disconnect(&self) {
        let task = self.inner.task.lock().unwrap().take();
        if let Some(mut task) = task {
            log::info!("[EventChannel] Disconnecting");
            if let Some(shutdown) = task.shutdown.take() {
                let _ = shutdown.send(());
            }
            if let Err(e) = task.handle.await
                && !e.is_cancelled()
            {
                log::error!("[EventChannel] Connection task failed: {}", e);
            }
        }
        self.inner.active.store(false, Ordering::SeqCst);
        self.inner.mark_disconnected();
        self.inner.set_status(ConnectionStatus::Disconnected);
    }

    /// Send an event, or queue it until the channel is connected.
    ///
    /// Every emit goes through the same FIFO, so events reach the server in
    /// submission order even across a reconnect.
    pub fn emit(&self, event: &str, payload: Value) {
        self.inner.queue.enqueue(event, payload);
        if !self.is_connected() {
            log::debug!(
                "[EventChannel] Queued '{}' while disconnected ({} pending)",
                event,
                self.inner.queue.len()
            );
        }
        self.inner.wake.notify_one();
    }

    /// Send a binary payload on a named sub-channel (same ordering as `emit`).
    ///
    /// Dropped with a warning if the sub-channel name is too long to frame.
    pub fn emit_binary(&self, channel: &str, data: Vec<u8>) {
        if channel.len() > MAX_CHANNEL_NAME_LEN {
            log::warn!(
                "[EventChannel] Sub-channel name of {} bytes cannot be framed, dropping",
                channel.len()
            );
            return;
        }
        self.inner.queue.push(OutboundMessage::Binary {
            channel: channel.to_string(),
            data,
        });
        self.inner.wake.notify_one();
    }

    /// Register a durable listener for an event.
    ///
    /// The listener survives reconnects; callers never re-subscribe.
    pub fn on<F>(&self, event: &str, callback: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.listeners.on(event, Arc::new(callback))
    }

    /// Remove one listener (`Some(id)`) or all listeners (`None`) for an event.
    pub fn off(&self, event: &str, id: Option<ListenerId>) -> usize {
        self.inner.listeners.off(event, id)
    }

    /// Register a durable listener for a binary sub-channel.
    pub fn on_binary<F>(&self, channel: &str, callback: F) -> ListenerId
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.inner.listeners.on_binary(channel, Arc::new(callback))
    }

    /// Remove binary listeners for a sub-channel.
    pub fn off_binary(&self, channel: &str, id: Option<ListenerId>) -> usize {
        self.inner.listeners.off_binary(channel, id)
    }

    /// Number of listeners registered for an event.
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.listeners.listener_count(event)
    }

    /// Join a page room. The join is replayed after every reconnect.
    pub fn join_room(&self, page_id: &str) {
        let mut rooms = self.inner.rooms.lock().unwrap();
        let inserted = rooms.insert(page_id.to_string());
        // Checked under the rooms lock: a connection marked live after this
        // point replays the join itself.
        let connected = self.is_connected();
        drop(rooms);

        if inserted && connected {
            self.emit(events::JOIN_PAGE, json!({ "page_id": page_id }));
        }
    }

    /// Leave a page room.
    ///
    /// Queued messages for the page are dropped first. While disconnected
    /// nothing is sent: the server already dropped the membership with the
    /// transport.
    pub fn leave_room(&self, page_id: &str) {
        let mut rooms = self.inner.rooms.lock().unwrap();
        let removed = rooms.remove(page_id);
        let connected = self.is_connected();
        drop(rooms);

        let dropped = self.inner.queue.discard_page(page_id);
        if dropped > 0 {
            log::debug!(
                "[EventChannel] Dropped {} queued messages for page {}",
                dropped,
                page_id
            );
        }
        if removed && connected {
            self.emit(events::LEAVE_PAGE, json!({ "page_id": page_id }));
        }
    }

    /// Currently joined rooms.
    pub fn rooms(&self) -> Vec<String> {
        self.inner.rooms()
    }

    /// Whether a transport is currently live.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().unwrap().connected
    }

    /// Snapshot of the connection bookkeeping.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().unwrap().clone()
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    /// Subscribe to status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Number of messages waiting in the outbound queue.
    pub fn pending_len(&self) -> usize {
        self.inner.queue.len()
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("server_url", &self.inner.config.server_url)
            .field("status", &self.status())
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

impl ChannelInner {
    fn rooms(&self) -> Vec<String> {
        self.rooms.lock().unwrap().iter().cloned().collect()
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    /// Mark the transport live and return the rooms to replay on it.
    ///
    /// Both happen under the rooms lock, so a concurrent `join_room` either
    /// lands in the replay or queues its own join, never both.
    fn mark_connected(&self) -> Vec<String> {
        let rooms = self.rooms.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        state.connected = true;
        state.reconnect_attempts = 0;
        drop(state);
        let replay = rooms.iter().cloned().collect();
        drop(rooms);

        self.set_status(ConnectionStatus::Connected);
        replay
    }

    fn mark_disconnected(&self) {
        self.state.lock().unwrap().connected = false;
    }

    fn record_failed_attempt(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.reconnect_attempts += 1;
        state.reconnect_attempts
    }

    fn reconnect_attempts(&self) -> u32 {
        self.state.lock().unwrap().reconnect_attempts
    }

    /// Connection task: connect, serve, and reconnect until shut down or
    /// out of attempts.
    async fn run(self: Arc<Self>, auth_token: String, mut shutdown: oneshot::Receiver<()>) {
        let url = self.config.build_ws_url();
        let policy = self.config.reconnect.clone();
        // Attempts left over from an earlier, exhausted run do not count
        // against this run's budget.
        let mut budget_base = self.reconnect_attempts();
        let mut delay: Option<Duration> = None;

        loop {
            if let Some(wait) = delay.take() {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = &mut shutdown => break,
                }
            }

            let attempt = self.reconnect_attempts().saturating_sub(budget_base);
            if attempt == 0 {
                self.set_status(ConnectionStatus::Connecting);
            }

            let connected = tokio::select! {
                result = self.connector.connect(&url, &auth_token) => result,
                _ = &mut shutdown => break,
            };

            let outcome = match connected {
                Ok(mut transport) => {
                    log::info!("[EventChannel] Connected to {}", url);
                    budget_base = 0;
                    let rooms = self.mark_connected();
                    let outcome = self.serve(transport.as_mut(), rooms, &mut shutdown).await;
                    self.mark_disconnected();
                    outcome
                }
                Err(e) => {
                    log::error!("[EventChannel] Connection failed: {}", e);
                    SessionEnd::Lost(e)
                }
            };

            let next_delay = match outcome {
                SessionEnd::Shutdown => break,
                SessionEnd::ServerClosed => {
                    log::info!("[EventChannel] Connection closed by server");
                    policy.server_close_delay
                }
                SessionEnd::Lost(e) => {
                    if !policy.enabled {
                        log::info!("[EventChannel] Connection lost ({}), reconnect disabled", e);
                        self.active.store(false, Ordering::SeqCst);
                        self.set_status(ConnectionStatus::Disconnected);
                        break;
                    }
                    log::warn!("[EventChannel] Connection lost: {}", e);
                    Duration::ZERO
                }
            };

            let attempt = self.record_failed_attempt().saturating_sub(budget_base);
            if attempt > policy.max_attempts {
                log::info!(
                    "[EventChannel] Max reconnection attempts reached ({})",
                    policy.max_attempts
                );
                self.active.store(false, Ordering::SeqCst);
                self.set_status(ConnectionStatus::Exhausted {
                    attempts: policy.max_attempts,
                });
                break;
            }

            let wait = if next_delay.is_zero() {
                policy.delay_for(attempt)
            } else {
                next_delay
            };
            log::info!(
                "[EventChannel] Reconnecting in {:?} (attempt {}/{})",
                wait,
                attempt,
                policy.max_attempts
            );
            self.set_status(ConnectionStatus::Reconnecting { attempt });
            delay = Some(wait);
        }

        log::info!("[EventChannel] Connection loop exited");
    }

    /// Serve one live transport until it ends.
    async fn serve(
        &self,
        transport: &mut (dyn Transport + '_),
        rooms: Vec<String>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> SessionEnd {
        // Room membership does not survive a transport-level disconnect.
        for page_id in rooms {
            let join = OutboundMessage::Event {
                event: events::JOIN_PAGE.to_string(),
                payload: json!({ "page_id": page_id }),
            };
            if let Err(e) = join.send_to(transport).await {
                return SessionEnd::Lost(e);
            }
        }

        match self.queue.flush(transport).await {
            Ok(0) => {}
            Ok(sent) => log::info!("[EventChannel] Flushed {} queued messages", sent),
            Err(e) => return SessionEnd::Lost(e),
        }

        self.listeners.dispatch(events::CONNECT, &Value::Null);

        let period = self.config.ping_interval.max(Duration::from_millis(1));
        let mut ping_interval = tokio::time::interval(period);
        ping_interval.tick().await; // Consume first immediate tick

        loop {
            if let Err(e) = self.queue.flush(transport).await {
                return SessionEnd::Lost(e);
            }

            tokio::select! {
                biased;
                _ = &mut *shutdown => {
                    for page_id in self.rooms() {
                        let leave = OutboundMessage::Event {
                            event: events::LEAVE_PAGE.to_string(),
                            payload: json!({ "page_id": page_id }),
                        };
                        if let Err(e) = leave.send_to(transport).await {
                            log::debug!("[EventChannel] Best-effort leave failed: {}", e);
                            break;
                        }
                    }
                    let _ = transport.close().await;
                    return SessionEnd::Shutdown;
                }
                _ = self.wake.notified() => {}
                msg = transport.recv() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => self.dispatch_text(&text),
                        Some(Ok(WsMessage::Binary(data))) => self.dispatch_binary(&data),
                        Some(Ok(WsMessage::Close)) => {
                            let _ = transport.close().await;
                            return SessionEnd::ServerClosed;
                        }
                        Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {} // keepalive
                        Some(Err(e)) => return SessionEnd::Lost(e),
                        None => return SessionEnd::Lost(RealtimeError::Closed),
                    }
                }
                _ = ping_interval.tick() => {
                    if let Err(e) = transport.send_ping().await {
                        return SessionEnd::Lost(e);
                    }
                }
            }
        }
    }

    fn dispatch_text(&self, text: &str) {
        match Envelope::decode(text) {
            Ok(envelope) => {
                let delivered = self.listeners.dispatch(&envelope.event, &envelope.payload);
                log::trace!(
                    "[EventChannel] '{}' delivered to {} listeners",
                    envelope.event,
                    delivered
                );
            }
            Err(e) => log::warn!("[EventChannel] Dropping malformed text frame: {}", e),
        }
    }

    fn dispatch_binary(&self, data: &[u8]) {
        match unframe_message(data) {
            Some((channel, payload)) => {
                if self.listeners.dispatch_binary(&channel, &payload) == 0 {
                    log::debug!("[EventChannel] No listener for sub-channel '{}'", channel);
                }
            }
            None => log::warn!("[EventChannel] Dropping malformed binary frame"),
        }
    }
}
