//! In-memory transport for integration tests.
//!
//! ```text
//! ┌──────────────┐   MockTransport    ┌──────────────┐
//! │ EventChannel │ ←────────────────→ │  MockServer  │  (one per connection)
//! └──────────────┘                    └──────────────┘
//! ```
//!
//! Every successful `connect` hands the test a fresh [`MockServer`] through
//! the receiver returned by [`MockConnector::new`].

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use folio_realtime::protocol::{frame_message, unframe_message};
use folio_realtime::{
    ChannelConfig, Envelope, EventChannel, RealtimeError, Result, Transport, TransportConnector,
    WsMessage,
};
use serde_json::Value;
use tokio::sync::mpsc;

/// Connector producing in-memory transports.
pub struct MockConnector {
    failing: AtomicBool,
    attempts: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    servers: mpsc::UnboundedSender<MockServer>,
}

impl MockConnector {
    /// New connector and the stream of server ends it will produce.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            failing: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
            servers: tx,
        });
        (connector, rx)
    }

    /// Make every subsequent connect fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of connect calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Tokens presented on each connect call.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self, _url: &str, auth_token: &str) -> Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(auth_token.to_string());
        if self.failing.load(Ordering::SeqCst) {
            return Err(RealtimeError::ConnectionFailed("mock refused".into()));
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let server = MockServer {
            sent: from_client,
            inbound: to_client,
        };
        self.servers
            .send(server)
            .map_err(|_| RealtimeError::ConnectionFailed("test harness gone".into()))?;

        Ok(Box::new(MockTransport {
            outbound: to_server,
            inbound: from_server,
        }))
    }
}

struct MockTransport {
    outbound: mpsc::UnboundedSender<WsMessage>,
    inbound: mpsc::UnboundedReceiver<Result<WsMessage>>,
}

impl MockTransport {
    fn send(&self, message: WsMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| RealtimeError::SendFailed("mock server dropped".into()))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.send(WsMessage::Text(text))
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        self.send(WsMessage::Binary(data))
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.send(WsMessage::Ping(Vec::new()))
    }

    async fn recv(&mut self) -> Option<Result<WsMessage>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.outbound.send(WsMessage::Close);
        Ok(())
    }
}

/// Server end of one mock connection.
pub struct MockServer {
    sent: mpsc::UnboundedReceiver<WsMessage>,
    inbound: mpsc::UnboundedSender<Result<WsMessage>>,
}

impl MockServer {
    /// Next frame the client sent, skipping keepalive pings.
    pub async fn next_frame(&mut self) -> Option<WsMessage> {
        loop {
            match self.sent.recv().await? {
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => return Some(other),
            }
        }
    }

    /// Next JSON event the client sent, skipping binary frames.
    pub async fn next_event(&mut self) -> Option<Envelope> {
        loop {
            match self.next_frame().await? {
                WsMessage::Text(text) => return Envelope::decode(&text).ok(),
                WsMessage::Close => return None,
                _ => continue,
            }
        }
    }

    /// Next binary frame the client sent, as `(channel, payload)`.
    pub async fn next_binary(&mut self) -> Option<(String, Vec<u8>)> {
        loop {
            match self.next_frame().await? {
                WsMessage::Binary(data) => return unframe_message(&data),
                WsMessage::Close => return None,
                _ => continue,
            }
        }
    }

    /// Every frame sent so far that is already buffered.
    pub fn drain(&mut self) -> Vec<WsMessage> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Push a JSON event to the client.
    pub fn send_event(&self, event: &str, payload: Value) {
        let text = Envelope::new(event, payload).encode().unwrap();
        self.send_raw(WsMessage::Text(text));
    }

    /// Push a binary sub-channel frame to the client.
    pub fn send_binary(&self, channel: &str, data: &[u8]) {
        self.send_raw(WsMessage::Binary(frame_message(channel, data).unwrap()));
    }

    /// Push any frame to the client.
    pub fn send_raw(&self, message: WsMessage) {
        let _ = self.inbound.send(Ok(message));
    }

    /// Server-initiated close.
    pub fn close(&self) {
        self.send_raw(WsMessage::Close);
    }

    /// Drop the connection without a close frame.
    pub fn drop_connection(self) {}

    /// Split into the client-frames receiver and the push sender.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedReceiver<WsMessage>,
        mpsc::UnboundedSender<Result<WsMessage>>,
    ) {
        (self.sent, self.inbound)
    }
}

/// Forward every binary frame each client sends to the other client, like a
/// room broadcast on the server.
pub fn relay_binary(a: MockServer, b: MockServer) {
    let (mut a_sent, a_inbound) = a.into_parts();
    let (mut b_sent, b_inbound) = b.into_parts();
    tokio::spawn(async move {
        while let Some(frame) = a_sent.recv().await {
            if let WsMessage::Binary(data) = frame {
                let _ = b_inbound.send(Ok(WsMessage::Binary(data)));
            }
        }
    });
    tokio::spawn(async move {
        while let Some(frame) = b_sent.recv().await {
            if let WsMessage::Binary(data) = frame {
                let _ = a_inbound.send(Ok(WsMessage::Binary(data)));
            }
        }
    });
}

/// Channel config with short, deterministic reconnect timing.
pub fn test_config() -> ChannelConfig {
    let mut config = ChannelConfig::new("http://mock.test");
    config.reconnect.max_attempts = 3;
    config.reconnect.base_delay = Duration::from_millis(100);
    config.reconnect.max_delay = Duration::from_millis(400);
    config.reconnect.server_close_delay = Duration::from_millis(50);
    config
}

/// Channel wired to a fresh mock connector.
pub fn mock_channel(
    config: ChannelConfig,
) -> (
    EventChannel,
    Arc<MockConnector>,
    mpsc::UnboundedReceiver<MockServer>,
) {
    let (connector, servers) = MockConnector::new();
    let channel = EventChannel::new(config, connector.clone());
    (channel, connector, servers)
}

/// Poll `condition` until it holds, failing the test after `timeout`.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await the next mock server, failing the test after `timeout`.
pub async fn next_server(
    servers: &mut mpsc::UnboundedReceiver<MockServer>,
    timeout: Duration,
) -> MockServer {
    tokio::time::timeout(timeout, servers.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}
