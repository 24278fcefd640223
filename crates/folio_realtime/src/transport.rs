//! Transport abstraction for the event channel.
//!
//! The [`EventChannel`](crate::EventChannel) owns reconnection, queueing and
//! listener dispatch. It talks to the network only through these traits:
//!
//! ```text
//! ┌────────────────────┐    ┌────────────────────┐
//! │ TokioTransport     │    │ custom transport   │
//! │ (tokio-tungstenite)│    │ (JS bridge, mock)  │
//! └─────────┬──────────┘    └─────────┬──────────┘
//!           └────────────┬────────────┘
//!                        ▼
//!           ┌──────────────────────┐
//!           │   EventChannel       │
//!           │   - Reconnection     │
//!           │   - Outbound queue   │
//!           │   - Listener table   │
//!           └──────────────────────┘
//! ```
//!
//! A transport is a single connection: once it reports `Close` or `None` it
//! is discarded and the connector is asked for a fresh one.

use crate::error::Result;

/// A frame received from (or sent to) the server.
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    /// Text frame (JSON event envelope).
    Text(String),
    /// Binary frame (framed content-sync message).
    Binary(Vec<u8>),
    /// Keepalive ping.
    Ping(Vec<u8>),
    /// Keepalive pong.
    Pong(Vec<u8>),
    /// The server closed the connection.
    Close,
}

/// A single live connection to the server.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Send a text frame.
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Send a binary frame.
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()>;

    /// Send a keepalive ping.
    async fn send_ping(&mut self) -> Result<()>;

    /// Receive the next frame. `None` means the connection dropped.
    async fn recv(&mut self) -> Option<Result<WsMessage>>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<()>;
}

/// Factory for transports; invoked on every (re)connect.
#[async_trait::async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open a connection to `url`, authenticating with `auth_token`.
    async fn connect(&self, url: &str, auth_token: &str) -> Result<Box<dyn Transport>>;
}
