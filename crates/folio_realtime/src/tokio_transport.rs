//! Native WebSocket transport.
//!
//! The auth token travels in an `Authorization: Bearer` header on the
//! upgrade request, never in the URL.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::{RealtimeError, Result};
use crate::transport::{Transport, TransportConnector, WsMessage};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A `Transport` backed by tokio-tungstenite.
pub struct TokioTransport {
    ws: WsStream,
}

impl TokioTransport {
    /// Connect to a WebSocket URL, sending the token as a bearer credential.
    pub async fn connect(url: &str, auth_token: &str) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", auth_token))
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;
        Ok(Self { ws })
    }
}

#[async_trait::async_trait]
impl Transport for TokioTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| RealtimeError::SendFailed(e.to_string()))
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        self.ws
            .send(Message::Binary(data.into()))
            .await
            .map_err(|e| RealtimeError::SendFailed(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.ws
            .send(Message::Ping(vec![].into()))
            .await
            .map_err(|e| RealtimeError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<WsMessage>> {
        match self.ws.next().await {
            Some(Ok(Message::Binary(data))) => Some(Ok(WsMessage::Binary(data.to_vec()))),
            Some(Ok(Message::Text(text))) => Some(Ok(WsMessage::Text(text.to_string()))),
            Some(Ok(Message::Ping(data))) => Some(Ok(WsMessage::Ping(data.to_vec()))),
            Some(Ok(Message::Pong(data))) => Some(Ok(WsMessage::Pong(data.to_vec()))),
            Some(Ok(Message::Close(_))) => Some(Ok(WsMessage::Close)),
            Some(Ok(Message::Frame(_))) => {
                // Only produced when writing raw frames.
                Some(Ok(WsMessage::Pong(vec![])))
            }
            Some(Err(e)) => Some(Err(RealtimeError::ConnectionFailed(e.to_string()))),
            None => None,
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.ws
            .close(None)
            .await
            .map_err(|e| RealtimeError::SendFailed(e.to_string()))
    }
}

/// Default connector for [`EventChannel::native`](crate::EventChannel::native).
pub struct TokioConnector;

#[async_trait::async_trait]
impl TransportConnector for TokioConnector {
    async fn connect(&self, url: &str, auth_token: &str) -> Result<Box<dyn Transport>> {
        let transport = TokioTransport::connect(url, auth_token).await?;
        Ok(Box::new(transport))
    }
}
