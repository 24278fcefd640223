//! Outbound message queue.
//!
//! Every outbound message goes through this FIFO. While disconnected it
//! simply accumulates; once a transport is available the channel drains it
//! head-to-tail. A message is only removed after the transport accepted it,
//! so a send failure mid-flush leaves it (and everything behind it) queued
//! for the next connection.
//!
//! Messages for a page can be discarded when the page is left, so nothing
//! about a closed page reaches the server on the next flush.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::Result;
use crate::protocol::{Envelope, doc_channel, frame_message};
use crate::transport::{Transport, WsMessage};

/// A message waiting to be sent.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// A named JSON event.
    Event {
        /// Event name.
        event: String,
        /// Event payload.
        payload: Value,
    },
    /// A binary frame on a named sub-channel.
    Binary {
        /// Sub-channel name (e.g. `doc:<page_id>`).
        channel: String,
        /// Raw payload, framed on send.
        data: Vec<u8>,
    },
}

impl OutboundMessage {
    /// Encode into a wire frame.
    pub fn encode(&self) -> Result<WsMessage> {
        match self {
            OutboundMessage::Event { event, payload } => {
                let text = Envelope::new(event.clone(), payload.clone()).encode()?;
                Ok(WsMessage::Text(text))
            }
            OutboundMessage::Binary { channel, data } => {
                Ok(WsMessage::Binary(frame_message(channel, data)?))
            }
        }
    }

    /// Write this message to a transport.
    pub async fn send_to(&self, transport: &mut (dyn Transport + '_)) -> Result<()> {
        send_frame(transport, self.encode()?).await
    }

    /// Whether this message belongs to `page_id`: an event whose payload
    /// names the page, or a frame on the page's content-sync sub-channel.
    pub fn concerns_page(&self, page_id: &str) -> bool {
        match self {
            OutboundMessage::Event { payload, .. } => {
                payload.get("page_id").and_then(Value::as_str) == Some(page_id)
            }
            OutboundMessage::Binary { channel, .. } => *channel == doc_channel(page_id),
        }
    }
}

async fn send_frame(transport: &mut (dyn Transport + '_), frame: WsMessage) -> Result<()> {
    match frame {
        WsMessage::Text(text) => transport.send_text(text).await,
        WsMessage::Binary(data) => transport.send_binary(data).await,
        WsMessage::Ping(_) => transport.send_ping().await,
        WsMessage::Pong(_) | WsMessage::Close => Ok(()),
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// Messages tagged with a sequence number, oldest first.
    messages: VecDeque<(u64, OutboundMessage)>,
    next_seq: u64,
}

/// FIFO of outbound messages shared between emitters and the connection task.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
}

impl OutboundQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a JSON event to the tail.
    pub fn enqueue(&self, event: impl Into<String>, payload: Value) {
        self.push(OutboundMessage::Event {
            event: event.into(),
            payload,
        });
    }

    /// Append any outbound message to the tail.
    pub fn push(&self, message: OutboundMessage) {
        let mut state = self.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.messages.push_back((seq, message));
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().messages.is_empty()
    }

    /// Snapshot of the queued messages in order (for diagnostics).
    pub fn pending(&self) -> Vec<OutboundMessage> {
        let state = self.state.lock().unwrap();
        state.messages.iter().map(|(_, m)| m.clone()).collect()
    }

    /// Drop every queued message.
    pub fn clear(&self) {
        self.state.lock().unwrap().messages.clear();
    }

    /// Drop every queued message that concerns `page_id`.
    ///
    /// Returns the number of messages dropped.
    pub fn discard_page(&self, page_id: &str) -> usize {
        let mut state = self.state.lock().unwrap();
        let before = state.messages.len();
        state.messages.retain(|(_, m)| !m.concerns_page(page_id));
        before - state.messages.len()
    }

    /// Drain the queue head-to-tail through `transport`.
    ///
    /// Stops at the first failed send, leaving that message and the rest of
    /// the queue in place. A message that cannot be encoded is dropped.
    /// Returns the number of messages sent.
    ///
    /// Only one flusher may run at a time (the channel's connection task).
    pub async fn flush(&self, transport: &mut (dyn Transport + '_)) -> Result<usize> {
        let mut sent = 0;
        loop {
            let next = self.state.lock().unwrap().messages.front().cloned();
            let Some((seq, message)) = next else {
                return Ok(sent);
            };

            match message.encode() {
                Ok(frame) => {
                    send_frame(transport, frame).await?;
                    sent += 1;
                }
                Err(e) => log::warn!("[OutboundQueue] Dropping unsendable message: {}", e),
            }

            // The head may have been discarded while the send was in flight.
            let mut state = self.state.lock().unwrap();
            if state.messages.front().is_some_and(|(head, _)| *head == seq) {
                state.messages.pop_front();
            }
        }
    }
}
