//! Wire protocol for the shared event channel.
//!
//! Text frames carry JSON envelopes:
//!
//! ```text
//! {"event": "cursor_update", "payload": {"page_id": "doc-1", "cursor": {"x": 10, "y": 20}}}
//! ```
//!
//! Binary frames carry the per-document content-sync sub-protocol. Each frame
//! is prefixed with the name of the sub-channel it belongs to:
//!
//! ```text
//! [u16 BE name length][name bytes][y-sync message]
//! ```
//!
//! The y-sync message itself is `[0][sync type][payload]`, where the sync type
//! is `0` (SyncStep1, a state vector), `1` (SyncStep2, missing updates) or `2`
//! (Update, an incremental update).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RealtimeError, Result};
use crate::presence::PresenceEntry;

/// Event names used on the channel.
pub mod events {
    /// Client joins a page room.
    pub const JOIN_PAGE: &str = "join_page";
    /// Client leaves a page room.
    pub const LEAVE_PAGE: &str = "leave_page";
    /// Cursor moved (outbound from the local client, inbound from peers).
    pub const CURSOR_UPDATE: &str = "cursor_update";
    /// A user joined the room.
    pub const USER_JOINED: &str = "user_joined";
    /// A user left the room.
    pub const USER_LEFT: &str = "user_left";
    /// Bulk presence snapshot for the room.
    pub const PRESENCE_UPDATE: &str = "presence_update";
    /// Local-only: dispatched after every successful (re)connect.
    pub const CONNECT: &str = "connect";
}

/// JSON envelope carried in text frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Create an envelope.
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Encode to a JSON text frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON text frame.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// A cursor position within a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
    /// Block the cursor is anchored to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_ref: Option<String>,
}

impl Cursor {
    /// Create a cursor without a block anchor.
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            block_ref: None,
        }
    }

    /// Anchor the cursor to a block.
    pub fn with_block(mut self, block_ref: impl Into<String>) -> Self {
        self.block_ref = Some(block_ref.into());
        self
    }
}

/// Payload of `join_page` / `leave_page`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagePayload {
    /// Page (document) ID.
    pub page_id: String,
}

/// Payload of `cursor_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorUpdatePayload {
    /// Page (document) ID.
    pub page_id: String,
    /// Sender's user ID (filled in by the server for inbound updates).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Sender's display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// New cursor position.
    pub cursor: Cursor,
}

/// User identity as carried in join/leave events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRef {
    /// User ID.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Email address.
    #[serde(default)]
    pub email: String,
}

/// Payload of `user_joined`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserJoinedPayload {
    /// Page (document) ID.
    pub page_id: String,
    /// The user that joined.
    pub user: UserRef,
}

/// Payload of `user_left`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLeftPayload {
    /// Page (document) ID.
    pub page_id: String,
    /// The user that left (only `id` is required).
    pub user: UserRef,
}

/// Payload of `presence_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdatePayload {
    /// Page (document) ID.
    pub page_id: String,
    /// Users currently present.
    #[serde(default)]
    pub users: Vec<PresenceEntry>,
}

/// A parsed inbound presence event.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// `user_joined`
    Joined(UserJoinedPayload),
    /// `cursor_update`
    Cursor(CursorUpdatePayload),
    /// `presence_update`
    Snapshot(PresenceUpdatePayload),
    /// `user_left`
    Left(UserLeftPayload),
}

impl PresenceEvent {
    /// Parse a presence event from its name and raw payload.
    ///
    /// Returns `Ok(None)` for events that are not presence events.
    pub fn parse(event: &str, payload: &Value) -> Result<Option<Self>> {
        let parsed = match event {
            events::USER_JOINED => Self::Joined(serde_json::from_value(payload.clone())?),
            events::CURSOR_UPDATE => Self::Cursor(serde_json::from_value(payload.clone())?),
            events::PRESENCE_UPDATE => Self::Snapshot(serde_json::from_value(payload.clone())?),
            events::USER_LEFT => Self::Left(serde_json::from_value(payload.clone())?),
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }

    /// The page this event is scoped to.
    pub fn page_id(&self) -> &str {
        match self {
            Self::Joined(p) => &p.page_id,
            Self::Cursor(p) => &p.page_id,
            Self::Snapshot(p) => &p.page_id,
            Self::Left(p) => &p.page_id,
        }
    }
}

// ==================== Binary sub-channels ====================

/// Name of the content-sync sub-channel for a page.
pub fn doc_channel(page_id: &str) -> String {
    format!("doc:{}", page_id)
}

/// Longest sub-channel name a frame can carry, in bytes.
pub const MAX_CHANNEL_NAME_LEN: usize = u16::MAX as usize;

/// Prefix a payload with its sub-channel name.
///
/// Fails if the name does not fit the `u16` length prefix.
pub fn frame_message(channel: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let name = channel.as_bytes();
    let len = u16::try_from(name.len()).map_err(|_| {
        RealtimeError::Protocol(format!(
            "Sub-channel name is {} bytes, limit is {}",
            name.len(),
            MAX_CHANNEL_NAME_LEN
        ))
    })?;
    let mut buf = Vec::with_capacity(2 + name.len() + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(name);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Split a framed binary message into `(channel, payload)`.
pub fn unframe_message(data: &[u8]) -> Option<(String, Vec<u8>)> {
    if data.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let rest = &data[2..];
    if rest.len() < len {
        return None;
    }
    let channel = std::str::from_utf8(&rest[..len]).ok()?.to_string();
    Some((channel, rest[len..].to_vec()))
}

/// Message type bytes for the y-sync protocol.
mod msg_type {
    /// Sync message (SyncStep1, SyncStep2, Update)
    pub const SYNC: u8 = 0;
}

/// Sync sub-message types.
mod sync_type {
    /// SyncStep1: Initial state vector exchange
    pub const STEP1: u8 = 0;
    /// SyncStep2: Missing updates response
    pub const STEP2: u8 = 1;
    /// Update: Incremental update
    pub const UPDATE: u8 = 2;
}

/// Y-sync message types.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// SyncStep1 contains a state vector
    SyncStep1(Vec<u8>),
    /// SyncStep2 contains missing updates
    SyncStep2(Vec<u8>),
    /// Update contains an incremental update
    Update(Vec<u8>),
}

impl SyncMessage {
    /// Encode the message to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let (kind, body) = match self {
            SyncMessage::SyncStep1(sv) => (sync_type::STEP1, sv),
            SyncMessage::SyncStep2(update) => (sync_type::STEP2, update),
            SyncMessage::Update(update) => (sync_type::UPDATE, update),
        };
        let mut buf = Vec::with_capacity(2 + body.len());
        buf.push(msg_type::SYNC);
        buf.push(kind);
        buf.extend_from_slice(body);
        buf
    }

    /// Decode a message from bytes.
    ///
    /// Returns `Ok(None)` for non-sync messages (awareness, auth).
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < 2 {
            return Ok(None);
        }
        if data[0] != msg_type::SYNC {
            return Ok(None);
        }

        let payload = data[2..].to_vec();
        match data[1] {
            sync_type::STEP1 => Ok(Some(SyncMessage::SyncStep1(payload))),
            sync_type::STEP2 => Ok(Some(SyncMessage::SyncStep2(payload))),
            sync_type::UPDATE => Ok(Some(SyncMessage::Update(payload))),
            other => Err(RealtimeError::Protocol(format!(
                "Unknown sync type: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::new(events::JOIN_PAGE, json!({"page_id": "doc-1"}));
        let text = envelope.encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"event": "join_page", "payload": {"page_id": "doc-1"}}));
    }

    #[test]
    fn test_envelope_missing_payload_defaults_to_null() {
        let envelope = Envelope::decode(r#"{"event": "ping"}"#).unwrap();
        assert_eq!(envelope.event, "ping");
        assert_eq!(envelope.payload, Value::Null);
    }

    #[test]
    fn test_envelope_invalid_json_fails() {
        assert!(Envelope::decode("not valid json").is_err());
    }

    #[test]
    fn test_cursor_payload_omits_empty_fields() {
        let payload = CursorUpdatePayload {
            page_id: "doc-1".to_string(),
            user_id: None,
            user_name: None,
            cursor: Cursor::new(10.0, 20.0),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, json!({"page_id": "doc-1", "cursor": {"x": 10.0, "y": 20.0}}));
    }

    #[test]
    fn test_parse_user_left_with_only_id() {
        let payload = json!({"page_id": "doc-1", "user": {"id": "b"}});
        let event = PresenceEvent::parse(events::USER_LEFT, &payload)
            .unwrap()
            .unwrap();
        match event {
            PresenceEvent::Left(p) => {
                assert_eq!(p.user.id, "b");
                assert!(p.user.name.is_empty());
            }
            other => panic!("Expected Left, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_cursor_update() {
        let payload = json!({
            "page_id": "doc-1",
            "user_id": "b",
            "cursor": {"x": 1, "y": 2, "block_ref": "blk-7"}
        });
        let event = PresenceEvent::parse(events::CURSOR_UPDATE, &payload)
            .unwrap()
            .unwrap();
        assert_eq!(event.page_id(), "doc-1");
        match event {
            PresenceEvent::Cursor(p) => {
                assert_eq!(p.user_id.as_deref(), Some("b"));
                assert_eq!(p.cursor, Cursor::new(1.0, 2.0).with_block("blk-7"));
            }
            other => panic!("Expected Cursor, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_malformed_payload_is_error() {
        let payload = json!({"page_id": "doc-1"});
        assert!(PresenceEvent::parse(events::USER_JOINED, &payload).is_err());
    }

    #[test]
    fn test_parse_unrelated_event_is_none() {
        let parsed = PresenceEvent::parse(events::JOIN_PAGE, &json!({"page_id": "x"})).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_frame_and_unframe() {
        let framed = frame_message(&doc_channel("doc-1"), &[0, 2, 9, 9]).unwrap();
        let (channel, payload) = unframe_message(&framed).unwrap();
        assert_eq!(channel, "doc:doc-1");
        assert_eq!(payload, vec![0, 2, 9, 9]);
    }

    #[test]
    fn test_frame_rejects_oversized_channel_name() {
        let longest = "a".repeat(MAX_CHANNEL_NAME_LEN);
        let framed = frame_message(&longest, &[1]).unwrap();
        assert_eq!(unframe_message(&framed).unwrap().0, longest);

        let too_long = "a".repeat(MAX_CHANNEL_NAME_LEN + 1);
        assert!(matches!(
            frame_message(&too_long, &[1]),
            Err(RealtimeError::Protocol(_))
        ));
    }

    #[test]
    fn test_unframe_truncated() {
        assert!(unframe_message(&[0]).is_none());
        assert!(unframe_message(&[0, 10, b'a']).is_none());
    }

    #[test]
    fn test_sync_message_decode() {
        let msg = SyncMessage::Update(vec![1, 2, 3]);
        let encoded = msg.encode();
        assert_eq!(encoded, vec![0, 2, 1, 2, 3]);
        assert_eq!(SyncMessage::decode(&encoded).unwrap(), Some(msg));
    }

    #[test]
    fn test_sync_message_skips_awareness() {
        let fake_awareness = vec![1, 0, 1, 2, 3];
        assert_eq!(SyncMessage::decode(&fake_awareness).unwrap(), None);
    }

    #[test]
    fn test_sync_message_unknown_type() {
        assert!(SyncMessage::decode(&[0, 7]).is_err());
    }
}
