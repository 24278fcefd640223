//! # `folio_realtime`
//!
//! Realtime collaboration layer for Folio pages.
//!
//! - [`EventChannel`]: one persistent, auto-reconnecting connection per
//!   process, with a durable listener table and an outbound FIFO queue.
//! - [`SessionCache`] / [`DocumentSession`]: reference-counted per-page
//!   sessions, each owning a [`ReplicatedDocument`] (content + presence maps).
//! - [`PresenceAggregator`]: folds join/leave/cursor/snapshot events into the
//!   presence map.
//! - [`CursorThrottle`]: rate-limits the local cursor broadcast.
//!
//! ```ignore
//! use folio_realtime::{EventChannel, RealtimeConfig, SessionCache, Cursor};
//!
//! let config = RealtimeConfig::default();
//! let channel = EventChannel::native(config.channel.clone());
//! channel.connect(Some(&token));
//!
//! let cache = SessionCache::new(channel, config);
//! let page = cache.get("page-1");
//! page.submit_cursor(Cursor::new(10.0, 20.0))?;
//! cache.release("page-1");
//! ```

#![warn(missing_docs)]

/// Event channel and connection lifecycle
pub mod channel;

/// Configuration
pub mod config;

/// Replicated documents
pub mod doc;

/// Error types
pub mod error;

pub mod listeners;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod throttle;
pub mod transport;

/// Native WebSocket transport
#[cfg(feature = "native")]
pub mod tokio_transport;

pub use channel::{ConnectionState, ConnectionStatus, EventChannel};
pub use config::{
    ChannelConfig, LocalUser, PresenceConfig, RealtimeConfig, ReconnectConfig, ThrottleConfig,
};
pub use doc::{ObserverId, ReplicatedDocument, ReplicatedMap, UpdateOrigin};
pub use error::{RealtimeError, Result};
pub use listeners::{ListenerId, ListenerRegistry};
pub use presence::{PresenceAggregator, PresenceEntry, PresenceState};
pub use protocol::{Cursor, Envelope, PresenceEvent, SyncMessage, events};
pub use queue::{OutboundMessage, OutboundQueue};
pub use session::{DocumentSession, SessionCache};
pub use throttle::CursorThrottle;
pub use transport::{Transport, TransportConnector, WsMessage};

#[cfg(feature = "native")]
pub use tokio_transport::{TokioConnector, TokioTransport};
