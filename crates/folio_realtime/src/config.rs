//! Configuration for the realtime layer.
//!
//! All types deserialize with defaults so they can be embedded in a larger
//! TOML/JSON config file. Durations are encoded as milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serde helpers for `Duration` as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => s.serialize_some(&(d.as_millis() as u64)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
        }
    }
}

/// Reconnection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Whether to automatically reconnect after an unexpected disconnect.
    pub enabled: bool,
    /// Maximum number of consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Upper bound for the retry delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Delay before the single manual reconnect after a server-initiated close.
    #[serde(with = "millis")]
    pub server_close_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            server_close_delay: Duration::from_secs(1),
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnection attempt `attempt` (1-based).
    ///
    /// Doubles from `base_delay` and is capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}

/// Event channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Base server URL (e.g., "https://collab.example.com").
    pub server_url: String,
    /// WebSocket endpoint path on the server.
    pub path: String,
    /// Keepalive ping interval while connected.
    #[serde(with = "millis")]
    pub ping_interval: Duration,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3030".to_string(),
            path: "/realtime".to_string(),
            ping_interval: Duration::from_secs(25),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ChannelConfig {
    /// Create a channel config for the given server with default policy.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    /// Build the WebSocket URL from the config.
    pub fn build_ws_url(&self) -> String {
        let ws_server = self
            .server_url
            .trim_end_matches('/')
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        if self.path.is_empty() {
            ws_server
        } else if self.path.starts_with('/') {
            format!("{}{}", ws_server, self.path)
        } else {
            format!("{}/{}", ws_server, self.path)
        }
    }
}

/// Cursor throttle configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Minimum spacing between two emitted cursor updates.
    #[serde(with = "millis")]
    pub interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
        }
    }
}

/// Presence staleness configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Evict remote entries whose `last_seen` is older than this.
    /// `None` (the default) keeps entries until an explicit `user_left`,
    /// since peers only refresh `last_seen` when they move their cursor.
    #[serde(with = "millis::option")]
    pub stale_after: Option<Duration>,
    /// How often the per-session sweeper checks for stale entries.
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            stale_after: None,
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Identity published by the local client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    /// Stable user ID.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Email address.
    #[serde(default)]
    pub email: String,
}

impl LocalUser {
    /// Create a new local identity.
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
        }
    }
}

/// Complete realtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Event channel settings.
    pub channel: ChannelConfig,
    /// Cursor throttle settings.
    pub throttle: ThrottleConfig,
    /// Presence staleness settings.
    pub presence: PresenceConfig,
    /// Local user identity.
    pub user: LocalUser,
}
