//! Durable listener table.
//!
//! Listeners live here, not on the transport, so a reconnect never drops a
//! subscription: the connection task consults this table for every inbound
//! frame, whichever transport delivered it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

/// Callback for JSON events.
pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callback for binary sub-channel payloads.
pub type BinaryCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Table<C> = Mutex<HashMap<String, Vec<(ListenerId, C)>>>;

/// Registry of event and binary listeners keyed by name.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    events: Table<EventCallback>,
    binary: Table<BinaryCallback>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a callback for a JSON event.
    pub fn on(&self, event: &str, callback: EventCallback) -> ListenerId {
        let id = self.next_id();
        self.events
            .lock()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    /// Remove one listener (`Some(id)`) or every listener (`None`) for an event.
    ///
    /// Returns the number of listeners removed.
    pub fn off(&self, event: &str, id: Option<ListenerId>) -> usize {
        remove(&self.events, event, id)
    }

    /// Register a callback for a binary sub-channel.
    pub fn on_binary(&self, channel: &str, callback: BinaryCallback) -> ListenerId {
        let id = self.next_id();
        self.binary
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    /// Remove binary listeners, like [`off`](Self::off).
    pub fn off_binary(&self, channel: &str, id: Option<ListenerId>) -> usize {
        remove(&self.binary, channel, id)
    }

    /// Number of listeners registered for an event.
    pub fn listener_count(&self, event: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Invoke every listener for `event`. Returns how many were called.
    ///
    /// Callbacks run outside the table lock, so they may register or remove
    /// listeners themselves.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let callbacks: Vec<EventCallback> = match self.events.lock().unwrap().get(event) {
            Some(entries) => entries.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return 0,
        };
        for callback in &callbacks {
            callback(payload);
        }
        callbacks.len()
    }

    /// Invoke every binary listener for `channel`. Returns how many were called.
    pub fn dispatch_binary(&self, channel: &str, data: &[u8]) -> usize {
        let callbacks: Vec<BinaryCallback> = match self.binary.lock().unwrap().get(channel) {
            Some(entries) => entries.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return 0,
        };
        for callback in &callbacks {
            callback(data);
        }
        callbacks.len()
    }
}

fn remove<C>(table: &Table<C>, name: &str, id: Option<ListenerId>) -> usize {
    let mut table = table.lock().unwrap();
    let Some(entries) = table.get_mut(name) else {
        return 0;
    };
    let before = entries.len();
    match id {
        Some(id) => entries.retain(|(existing, _)| *existing != id),
        None => entries.clear(),
    }
    let removed = before - entries.len();
    if entries.is_empty() {
        table.remove(name);
    }
    removed
}
