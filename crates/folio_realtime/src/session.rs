//! Document sessions and the session cache.
//!
//! A [`DocumentSession`] ties one page's [`ReplicatedDocument`] to the shared
//! [`EventChannel`]: it joins the page room, routes presence events into the
//! [`PresenceAggregator`], exchanges content sync messages on the page's
//! binary sub-channel, and throttles the local cursor.
//!
//! Sessions are shared through a [`SessionCache`]. Every consumer of a page
//! calls [`SessionCache::get`] and later [`SessionCache::release`]; the
//! session is torn down when the last consumer releases it. Teardown cancels
//! the throttle timer and the staleness sweeper, detaches the replicas,
//! removes every page-scoped listener, and leaves the room (dropping any
//! still-queued messages for the page), all under the cache lock so a
//! concurrent `get` never observes a half-destroyed session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::channel::EventChannel;
use crate::config::RealtimeConfig;
use crate::doc::{ObserverId, ReplicatedDocument, UpdateOrigin};
use crate::error::Result;
use crate::listeners::ListenerId;
use crate::presence::{PresenceAggregator, PresenceEntry};
use crate::protocol::{Cursor, CursorUpdatePayload, SyncMessage, doc_channel, events};
use crate::throttle::CursorThrottle;

/// Inbound events routed to the presence aggregator.
const PRESENCE_EVENTS: [&str; 4] = [
    events::USER_JOINED,
    events::USER_LEFT,
    events::CURSOR_UPDATE,
    events::PRESENCE_UPDATE,
];

/// One open page.
pub struct DocumentSession {
    page_id: String,
    sync_channel: String,
    channel: EventChannel,
    document: Arc<ReplicatedDocument>,
    presence: Arc<PresenceAggregator>,
    throttle: CursorThrottle,
    listeners: Mutex<Vec<(&'static str, ListenerId)>>,
    sync_listener: Mutex<Option<ListenerId>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DocumentSession {
    /// Open a session for `page_id` on `channel`.
    ///
    /// Must be called from within a tokio runtime.
    fn open(channel: &EventChannel, page_id: &str, config: &RealtimeConfig) -> Self {
        log::info!("[DocumentSession] Opening page {}", page_id);

        let document = Arc::new(ReplicatedDocument::new(page_id));
        let presence = Arc::new(PresenceAggregator::new(
            config.user.clone(),
            Arc::clone(&document),
            &config.presence,
        ));
        if let Err(e) = presence.touch_local(Utc::now()) {
            log::warn!("[DocumentSession] Failed to write own presence: {}", e);
        }

        let sync_channel = doc_channel(page_id);

        // Local content edits go out as y-sync Update messages.
        {
            let channel = channel.clone();
            let sync_channel = sync_channel.clone();
            let result = document.content().set_sync_callback(Arc::new(move |update| {
                channel.emit_binary(&sync_channel, SyncMessage::Update(update.to_vec()).encode());
            }));
            if let Err(e) = result {
                log::error!("[DocumentSession] Failed to observe content for {}: {}", page_id, e);
            }
        }

        let mut listeners = Vec::with_capacity(PRESENCE_EVENTS.len() + 1);
        for event in PRESENCE_EVENTS {
            let presence = Arc::clone(&presence);
            let id = channel.on(event, move |payload| {
                presence.handle_event(event, payload);
            });
            listeners.push((event, id));
        }

        // Every (re)connect restarts the content handshake.
        {
            let channel_handle = channel.clone();
            let document = Arc::clone(&document);
            let sync_channel = sync_channel.clone();
            let id = channel.on(events::CONNECT, move |_| {
                send_step1(&channel_handle, &sync_channel, &document);
            });
            listeners.push((events::CONNECT, id));
        }

        let sync_listener = {
            let channel_handle = channel.clone();
            let document = Arc::clone(&document);
            let reply_channel = sync_channel.clone();
            channel.on_binary(&sync_channel, move |data| {
                handle_sync_message(&channel_handle, &reply_channel, &document, data);
            })
        };

        channel.join_room(page_id);
        if channel.is_connected() {
            send_step1(channel, &sync_channel, &document);
        }

        let throttle = {
            let channel = channel.clone();
            let page_id = page_id.to_string();
            let user = config.user.clone();
            CursorThrottle::new(
                config.throttle.interval,
                Arc::new(move |cursor| {
                    let payload = CursorUpdatePayload {
                        page_id: page_id.clone(),
                        user_id: Some(user.id.clone()),
                        user_name: Some(user.name.clone()),
                        cursor,
                    };
                    match serde_json::to_value(&payload) {
                        Ok(value) => channel.emit(events::CURSOR_UPDATE, value),
                        Err(e) => log::warn!("[DocumentSession] Failed to encode cursor: {}", e),
                    }
                }),
            )
        };

        let sweeper = config.presence.stale_after.map(|_| {
            let presence = Arc::clone(&presence);
            let period = config
                .presence
                .sweep_interval
                .max(std::time::Duration::from_millis(1));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await; // Consume first immediate tick
                loop {
                    interval.tick().await;
                    presence.evict_stale(Utc::now());
                }
            })
        });

        Self {
            page_id: page_id.to_string(),
            sync_channel,
            channel: channel.clone(),
            document,
            presence,
            throttle,
            listeners: Mutex::new(listeners),
            sync_listener: Mutex::new(Some(sync_listener)),
            sweeper: Mutex::new(sweeper),
            closed: AtomicBool::new(false),
        }
    }

    /// Page id.
    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    /// The page's replicated document.
    pub fn document(&self) -> &Arc<ReplicatedDocument> {
        &self.document
    }

    /// The page's presence aggregator.
    pub fn presence(&self) -> &Arc<PresenceAggregator> {
        &self.presence
    }

    /// Set a content entry and broadcast the change.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.document.content().set(key, value)
    }

    /// Read a content entry.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.document.content().get(key)
    }

    /// Remove a content entry and broadcast the change.
    pub fn remove(&self, key: &str) -> bool {
        self.document.content().remove(key)
    }

    /// Publish the local cursor.
    ///
    /// The own presence entry is updated right away; the broadcast goes
    /// through the cursor throttle.
    pub fn submit_cursor(&self, cursor: Cursor) -> Result<()> {
        if self.is_closed() {
            log::debug!("[DocumentSession] Cursor submitted to closed page {}", self.page_id);
            return Ok(());
        }
        self.presence.update_local_cursor(cursor.clone())?;
        self.throttle.submit(cursor);
        Ok(())
    }

    /// Call `callback` with the full presence list whenever it changes.
    pub fn observe_presence<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(Vec<PresenceEntry>) + Send + Sync + 'static,
    {
        let presence: Weak<PresenceAggregator> = Arc::downgrade(&self.presence);
        self.document.presence().observe(move |_| {
            if let Some(presence) = presence.upgrade() {
                callback(presence.entries());
            }
        })
    }

    /// Remove a presence observer.
    pub fn unobserve_presence(&self, id: ObserverId) -> bool {
        self.document.presence().unobserve(id)
    }

    /// Call `callback` whenever the content map changes.
    pub fn observe_content<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(UpdateOrigin) + Send + Sync + 'static,
    {
        self.document.content().observe(callback)
    }

    /// Remove a content observer.
    pub fn unobserve_content(&self, id: ObserverId) -> bool {
        self.document.content().unobserve(id)
    }

    /// Whether the session was torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear the session down. Idempotent.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[DocumentSession] Closing page {}", self.page_id);

        // Stop every producer first so nothing is queued after the discard
        // in `leave_room`.
        self.throttle.cancel();
        if let Some(sweeper) = self.sweeper.lock().unwrap().take() {
            sweeper.abort();
        }
        self.document.detach();
        for (event, id) in self.listeners.lock().unwrap().drain(..) {
            self.channel.off(event, Some(id));
        }
        if let Some(id) = self.sync_listener.lock().unwrap().take() {
            self.channel.off_binary(&self.sync_channel, Some(id));
        }
        self.channel.leave_room(&self.page_id);
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("page_id", &self.page_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn send_step1(channel: &EventChannel, sync_channel: &str, document: &ReplicatedDocument) {
    let sv = document.content().encode_state_vector();
    channel.emit_binary(sync_channel, SyncMessage::SyncStep1(sv).encode());
}

fn handle_sync_message(
    channel: &EventChannel,
    sync_channel: &str,
    document: &ReplicatedDocument,
    data: &[u8],
) {
    match SyncMessage::decode(data) {
        Ok(Some(SyncMessage::SyncStep1(sv))) => match document.content().encode_diff(&sv) {
            Ok(diff) => {
                channel.emit_binary(sync_channel, SyncMessage::SyncStep2(diff).encode());
            }
            Err(e) => log::warn!("[DocumentSession] Bad state vector on {}: {}", sync_channel, e),
        },
        Ok(Some(SyncMessage::SyncStep2(update) | SyncMessage::Update(update))) => {
            if let Err(e) = document.content().apply_update(&update) {
                log::warn!("[DocumentSession] Dropping update on {}: {}", sync_channel, e);
            }
        }
        Ok(None) => {
            log::trace!("[DocumentSession] Ignoring non-sync message on {}", sync_channel);
        }
        Err(e) => log::warn!("[DocumentSession] Malformed sync message on {}: {}", sync_channel, e),
    }
}

struct SessionSlot {
    session: Arc<DocumentSession>,
    refs: usize,
}

/// Reference-counted cache of open document sessions.
///
/// Owned by the application context; every session it creates shares the
/// cache's [`EventChannel`].
pub struct SessionCache {
    channel: EventChannel,
    config: RealtimeConfig,
    sessions: Mutex<HashMap<String, SessionSlot>>,
}

impl SessionCache {
    /// Create an empty cache.
    pub fn new(channel: EventChannel, config: RealtimeConfig) -> Self {
        Self {
            channel,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The shared event channel.
    pub fn channel(&self) -> &EventChannel {
        &self.channel
    }

    /// Configuration used for new sessions.
    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// Get the session for `page_id`, opening it if needed.
    ///
    /// Each call must be balanced by one [`release`](Self::release).
    pub fn get(&self, page_id: &str) -> Arc<DocumentSession> {
        let mut sessions = self.sessions.lock().unwrap();
        let slot = sessions.entry(page_id.to_string()).or_insert_with(|| SessionSlot {
            session: Arc::new(DocumentSession::open(&self.channel, page_id, &self.config)),
            refs: 0,
        });
        slot.refs += 1;
        log::debug!("[SessionCache] {} now has {} consumers", page_id, slot.refs);
        Arc::clone(&slot.session)
    }

    /// Release one reference to `page_id`.
    ///
    /// Returns `true` if this was the last reference and the session was torn
    /// down.
    pub fn release(&self, page_id: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(slot) = sessions.get_mut(page_id) else {
            log::warn!("[SessionCache] Release of unknown page {}", page_id);
            return false;
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            return false;
        }
        if let Some(slot) = sessions.remove(page_id) {
            slot.session.close();
        }
        true
    }

    /// Number of consumers holding `page_id`.
    pub fn ref_count(&self, page_id: &str) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .get(page_id)
            .map_or(0, |slot| slot.refs)
    }

    /// Open page ids, sorted.
    pub fn page_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Whether no session is open.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }

    /// Tear down every session regardless of reference counts.
    pub fn shutdown(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        for (_, slot) in sessions.drain() {
            slot.session.close();
        }
    }
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("pages", &self.page_ids())
            .finish_non_exhaustive()
    }
}
