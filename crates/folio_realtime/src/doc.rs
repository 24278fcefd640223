//! Replicated page documents.
//!
//! A [`ReplicatedDocument`] holds two independent [`ReplicatedMap`]s for one
//! page: the content map (block tree) and the presence map. Each map is its
//! own Y.Doc, so content sync traffic never carries presence state and vice
//! versa.
//!
//! Values are stored as JSON strings in a root Y.Map. Merging is entirely
//! yrs's: concurrent writes to different keys never conflict, and concurrent
//! writes to the same key resolve by the document's causal ordering, so every
//! replica converges regardless of delivery order or duplication.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use yrs::{
    Doc, Map, Origin, ReadTxn, Transact, Update, updates::decoder::Decode,
    updates::encoder::Encode,
};

use crate::error::{RealtimeError, Result};

/// Name of the root Y.Map inside each document.
const ROOT_MAP_NAME: &str = "entries";

/// Transaction origin attached to updates applied from other replicas.
const REMOTE_ORIGIN: &str = "folio:remote";

/// Callback receiving the encoded update produced by a local mutation.
pub type SyncCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback notified after the map changed.
pub type ChangeCallback = Arc<dyn Fn(UpdateOrigin) + Send + Sync>;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Mutation made through this replica.
    Local,
    /// Update received from another replica.
    Remote,
}

/// Handle for a change observer registered with [`ReplicatedMap::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// A conflict-free replicated key/value map backed by a Y.Doc.
pub struct ReplicatedMap {
    name: String,
    doc: Doc,
    map: yrs::MapRef,
    /// With yrs "sync" feature enabled, Subscription is Send+Sync.
    _update_subscription: RwLock<Option<yrs::Subscription>>,
    observers: RwLock<Vec<(ObserverId, ChangeCallback)>>,
    next_observer: AtomicU64,
}

impl ReplicatedMap {
    /// Create an empty map. `name` is only used for logging.
    pub fn new(name: impl Into<String>) -> Self {
        let doc = Doc::new();
        let map = doc.get_or_insert_map(ROOT_MAP_NAME);
        Self {
            name: name.into(),
            doc,
            map,
            _update_subscription: RwLock::new(None),
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(0),
        }
    }

    /// Name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the JSON value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        let raw = {
            let txn = self.doc.transact();
            self.map
                .get(&txn, key)
                .and_then(|v| v.cast::<String>().ok())
        }?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(
                    "[ReplicatedMap] '{}' holds non-JSON value at '{}': {}",
                    self.name,
                    key,
                    e
                );
                None
            }
        }
    }

    /// Get the value under `key` deserialized as `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Set `key` to `value`. Local mutation: notifies the sync callback.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        {
            let mut txn = self.doc.transact_mut();
            self.map.insert(&mut txn, key, encoded);
        }
        self.notify(UpdateOrigin::Local);
        Ok(())
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        let removed = {
            let mut txn = self.doc.transact_mut();
            self.map.remove(&mut txn, key).is_some()
        };
        if removed {
            self.notify(UpdateOrigin::Local);
        }
        removed
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        let txn = self.doc.transact();
        self.map.contains_key(&txn, key)
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let txn = self.doc.transact();
        let mut keys: Vec<String> = self.map.keys(&txn).map(String::from).collect();
        keys.sort();
        keys
    }

    /// All entries as JSON values, sorted by key. Non-JSON values are skipped.
    pub fn entries(&self) -> Vec<(String, Value)> {
        let txn = self.doc.transact();
        let mut entries: Vec<(String, Value)> = self
            .map
            .iter(&txn)
            .filter_map(|(key, value)| {
                let raw = value.cast::<String>().ok()?;
                let value = serde_json::from_str(&raw).ok()?;
                Some((key.to_string(), value))
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        let txn = self.doc.transact();
        self.map.len(&txn) as usize
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ==================== Sync Operations ====================

    /// Encode the current state vector for sync.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full state as an update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&Default::default())
    }

    /// Encode the diff between current state and a remote state vector.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = yrs::StateVector::decode_v1(remote_state_vector)
            .map_err(|e| RealtimeError::Crdt(format!("Failed to decode state vector: {}", e)))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an update from a remote replica.
    ///
    /// Idempotent: applying the same update again leaves the state unchanged.
    /// The sync callback does not fire for remote updates.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| RealtimeError::Crdt(format!("Failed to decode update: {}", e)))?;

        {
            let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
            txn.apply_update(decoded)
                .map_err(|e| RealtimeError::Crdt(format!("Failed to apply update: {}", e)))?;
        }
        self.notify(UpdateOrigin::Remote);
        Ok(())
    }

    /// Register the callback that broadcasts local updates.
    ///
    /// Only one sync callback can be registered; later calls are ignored.
    pub fn set_sync_callback(&self, callback: SyncCallback) -> Result<()> {
        if self._update_subscription.read().unwrap().is_some() {
            log::trace!(
                "[ReplicatedMap] set_sync_callback: observer already registered for '{}', skipping",
                self.name
            );
            return Ok(());
        }

        let name = self.name.clone();
        let remote = Origin::from(REMOTE_ORIGIN);
        let subscription = self
            .doc
            .observe_update_v1(move |txn, event| {
                // Remote updates are never echoed back.
                if txn.origin() == Some(&remote) {
                    return;
                }
                log::trace!(
                    "[ReplicatedMap] Local update for '{}', update_len={}",
                    name,
                    event.update.len()
                );
                callback(&event.update);
            })
            .map_err(|e| RealtimeError::Crdt(format!("Failed to observe updates: {}", e)))?;

        *self._update_subscription.write().unwrap() = Some(subscription);
        Ok(())
    }

    /// Drop the sync callback.
    pub fn clear_sync_callback(&self) {
        self._update_subscription.write().unwrap().take();
    }

    // ==================== Observers ====================

    /// Observe changes to the map.
    ///
    /// Callbacks run after the transaction committed, so they may read the map.
    pub fn observe<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(UpdateOrigin) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.write().unwrap().push((id, Arc::new(callback)));
        id
    }

    /// Remove a change observer. Returns whether it was registered.
    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write().unwrap();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Remove every change observer.
    pub fn clear_observers(&self) {
        self.observers.write().unwrap().clear();
    }

    fn notify(&self, origin: UpdateOrigin) {
        let callbacks: Vec<ChangeCallback> = self
            .observers
            .read()
            .unwrap()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(origin);
        }
    }
}

impl std::fmt::Debug for ReplicatedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedMap")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Content and presence replicas for one page.
#[derive(Debug)]
pub struct ReplicatedDocument {
    page_id: String,
    content: ReplicatedMap,
    presence: ReplicatedMap,
}

impl ReplicatedDocument {
    /// Create an empty document for `page_id`.
    pub fn new(page_id: impl Into<String>) -> Self {
        let page_id = page_id.into();
        Self {
            content: ReplicatedMap::new(format!("{}/content", page_id)),
            presence: ReplicatedMap::new(format!("{}/presence", page_id)),
            page_id,
        }
    }

    /// Page this document belongs to.
    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    /// Content map (block tree).
    pub fn content(&self) -> &ReplicatedMap {
        &self.content
    }

    /// Presence map, keyed by user id.
    pub fn presence(&self) -> &ReplicatedMap {
        &self.presence
    }

    /// Detach every callback from both maps.
    pub fn detach(&self) {
        self.content.clear_sync_callback();
        self.content.clear_observers();
        self.presence.clear_sync_callback();
        self.presence.clear_observers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Exchange full state both ways.
    fn sync_pair(a: &ReplicatedMap, b: &ReplicatedMap) {
        let a_to_b = a.encode_diff(&b.encode_state_vector()).unwrap();
        let b_to_a = b.encode_diff(&a.encode_state_vector()).unwrap();
        b.apply_update(&a_to_b).unwrap();
        a.apply_update(&b_to_a).unwrap();
    }

    #[test]
    fn test_set_get_remove() {
        let map = ReplicatedMap::new("page/content");
        assert!(map.is_empty());

        map.set("block-1", &json!({"type": "paragraph", "text": "hi"}))
            .unwrap();
        assert_eq!(
            map.get("block-1"),
            Some(json!({"type": "paragraph", "text": "hi"}))
        );
        assert_eq!(map.keys(), vec!["block-1"]);

        assert!(map.remove("block-1"));
        assert!(!map.remove("block-1"));
        assert_eq!(map.get("block-1"), None);
    }

    #[test]
    fn test_get_as_typed() {
        let map = ReplicatedMap::new("m");
        map.set("count", &3u32).unwrap();
        assert_eq!(map.get_as::<u32>("count"), Some(3));
        assert_eq!(map.get_as::<String>("count"), None);
    }

    #[test]
    fn test_disjoint_keys_converge() {
        let a = ReplicatedMap::new("a");
        let b = ReplicatedMap::new("b");
        a.set("x", &1).unwrap();
        b.set("y", &2).unwrap();

        sync_pair(&a, &b);

        assert_eq!(a.entries(), vec![("x".to_string(), json!(1)), ("y".to_string(), json!(2))]);
        assert_eq!(a.entries(), b.entries());
    }

    #[test]
    fn test_same_key_converges_deterministically() {
        let a = ReplicatedMap::new("a");
        let b = ReplicatedMap::new("b");
        a.set("title", &"from a").unwrap();
        b.set("title", &"from b").unwrap();

        sync_pair(&a, &b);

        assert_eq!(a.get("title"), b.get("title"));
        assert!(a.get("title").is_some());
    }

    #[test]
    fn test_apply_update_is_idempotent() {
        let a = ReplicatedMap::new("a");
        let b = ReplicatedMap::new("b");
        a.set("k", &"v").unwrap();
        let update = a.encode_state_as_update();

        b.apply_update(&update).unwrap();
        let once = b.encode_state_vector();
        b.apply_update(&update).unwrap();

        assert_eq!(b.encode_state_vector(), once);
        assert_eq!(b.entries(), vec![("k".to_string(), json!("v"))]);
    }

    #[test]
    fn test_updates_commute() {
        let a = ReplicatedMap::new("a");
        let b = ReplicatedMap::new("b");
        a.set("one", &1).unwrap();
        b.set("two", &2).unwrap();
        let p1 = a.encode_state_as_update();
        let p2 = b.encode_state_as_update();

        let left = ReplicatedMap::new("left");
        left.apply_update(&p1).unwrap();
        left.apply_update(&p2).unwrap();

        let right = ReplicatedMap::new("right");
        right.apply_update(&p2).unwrap();
        right.apply_update(&p1).unwrap();

        assert_eq!(left.entries(), right.entries());
    }

    #[test]
    fn test_sync_callback_only_fires_for_local_updates() {
        let a = ReplicatedMap::new("a");
        let b = ReplicatedMap::new("b");
        let updates = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let captured = Arc::clone(&updates);
        b.set_sync_callback(Arc::new(move |update| {
            captured.lock().unwrap().push(update.to_vec());
        }))
        .unwrap();

        a.set("remote", &true).unwrap();
        b.apply_update(&a.encode_state_as_update()).unwrap();
        assert!(updates.lock().unwrap().is_empty());

        b.set("local", &true).unwrap();
        let sent = updates.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);

        // The broadcast patch carries the local change to other replicas.
        a.apply_update(&sent[0]).unwrap();
        assert_eq!(a.get("local"), Some(json!(true)));
    }

    #[test]
    fn test_local_edits_broadcast_while_remote_updates_apply() {
        let map = ReplicatedMap::new("shared");
        let sent = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sent);
        map.set_sync_callback(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        let remote_updates: Vec<Vec<u8>> = (0..200)
            .map(|i| {
                let other = ReplicatedMap::new("other");
                other.set(&format!("remote-{}", i), &i).unwrap();
                other.encode_state_as_update()
            })
            .collect();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for update in &remote_updates {
                    map.apply_update(update).unwrap();
                }
            });
            scope.spawn(|| {
                for i in 0..200 {
                    map.set(&format!("local-{}", i), &i).unwrap();
                }
            });
        });

        assert_eq!(sent.load(Ordering::SeqCst), 200);
        assert_eq!(map.len(), 400);
    }

    #[test]
    fn test_observer_receives_origin() {
        let map = ReplicatedMap::new("m");
        let origins = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&origins);
        let id = map.observe(move |origin| captured.lock().unwrap().push(origin));

        map.set("k", &1).unwrap();
        let other = ReplicatedMap::new("other");
        other.set("j", &2).unwrap();
        map.apply_update(&other.encode_state_as_update()).unwrap();

        assert_eq!(
            *origins.lock().unwrap(),
            vec![UpdateOrigin::Local, UpdateOrigin::Remote]
        );

        assert!(map.unobserve(id));
        map.set("k", &3).unwrap();
        assert_eq!(origins.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_update_is_rejected() {
        let map = ReplicatedMap::new("m");
        assert!(matches!(
            map.apply_update(&[0xFF, 0xFF, 0xFF]),
            Err(RealtimeError::Crdt(_))
        ));
        assert!(map.is_empty());
    }

    #[test]
    fn test_document_maps_are_independent() {
        let doc = ReplicatedDocument::new("page-1");
        doc.content().set("block", &"text").unwrap();
        doc.presence().set("user-1", &json!({"user_id": "user-1"})).unwrap();

        assert_eq!(doc.content().keys(), vec!["block"]);
        assert_eq!(doc.presence().keys(), vec!["user-1"]);
        assert_eq!(doc.page_id(), "page-1");
    }
}
