//! Presence aggregation.
//!
//! Turns inbound `user_joined` / `cursor_update` / `presence_update` /
//! `user_left` events into writes on a page's presence map. Each user has at
//! most one entry, keyed by user id, moving through
//! `Absent -> Present -> Stale -> Absent`.
//!
//! Entries are never replaced wholesale. Snapshots go through
//! [`PresenceEntry::merge`], so a cursor set just before a stale snapshot
//! arrives is kept.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::config::{LocalUser, PresenceConfig};
use crate::doc::ReplicatedDocument;
use crate::error::Result;
use crate::protocol::{
    Cursor, CursorUpdatePayload, PresenceEvent, PresenceUpdatePayload, UserJoinedPayload,
    UserLeftPayload,
};

/// Presence of one user on one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// User id; unique within a page.
    pub user_id: String,
    /// Display name.
    #[serde(default)]
    pub user_name: String,
    /// Email address.
    #[serde(default)]
    pub user_email: String,
    /// Last known cursor, if the user has moved it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    /// When this user was last heard from. Missing means "oldest".
    #[serde(default = "epoch", deserialize_with = "deserialize_last_seen")]
    pub last_seen: DateTime<Utc>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Accepts RFC 3339 strings or epoch milliseconds.
fn deserialize_last_seen<'de, D>(d: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(DateTime<Utc>),
        Null(()),
    }

    match Raw::deserialize(d)? {
        Raw::Millis(ms) => Ok(Utc.timestamp_millis_opt(ms).single().unwrap_or_else(epoch)),
        Raw::Text(dt) => Ok(dt),
        Raw::Null(()) => Ok(epoch()),
    }
}

impl PresenceEntry {
    /// A new entry with no cursor.
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        user_email: impl Into<String>,
        last_seen: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            user_email: user_email.into(),
            cursor: None,
            last_seen,
        }
    }

    /// Entry describing the local user.
    pub fn for_user(user: &LocalUser, last_seen: DateTime<Utc>) -> Self {
        Self::new(&user.id, &user.name, &user.email, last_seen)
    }

    /// Whether this entry carries a `last_seen` at all.
    pub fn has_last_seen(&self) -> bool {
        self.last_seen != epoch()
    }

    /// Field-level merge of two observations of the same user.
    ///
    /// Per field, the value from the entry with the newer `last_seen` wins;
    /// an empty value never erases a present one; equal timestamps fall back
    /// to comparing the values themselves. `last_seen` becomes the later of
    /// the two. The result does not depend on argument order, and merging an
    /// entry with itself returns it unchanged.
    pub fn merge(&self, other: &PresenceEntry) -> PresenceEntry {
        let (a, b) = (self.last_seen, other.last_seen);
        PresenceEntry {
            user_id: pick(&self.user_id, a, &other.user_id, b, String::is_empty, Ord::cmp),
            user_name: pick(&self.user_name, a, &other.user_name, b, String::is_empty, Ord::cmp),
            user_email: pick(
                &self.user_email,
                a,
                &other.user_email,
                b,
                String::is_empty,
                Ord::cmp,
            ),
            cursor: pick(&self.cursor, a, &other.cursor, b, Option::is_none, cmp_cursor),
            last_seen: a.max(b),
        }
    }
}

fn pick<T: Clone>(
    left: &T,
    left_seen: DateTime<Utc>,
    right: &T,
    right_seen: DateTime<Utc>,
    is_empty: impl Fn(&T) -> bool,
    cmp: impl Fn(&T, &T) -> Ordering,
) -> T {
    match (is_empty(left), is_empty(right)) {
        (_, true) => left.clone(),
        (true, false) => right.clone(),
        (false, false) => {
            let order = left_seen
                .cmp(&right_seen)
                .then_with(|| cmp(left, right));
            if order == Ordering::Less {
                right.clone()
            } else {
                left.clone()
            }
        }
    }
}

fn cmp_cursor(a: &Option<Cursor>, b: &Option<Cursor>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a
            .x
            .total_cmp(&b.x)
            .then_with(|| a.y.total_cmp(&b.y))
            .then_with(|| a.block_ref.cmp(&b.block_ref)),
        (a, b) => a.is_some().cmp(&b.is_some()),
    }
}

/// Where a user is in the presence lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    /// No entry.
    Absent,
    /// Entry refreshed within the staleness window.
    Present,
    /// Entry older than the staleness window; due for eviction.
    Stale,
}

/// Applies presence events to one page's presence map.
pub struct PresenceAggregator {
    page_id: String,
    local_user: LocalUser,
    document: Arc<ReplicatedDocument>,
    stale_after: Option<Duration>,
}

impl PresenceAggregator {
    /// Create an aggregator writing into `document`'s presence map.
    pub fn new(
        local_user: LocalUser,
        document: Arc<ReplicatedDocument>,
        config: &PresenceConfig,
    ) -> Self {
        Self {
            page_id: document.page_id().to_string(),
            local_user,
            document,
            stale_after: config.stale_after,
        }
    }

    /// Page this aggregator is scoped to.
    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    /// The local user.
    pub fn local_user(&self) -> &LocalUser {
        &self.local_user
    }

    /// Parse and apply a raw channel event.
    ///
    /// Malformed payloads are logged and dropped. Returns whether the
    /// presence map changed.
    pub fn handle_event(&self, event: &str, payload: &Value) -> bool {
        match PresenceEvent::parse(event, payload) {
            Ok(Some(parsed)) => self.apply(&parsed),
            Ok(None) => false,
            Err(e) => {
                log::warn!(
                    "[PresenceAggregator] Dropping malformed '{}' for page {}: {}",
                    event,
                    self.page_id,
                    e
                );
                false
            }
        }
    }

    /// Apply a parsed event at the current time.
    pub fn apply(&self, event: &PresenceEvent) -> bool {
        self.apply_at(event, Utc::now())
    }

    /// Apply a parsed event as if received at `now`.
    pub fn apply_at(&self, event: &PresenceEvent, now: DateTime<Utc>) -> bool {
        if event.page_id() != self.page_id {
            log::trace!(
                "[PresenceAggregator] Ignoring event for page {} (scoped to {})",
                event.page_id(),
                self.page_id
            );
            return false;
        }

        match event {
            PresenceEvent::Joined(payload) => self.on_joined(payload, now),
            PresenceEvent::Cursor(payload) => self.on_cursor(payload, now),
            PresenceEvent::Snapshot(payload) => self.on_snapshot(payload, now),
            PresenceEvent::Left(payload) => self.on_left(payload),
        }
    }

    fn on_joined(&self, payload: &UserJoinedPayload, now: DateTime<Utc>) -> bool {
        let user = &payload.user;
        if user.id.is_empty() {
            log::warn!("[PresenceAggregator] user_joined without user id, dropping");
            return false;
        }
        let incoming = PresenceEntry::new(&user.id, &user.name, &user.email, now);
        let next = match self.entry(&user.id) {
            Some(existing) => existing.merge(&incoming),
            None => {
                log::debug!("[PresenceAggregator] {} joined page {}", user.id, self.page_id);
                incoming
            }
        };
        self.write(next)
    }

    fn on_cursor(&self, payload: &CursorUpdatePayload, now: DateTime<Utc>) -> bool {
        let Some(user_id) = payload.user_id.as_deref().filter(|id| !id.is_empty()) else {
            log::debug!("[PresenceAggregator] cursor_update without user id, dropping");
            return false;
        };
        if user_id == self.local_user.id {
            // Our own cursor is written locally before it is broadcast.
            return false;
        }

        let mut next = self
            .entry(user_id)
            .unwrap_or_else(|| PresenceEntry::new(user_id, "", "", now));
        if let Some(name) = payload.user_name.as_deref().filter(|n| !n.is_empty()) {
            next.user_name = name.to_string();
        }
        next.cursor = Some(payload.cursor.clone());
        next.last_seen = next.last_seen.max(now);
        self.write(next)
    }

    fn on_snapshot(&self, payload: &PresenceUpdatePayload, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        for incoming in &payload.users {
            if incoming.user_id.is_empty() || incoming.user_id == self.local_user.id {
                continue;
            }
            let next = match self.entry(&incoming.user_id) {
                Some(existing) => existing.merge(incoming),
                None if !incoming.has_last_seen() => PresenceEntry {
                    last_seen: now,
                    ..incoming.clone()
                },
                None => incoming.clone(),
            };
            changed |= self.write(next);
        }
        changed
    }

    fn on_left(&self, payload: &UserLeftPayload) -> bool {
        let removed = self.document.presence().remove(&payload.user.id);
        if removed {
            log::debug!(
                "[PresenceAggregator] {} left page {}",
                payload.user.id,
                self.page_id
            );
        }
        removed
    }

    /// Write (or refresh) the local user's own entry.
    pub fn touch_local(&self, now: DateTime<Utc>) -> Result<PresenceEntry> {
        let incoming = PresenceEntry::for_user(&self.local_user, now);
        let next = match self.entry(&self.local_user.id) {
            Some(existing) => existing.merge(&incoming),
            None => incoming,
        };
        self.document.presence().set(&next.user_id, &next)?;
        Ok(next)
    }

    /// Write the local user's cursor into the presence map.
    ///
    /// Called before the cursor is broadcast so the local view never waits
    /// for an echo.
    pub fn update_local_cursor(&self, cursor: Cursor) -> Result<PresenceEntry> {
        let now = Utc::now();
        let mut next = self
            .entry(&self.local_user.id)
            .unwrap_or_else(|| PresenceEntry::for_user(&self.local_user, now));
        next.cursor = Some(cursor);
        next.last_seen = next.last_seen.max(now);
        self.document.presence().set(&next.user_id, &next)?;
        Ok(next)
    }

    /// Entry for one user.
    pub fn entry(&self, user_id: &str) -> Option<PresenceEntry> {
        self.document.presence().get_as(user_id)
    }

    /// All entries, sorted by user id.
    pub fn entries(&self) -> Vec<PresenceEntry> {
        self.document
            .presence()
            .entries()
            .into_iter()
            .filter_map(|(_, value)| serde_json::from_value(value).ok())
            .collect()
    }

    /// Entries of other users, sorted by user id.
    pub fn peers(&self) -> Vec<PresenceEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.user_id != self.local_user.id)
            .collect()
    }

    /// Lifecycle state of a user at `now`.
    pub fn state_of(&self, user_id: &str, now: DateTime<Utc>) -> PresenceState {
        match self.entry(user_id) {
            None => PresenceState::Absent,
            Some(entry) if user_id != self.local_user.id && self.is_stale(&entry, now) => {
                PresenceState::Stale
            }
            Some(_) => PresenceState::Present,
        }
    }

    fn is_stale(&self, entry: &PresenceEntry, now: DateTime<Utc>) -> bool {
        let Some(stale_after) = self.stale_after else {
            return false;
        };
        let Ok(stale_after) = chrono::Duration::from_std(stale_after) else {
            return false;
        };
        now.signed_duration_since(entry.last_seen) > stale_after
    }

    /// Remove other users' entries not refreshed within `stale_after`.
    ///
    /// Returns the evicted user ids. The local user is never evicted.
    pub fn evict_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = self
            .peers()
            .into_iter()
            .filter(|entry| self.is_stale(entry, now))
            .map(|entry| entry.user_id)
            .collect();
        for user_id in &stale {
            self.document.presence().remove(user_id);
            log::debug!(
                "[PresenceAggregator] Evicted stale user {} from page {}",
                user_id,
                self.page_id
            );
        }
        stale
    }

    fn write(&self, next: PresenceEntry) -> bool {
        if self.entry(&next.user_id).as_ref() == Some(&next) {
            return false;
        }
        match self.document.presence().set(&next.user_id, &next) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "[PresenceAggregator] Failed to write presence for {}: {}",
                    next.user_id,
                    e
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for PresenceAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceAggregator")
            .field("page_id", &self.page_id)
            .field("local_user", &self.local_user.id)
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UserRef;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn aggregator(page_id: &str) -> PresenceAggregator {
        let doc = Arc::new(ReplicatedDocument::new(page_id));
        PresenceAggregator::new(
            LocalUser::new("me", "Me", "me@example.com"),
            doc,
            &PresenceConfig {
                stale_after: Some(std::time::Duration::from_secs(30)),
                ..PresenceConfig::default()
            },
        )
    }

    fn joined(page_id: &str, id: &str, name: &str) -> PresenceEvent {
        PresenceEvent::Joined(UserJoinedPayload {
            page_id: page_id.to_string(),
            user: UserRef {
                id: id.to_string(),
                name: name.to_string(),
                email: format!("{}@example.com", id),
            },
        })
    }

    fn cursor(page_id: &str, id: &str, x: f64, y: f64) -> PresenceEvent {
        PresenceEvent::Cursor(CursorUpdatePayload {
            page_id: page_id.to_string(),
            user_id: Some(id.to_string()),
            user_name: None,
            cursor: Cursor::new(x, y),
        })
    }

    fn left(page_id: &str, id: &str) -> PresenceEvent {
        PresenceEvent::Left(UserLeftPayload {
            page_id: page_id.to_string(),
            user: UserRef {
                id: id.to_string(),
                name: String::new(),
                email: String::new(),
            },
        })
    }

    #[test]
    fn test_join_cursor_leave_sequence() {
        let presence = aggregator("p1");

        assert!(presence.apply_at(&joined("p1", "u2", "Bob"), at(0)));
        let entry = presence.entry("u2").unwrap();
        assert_eq!(entry.user_name, "Bob");
        assert_eq!(entry.cursor, None);
        assert_eq!(entry.last_seen, at(0));

        assert!(presence.apply_at(&cursor("p1", "u2", 10.0, 20.0), at(1)));
        let entry = presence.entry("u2").unwrap();
        assert_eq!(entry.cursor, Some(Cursor::new(10.0, 20.0)));
        assert_eq!(entry.user_name, "Bob");
        assert_eq!(entry.last_seen, at(1));

        assert!(presence.apply_at(&left("p1", "u2"), at(2)));
        assert_eq!(presence.entry("u2"), None);
        assert!(presence.entries().is_empty());
    }

    #[test]
    fn test_cursor_creates_entry() {
        let presence = aggregator("p1");
        assert!(presence.apply_at(&cursor("p1", "u3", 1.0, 2.0), at(0)));
        let entry = presence.entry("u3").unwrap();
        assert_eq!(entry.cursor, Some(Cursor::new(1.0, 2.0)));
    }

    #[test]
    fn test_local_cursor_echo_is_ignored() {
        let presence = aggregator("p1");
        presence.update_local_cursor(Cursor::new(5.0, 5.0)).unwrap();

        assert!(!presence.apply_at(&cursor("p1", "me", 99.0, 99.0), at(0)));
        assert_eq!(
            presence.entry("me").unwrap().cursor,
            Some(Cursor::new(5.0, 5.0))
        );
    }

    #[test]
    fn test_other_page_events_are_ignored() {
        let presence = aggregator("p1");
        assert!(!presence.apply_at(&joined("p2", "u2", "Bob"), at(0)));
        assert!(presence.entries().is_empty());
    }

    #[test]
    fn test_snapshot_does_not_erase_fresher_cursor() {
        let presence = aggregator("p1");
        presence.apply_at(&cursor("p1", "u2", 10.0, 20.0), at(5));

        let snapshot = PresenceEvent::Snapshot(PresenceUpdatePayload {
            page_id: "p1".to_string(),
            users: vec![PresenceEntry::new("u2", "Bob", "bob@example.com", at(1))],
        });
        assert!(presence.apply_at(&snapshot, at(6)));

        let entry = presence.entry("u2").unwrap();
        assert_eq!(entry.cursor, Some(Cursor::new(10.0, 20.0)));
        assert_eq!(entry.user_name, "Bob");
        assert_eq!(entry.last_seen, at(5));
    }

    #[test]
    fn test_snapshot_without_last_seen_is_stamped_now() {
        let presence = aggregator("p1");
        let payload = json!({
            "page_id": "p1",
            "users": [{ "user_id": "u4", "user_name": "Dee" }]
        });

        assert!(presence.handle_event("presence_update", &payload));
        let entry = presence.entry("u4").unwrap();
        assert!(entry.has_last_seen());
        assert_eq!(entry.user_name, "Dee");
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let presence = aggregator("p1");
        assert!(!presence.handle_event("user_joined", &json!({ "page_id": "p1" })));
        assert!(!presence.handle_event("cursor_update", &json!("garbage")));
        assert!(!presence.handle_event("unrelated", &json!({})));
        assert!(presence.entries().is_empty());
    }

    #[test]
    fn test_duplicate_join_is_idempotent() {
        let presence = aggregator("p1");
        assert!(presence.apply_at(&joined("p1", "u2", "Bob"), at(0)));
        assert!(!presence.apply_at(&joined("p1", "u2", "Bob"), at(0)));
        assert_eq!(presence.entries().len(), 1);
    }

    #[test]
    fn test_staleness_eviction_spares_local_user() {
        let presence = aggregator("p1");
        presence.touch_local(at(0)).unwrap();
        presence.apply_at(&joined("p1", "old", "Old"), at(0));
        presence.apply_at(&joined("p1", "fresh", "Fresh"), at(25));

        assert_eq!(presence.state_of("old", at(31)), PresenceState::Stale);
        assert_eq!(presence.state_of("fresh", at(31)), PresenceState::Present);
        assert_eq!(presence.state_of("me", at(31)), PresenceState::Present);

        let evicted = presence.evict_stale(at(31));
        assert_eq!(evicted, vec!["old".to_string()]);
        assert_eq!(presence.state_of("old", at(31)), PresenceState::Absent);
        assert!(presence.entry("me").is_some());
        assert!(presence.entry("fresh").is_some());
    }

    #[test]
    fn test_eviction_disabled_by_default() {
        let doc = Arc::new(ReplicatedDocument::new("p1"));
        let presence = PresenceAggregator::new(
            LocalUser::new("me", "Me", ""),
            doc,
            &PresenceConfig::default(),
        );
        presence.apply_at(&joined("p1", "u2", "Bob"), at(0));

        assert_eq!(presence.state_of("u2", at(10_000)), PresenceState::Present);
        assert!(presence.evict_stale(at(10_000)).is_empty());
    }

    #[test]
    fn test_last_seen_accepts_millis() {
        let entry: PresenceEntry =
            serde_json::from_value(json!({ "user_id": "u", "last_seen": 1_700_000_000_000i64 }))
                .unwrap();
        assert_eq!(entry.last_seen, at(0));

        let entry: PresenceEntry =
            serde_json::from_value(json!({ "user_id": "u", "last_seen": null })).unwrap();
        assert!(!entry.has_last_seen());
    }

    #[test]
    fn test_merge_keeps_present_fields() {
        let older = PresenceEntry {
            cursor: Some(Cursor::new(1.0, 1.0)),
            ..PresenceEntry::new("u", "Old Name", "u@example.com", at(0))
        };
        let newer = PresenceEntry::new("u", "New Name", "", at(1));

        let merged = older.merge(&newer);
        assert_eq!(merged.user_name, "New Name");
        assert_eq!(merged.user_email, "u@example.com");
        assert_eq!(merged.cursor, Some(Cursor::new(1.0, 1.0)));
        assert_eq!(merged.last_seen, at(1));
    }

    mod merge_properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_entry() -> impl Strategy<Value = PresenceEntry> {
            (
                prop::sample::select(vec!["", "Ann", "Bob"]),
                prop::sample::select(vec!["", "a@x.io", "b@x.io"]),
                prop::option::of((-100i32..100, -100i32..100, prop::option::of("[ab]"))),
                0i64..4,
            )
                .prop_map(|(name, email, cursor, seen)| PresenceEntry {
                    user_id: "u".to_string(),
                    user_name: name.to_string(),
                    user_email: email.to_string(),
                    cursor: cursor.map(|(x, y, block)| Cursor {
                        x: f64::from(x),
                        y: f64::from(y),
                        block_ref: block,
                    }),
                    last_seen: at(seen),
                })
        }

        proptest! {
            #[test]
            fn test_merge_idempotent(a in arb_entry()) {
                prop_assert_eq!(a.merge(&a), a.clone());
            }

            #[test]
            fn test_merge_commutative(a in arb_entry(), b in arb_entry()) {
                prop_assert_eq!(a.merge(&b), b.merge(&a));
            }

            #[test]
            fn test_merge_reapply_is_noop(a in arb_entry(), b in arb_entry()) {
                let once = a.merge(&b);
                prop_assert_eq!(once.merge(&b), once.clone());
            }
        }
    }
}
