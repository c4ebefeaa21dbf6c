//! Persisted outbox: pending outgoing messages grouped by conversation key.
//!
//! [`OutboxMap`] is an immutable snapshot. `add`, `update` and `remove`
//! return a new map, so callers detect changes with `==`. Loading never
//! fails on bad data: malformed keys and entries are dropped by
//! [`OutboxMap::sanitize`].

use std::collections::BTreeMap;

use courier_shared::constants::{
    MAX_OUTBOX_CONVERSATIONS, MAX_OUTBOX_PER_CONVERSATION, MAX_TEXT_CHARS, OUTBOX_STORAGE_PREFIX,
    OUTBOX_VERSION,
};
use courier_shared::{ConversationKey, ConversationKind, LocalId, PeerId, RoomId, Target};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::kv::{user_key, KvStore};
use crate::models::{OutboxEntry, OutboxStatus};

const MAX_ATTEMPTS: u32 = 999;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxMap {
    entries: BTreeMap<ConversationKey, Vec<OutboxEntry>>,
}

#[derive(Serialize)]
struct OutboxDocument<'a> {
    v: u64,
    entries: &'a BTreeMap<ConversationKey, Vec<OutboxEntry>>,
}

impl OutboxMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from untrusted JSON.
    ///
    /// Accepts either the stored document (`{"entries": {...}}`) or the bare
    /// key -> entries object. Entries sharing a `local_id` collapse into the
    /// first one; a later duplicate still contributes `schedule_at`,
    /// `when_online` and `silent` when it sets them.
    pub fn sanitize(raw: &Value) -> Self {
        let source = match raw.get("entries") {
            Some(inner) => inner,
            None => raw,
        };
        let Some(obj) = source.as_object() else {
            return Self::default();
        };

        let mut entries = BTreeMap::new();
        for (raw_key, raw_list) in obj {
            let Some(key) = ConversationKey::parse(raw_key) else {
                continue;
            };
            let Some(items) = raw_list.as_array() else {
                continue;
            };

            let mut list: Vec<OutboxEntry> = Vec::new();
            for item in items {
                let Some(entry) = entry_from_value(&key, item) else {
                    continue;
                };
                match list.iter_mut().find(|e| e.local_id == entry.local_id) {
                    Some(first) => merge_mutable_fields(first, &entry),
                    None => list.push(entry),
                }
            }

            if !list.is_empty() {
                entries.insert(key, list);
            }
        }

        Self::with_limits(entries)
    }

    /// Decode stored bytes. Corrupt or foreign documents yield an empty map.
    pub fn parse(bytes: &[u8]) -> Self {
        let value: Value = match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable outbox document");
                return Self::default();
            }
        };
        match value.get("v").map(Value::as_u64) {
            None | Some(Some(OUTBOX_VERSION)) => Self::sanitize(&value),
            Some(other) => {
                tracing::warn!(version = ?other, "discarding outbox document of unknown version");
                Self::default()
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let doc = OutboxDocument {
            v: OUTBOX_VERSION,
            entries: &self.entries,
        };
        Ok(serde_json::to_vec(&doc)?)
    }

    /// Append `entry` under `key`. No-op when the entry is invalid for the
    /// key or its `local_id` is already queued there.
    pub fn add(&self, key: &ConversationKey, entry: OutboxEntry) -> Self {
        let Some(entry) = normalize_entry(key, entry) else {
            return self.clone();
        };
        if self.find(key, &entry.local_id).is_some() {
            return self.clone();
        }

        let mut entries = self.entries.clone();
        entries.entry(key.clone()).or_default().push(entry);
        Self::with_limits(entries)
    }

    /// Apply `f` to the entry with `local_id`. No-op when it is absent or
    /// when `f` leaves it invalid. The `local_id` cannot be changed.
    pub fn update<F>(&self, key: &ConversationKey, local_id: &LocalId, f: F) -> Self
    where
        F: FnOnce(&mut OutboxEntry),
    {
        let Some(list) = self.entries.get(key) else {
            return self.clone();
        };
        let Some(pos) = list.iter().position(|e| &e.local_id == local_id) else {
            return self.clone();
        };

        let mut changed = list[pos].clone();
        f(&mut changed);
        changed.local_id = local_id.clone();
        let Some(changed) = normalize_entry(key, changed) else {
            return self.clone();
        };

        let mut entries = self.entries.clone();
        if let Some(list) = entries.get_mut(key) {
            list[pos] = changed;
            list.sort_by_key(|e| e.ts);
        }
        Self { entries }
    }

    /// Remove the entry with `local_id`; the key disappears with its last
    /// entry.
    pub fn remove(&self, key: &ConversationKey, local_id: &LocalId) -> Self {
        if self.find(key, local_id).is_none() {
            return self.clone();
        }

        let mut entries = self.entries.clone();
        if let Some(list) = entries.get_mut(key) {
            list.retain(|e| &e.local_id != local_id);
            if list.is_empty() {
                entries.remove(key);
            }
        }
        Self { entries }
    }

    pub fn get(&self, key: &ConversationKey) -> Option<&[OutboxEntry]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn find(&self, key: &ConversationKey, local_id: &LocalId) -> Option<&OutboxEntry> {
        self.entries
            .get(key)?
            .iter()
            .find(|e| &e.local_id == local_id)
    }

    /// Find an entry by `local_id` in any conversation.
    pub fn locate(&self, local_id: &LocalId) -> Option<(&ConversationKey, &OutboxEntry)> {
        self.entries.iter().find_map(|(key, list)| {
            list.iter()
                .find(|e| &e.local_id == local_id)
                .map(|entry| (key, entry))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConversationKey, &[OutboxEntry])> {
        self.entries.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn contains_key(&self, key: &ConversationKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of entries across all conversations.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    fn with_limits(mut entries: BTreeMap<ConversationKey, Vec<OutboxEntry>>) -> Self {
        for list in entries.values_mut() {
            list.sort_by_key(|e| e.ts);
            if list.len() > MAX_OUTBOX_PER_CONVERSATION {
                let excess = list.len() - MAX_OUTBOX_PER_CONVERSATION;
                list.drain(..excess);
            }
        }

        if entries.len() > MAX_OUTBOX_CONVERSATIONS {
            let mut by_activity: Vec<(i64, ConversationKey)> = entries
                .iter()
                .map(|(key, list)| (list.last().map_or(0, |e| e.ts), key.clone()))
                .collect();
            by_activity.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, key) in by_activity.into_iter().skip(MAX_OUTBOX_CONVERSATIONS) {
                entries.remove(&key);
            }
        }

        Self { entries }
    }
}

/// Load the outbox of `user`. A missing or unreadable document yields an
/// empty map; only store failures are errors.
pub fn load_outbox(kv: &dyn KvStore, user: &str) -> Result<OutboxMap> {
    let key = user_key(OUTBOX_STORAGE_PREFIX, user).ok_or(StoreError::MissingUser)?;
    Ok(kv
        .get(&key)?
        .map(|bytes| OutboxMap::parse(&bytes))
        .unwrap_or_default())
}

/// Persist the outbox of `user`. An empty map deletes the document.
pub fn save_outbox(kv: &dyn KvStore, user: &str, outbox: &OutboxMap) -> Result<()> {
    let key = user_key(OUTBOX_STORAGE_PREFIX, user).ok_or(StoreError::MissingUser)?;
    if outbox.is_empty() {
        return kv.delete(&key);
    }
    kv.put(&key, &outbox.to_bytes()?)
}

/// Normalize text (CRLF to LF, length cap). `None` for blank text.
pub fn normalize_text(text: &str) -> Option<String> {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    if text.trim().is_empty() {
        return None;
    }
    match text.char_indices().nth(MAX_TEXT_CHARS) {
        Some((cut, _)) => Some(text[..cut].to_string()),
        None => Some(text),
    }
}

fn normalize_entry(key: &ConversationKey, mut entry: OutboxEntry) -> Option<OutboxEntry> {
    if entry.ts <= 0 || entry.target.conversation_key() != *key {
        return None;
    }
    entry.text = normalize_text(&entry.text)?;
    entry.attempts = entry.attempts.min(MAX_ATTEMPTS);
    entry.last_attempt_at = entry.last_attempt_at.filter(|t| *t > 0);
    entry.schedule_at = entry.schedule_at.filter(|t| *t > 0);
    Some(entry)
}

fn entry_from_value(key: &ConversationKey, raw: &Value) -> Option<OutboxEntry> {
    let obj = raw.as_object()?;

    let local_id = LocalId::parse(obj.get("local_id")?.as_str()?)?;
    let text = obj.get("text")?.as_str()?;
    let ts = positive_int(obj.get("ts"))?;

    let target = match key.kind() {
        ConversationKind::Direct => Target::Peer(PeerId::new(obj.get("to")?.as_str()?.trim())),
        ConversationKind::Room => Target::Room(RoomId::new(obj.get("room")?.as_str()?.trim())),
    };

    let status = obj
        .get("status")
        .and_then(Value::as_str)
        .and_then(OutboxStatus::parse)
        .unwrap_or_default();
    let attempts = obj
        .get("attempts")
        .and_then(Value::as_f64)
        .filter(|n| n.is_finite())
        .map_or(0, |n| n.clamp(0.0, f64::from(MAX_ATTEMPTS)) as u32);

    let mut entry = OutboxEntry::new(local_id, target, text, ts);
    entry.status = status;
    entry.attempts = attempts;
    entry.last_attempt_at = positive_int(obj.get("last_attempt_at"));
    entry.schedule_at = positive_int(obj.get("schedule_at"));
    entry.when_online = obj.get("when_online").and_then(Value::as_bool) == Some(true);
    entry.silent = obj.get("silent").and_then(Value::as_bool) == Some(true);

    normalize_entry(key, entry)
}

fn merge_mutable_fields(first: &mut OutboxEntry, later: &OutboxEntry) {
    if later.schedule_at.is_some() {
        first.schedule_at = later.schedule_at;
    }
    if later.when_online {
        first.when_online = true;
    }
    if later.silent {
        first.silent = true;
    }
}

fn positive_int(value: Option<&Value>) -> Option<i64> {
    let value = value?;
    if let Some(n) = value.as_i64() {
        return (n > 0).then_some(n);
    }
    let n = value.as_f64()?;
    (n.is_finite() && n >= 1.0).then(|| n.trunc() as i64)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::kv::MemoryKv;

    fn dm(peer: &str) -> ConversationKey {
        ConversationKey::dm(&PeerId::from(peer))
    }

    fn lid(s: &str) -> LocalId {
        LocalId::parse(s).unwrap()
    }

    fn entry(id: &str, peer: &str, ts: i64) -> OutboxEntry {
        OutboxEntry::new(lid(id), Target::Peer(PeerId::from(peer)), format!("msg {id}"), ts)
    }

    #[test]
    fn sanitize_dedups_by_local_id() {
        let raw = json!({
            "dm:bob": [
                {"local_id": "a", "ts": 200, "text": "first", "to": "bob"},
                {"local_id": "a", "ts": 100, "text": "second", "to": "bob", "schedule_at": 5000, "silent": true},
                {"local_id": "b", "ts": 150, "text": "other", "to": "bob"}
            ]
        });
        let map = OutboxMap::sanitize(&raw);
        let list = map.get(&dm("bob")).unwrap();

        assert_eq!(list.len(), 2);
        assert_eq!(list[0].local_id, lid("b"));
        let a = &list[1];
        assert_eq!(a.text, "first");
        assert_eq!(a.ts, 200);
        assert_eq!(a.schedule_at, Some(5000));
        assert!(a.silent);
    }

    #[test]
    fn sanitize_drops_malformed() {
        let raw = json!({
            "entries": {
                "bogus": [{"local_id": "x", "ts": 1, "text": "t", "to": "bob"}],
                "dm:bob": [
                    {"local_id": "a", "ts": 1, "text": "   ", "to": "bob"},
                    {"local_id": "b", "ts": -5, "text": "t", "to": "bob"},
                    {"local_id": "c", "ts": 1, "text": "t"},
                    {"local_id": "d", "ts": 1, "text": "t", "to": "carol"},
                    "garbage",
                    {"local_id": "e", "ts": 3.7, "text": "a\r\nb", "to": "bob", "attempts": 5000, "status": "weird"}
                ],
                "room:r1": []
            }
        });
        let map = OutboxMap::sanitize(&raw);

        assert_eq!(map.len(), 1);
        let e = &map.get(&dm("bob")).unwrap()[0];
        assert_eq!(e.local_id, lid("e"));
        assert_eq!(e.ts, 3);
        assert_eq!(e.text, "a\nb");
        assert_eq!(e.attempts, 999);
        assert_eq!(e.status, OutboxStatus::Queued);
        assert!(!map.contains_key(&ConversationKey::parse("room:r1").unwrap()));
    }

    #[test]
    fn sanitize_tolerates_garbage() {
        assert!(OutboxMap::sanitize(&json!(null)).is_empty());
        assert!(OutboxMap::sanitize(&json!([1, 2])).is_empty());
        assert!(OutboxMap::parse(b"{not json").is_empty());
        assert!(OutboxMap::parse(br#"{"v":9,"entries":{}}"#).is_empty());
    }

    #[test]
    fn add_keeps_ts_order_and_ignores_duplicates() {
        let key = dm("bob");
        let map = OutboxMap::new()
            .add(&key, entry("b", "bob", 20))
            .add(&key, entry("a", "bob", 10));
        let again = map.add(&key, entry("a", "bob", 30));

        assert_eq!(map, again);
        let ids: Vec<_> = map.get(&key).unwrap().iter().map(|e| e.local_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn add_rejects_wrong_target() {
        let map = OutboxMap::new().add(&dm("bob"), entry("a", "carol", 10));
        assert!(map.is_empty());
    }

    #[test]
    fn add_trims_oldest_entries() {
        let key = dm("bob");
        let mut map = OutboxMap::new();
        for i in 0..(MAX_OUTBOX_PER_CONVERSATION as i64 + 5) {
            map = map.add(&key, entry(&format!("m{i}"), "bob", i + 1));
        }
        let list = map.get(&key).unwrap();
        assert_eq!(list.len(), MAX_OUTBOX_PER_CONVERSATION);
        assert_eq!(list[0].local_id, lid("m5"));
    }

    #[test]
    fn conversation_cap_keeps_most_recent() {
        let mut map = OutboxMap::new();
        for i in 0..(MAX_OUTBOX_CONVERSATIONS as i64 + 1) {
            let peer = format!("p{i}");
            map = map.add(&dm(&peer), entry("a", &peer, i + 1));
        }
        assert_eq!(map.iter().count(), MAX_OUTBOX_CONVERSATIONS);
        assert!(!map.contains_key(&dm("p0")));
        assert!(map.contains_key(&dm("p80")));
    }

    #[test]
    fn update_is_noop_when_absent() {
        let key = dm("bob");
        let map = OutboxMap::new().add(&key, entry("a", "bob", 10));
        let same = map.update(&key, &lid("zzz"), |e| e.attempts = 3);
        assert_eq!(map, same);

        let updated = map.update(&key, &lid("a"), |e| {
            e.status = OutboxStatus::Sending;
            e.attempts += 1;
        });
        assert_ne!(map, updated);
        assert_eq!(updated.find(&key, &lid("a")).unwrap().attempts, 1);
        assert_eq!(map.find(&key, &lid("a")).unwrap().attempts, 0);
    }

    #[test]
    fn remove_last_entry_drops_key() {
        let key = dm("bob");
        let map = OutboxMap::new()
            .add(&key, entry("a", "bob", 10))
            .add(&key, entry("b", "bob", 20));

        let map = map.remove(&key, &lid("a"));
        assert_eq!(map.get(&key).unwrap().len(), 1);

        let map = map.remove(&key, &lid("b"));
        assert!(map.get(&key).is_none());
        assert!(!map.contains_key(&key));
        assert!(map.is_empty());
    }

    #[test]
    fn locate_across_conversations() {
        let map = OutboxMap::new()
            .add(&dm("bob"), entry("a", "bob", 10))
            .add(&dm("eve"), entry("b", "eve", 20));
        let (key, found) = map.locate(&lid("b")).unwrap();
        assert_eq!(key, &dm("eve"));
        assert_eq!(found.ts, 20);
    }

    #[test]
    fn load_and_save_through_kv() {
        let kv = MemoryKv::new();
        assert!(load_outbox(&kv, "me").unwrap().is_empty());

        let mut e = entry("a", "bob", 10);
        e.when_online = true;
        let map = OutboxMap::new().add(&dm("bob"), e);
        save_outbox(&kv, "me", &map).unwrap();

        let stored: Value = serde_json::from_slice(&kv.get("courier_outbox_v1:me").unwrap().unwrap()).unwrap();
        assert_eq!(stored["v"], 1);
        assert_eq!(stored["entries"]["dm:bob"][0]["to"], "bob");
        assert_eq!(stored["entries"]["dm:bob"][0]["when_online"], true);

        assert_eq!(load_outbox(&kv, "me").unwrap(), map);

        save_outbox(&kv, "me", &OutboxMap::new()).unwrap();
        assert!(kv.get("courier_outbox_v1:me").unwrap().is_none());
    }

    #[test]
    fn blank_user_is_rejected() {
        let kv = MemoryKv::new();
        assert!(matches!(load_outbox(&kv, " "), Err(StoreError::MissingUser)));
    }

    #[test]
    fn text_is_truncated() {
        let long = "é".repeat(MAX_TEXT_CHARS + 10);
        assert_eq!(normalize_text(&long).unwrap().chars().count(), MAX_TEXT_CHARS);
        assert_eq!(normalize_text("\r\n"), None);
    }
}
