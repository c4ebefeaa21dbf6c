//! Terminal file transfer outcomes, persisted as `{"v":1,"transfers":[..]}`.
//!
//! In-progress transfers are never stored: their live URL or blob handle is
//! meaningless after a reload.

use courier_shared::constants::{
    MAX_TRANSFER_HISTORY, TRANSFER_HISTORY_VERSION, TRANSFER_STORAGE_PREFIX,
};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::kv::{user_key, KvStore};
use crate::models::{TransferDirection, TransferHistoryEntry, TransferStatus};

const DEFAULT_NAME: &str = "file";
const UNKNOWN_PEER: &str = "-";

/// Newest-first list of finished transfers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferHistory {
    entries: Vec<TransferHistoryEntry>,
}

#[derive(Serialize)]
struct HistoryDocument<'a> {
    v: u64,
    transfers: &'a [TransferHistoryEntry],
}

impl TransferHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep terminal, well-formed entries from an untrusted JSON array.
    /// The first occurrence of an id wins.
    pub fn sanitize(raw: &Value) -> Self {
        let Some(items) = raw.as_array() else {
            return Self::default();
        };

        let mut entries: Vec<TransferHistoryEntry> = Vec::new();
        for item in items {
            let Some(entry) = entry_from_value(item) else {
                continue;
            };
            if entries.iter().any(|e| e.id == entry.id) {
                continue;
            }
            entries.push(entry);
            if entries.len() >= MAX_TRANSFER_HISTORY {
                break;
            }
        }
        Self { entries }
    }

    /// Decode a stored document. Anything but a version 1 document yields an
    /// empty history.
    pub fn parse(bytes: &[u8]) -> Self {
        let value: Value = match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable transfer history");
                return Self::default();
            }
        };
        if value.get("v").and_then(Value::as_u64) != Some(TRANSFER_HISTORY_VERSION) {
            return Self::default();
        }
        value
            .get("transfers")
            .map(Self::sanitize)
            .unwrap_or_default()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let doc = HistoryDocument {
            v: TRANSFER_HISTORY_VERSION,
            transfers: &self.entries,
        };
        Ok(serde_json::to_vec(&doc)?)
    }

    /// Put `entry` at the front, replacing an older record with the same id.
    /// Non-terminal entries are ignored.
    pub fn record(&self, entry: TransferHistoryEntry) -> Self {
        let Some(entry) = normalize(entry) else {
            return self.clone();
        };
        let id = entry.id.clone();
        let mut entries = Vec::with_capacity(self.entries.len() + 1);
        entries.push(entry);
        entries.extend(self.entries.iter().filter(|e| e.id != id).cloned());
        entries.truncate(MAX_TRANSFER_HISTORY);
        Self { entries }
    }

    pub fn remove(&self, id: &str) -> Self {
        Self {
            entries: self.entries.iter().filter(|e| e.id != id).cloned().collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&TransferHistoryEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn entries(&self) -> &[TransferHistoryEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

pub fn load_transfer_history(kv: &dyn KvStore, user: &str) -> Result<TransferHistory> {
    let key = user_key(TRANSFER_STORAGE_PREFIX, user).ok_or(StoreError::MissingUser)?;
    Ok(kv
        .get(&key)?
        .map(|bytes| TransferHistory::parse(&bytes))
        .unwrap_or_default())
}

/// Persist `history`; an empty history deletes the document.
pub fn save_transfer_history(kv: &dyn KvStore, user: &str, history: &TransferHistory) -> Result<()> {
    let key = user_key(TRANSFER_STORAGE_PREFIX, user).ok_or(StoreError::MissingUser)?;
    if history.is_empty() {
        return kv.delete(&key);
    }
    kv.put(&key, &history.to_bytes()?)
}

fn normalize(mut entry: TransferHistoryEntry) -> Option<TransferHistoryEntry> {
    entry.id = entry.id.trim().to_string();
    if entry.id.is_empty() || !entry.status.is_terminal() {
        return None;
    }
    if entry.local_id.trim().is_empty() {
        entry.local_id = format!("ft-{}", entry.id);
    }
    if entry.name.trim().is_empty() {
        entry.name = DEFAULT_NAME.to_string();
    }
    if entry.peer.trim().is_empty() {
        entry.peer = UNKNOWN_PEER.to_string();
    }
    entry.progress = if entry.status.is_success() {
        100
    } else {
        entry.progress.min(100)
    };
    entry.error = entry
        .error
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty());
    Some(entry)
}

fn entry_from_value(raw: &Value) -> Option<TransferHistoryEntry> {
    let obj = raw.as_object()?;
    let trimmed = |field: &str| {
        obj.get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    };

    let status = TransferStatus::parse(obj.get("status")?.as_str()?)?;
    let direction = TransferDirection::parse(obj.get("direction")?.as_str()?)?;

    let size = obj
        .get("size")
        .and_then(Value::as_f64)
        .filter(|n| n.is_finite() && *n > 0.0)
        .map_or(0, |n| n.round() as u64);
    let progress = obj
        .get("progress")
        .and_then(Value::as_f64)
        .filter(|n| n.is_finite())
        .map_or(0, |n| n.round().clamp(0.0, 100.0) as u8);

    normalize(TransferHistoryEntry {
        id: trimmed("id"),
        local_id: trimmed("local_id"),
        name: trimmed("name"),
        size,
        direction,
        peer: trimmed("peer"),
        room: obj.get("room").and_then(Value::as_str).map(str::to_string),
        status,
        progress,
        error: obj.get("error").and_then(Value::as_str).map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::kv::MemoryKv;

    fn finished(id: &str, status: TransferStatus) -> TransferHistoryEntry {
        TransferHistoryEntry {
            id: id.to_string(),
            local_id: String::new(),
            name: "photo.jpg".into(),
            size: 10,
            direction: TransferDirection::In,
            peer: "bob".into(),
            room: None,
            status,
            progress: 40,
            error: None,
        }
    }

    #[test]
    fn keeps_only_terminal_entries() {
        let raw = json!([
            {"id": "1", "status": "complete", "direction": "in", "name": "a.txt", "size": 5, "peer": "bob", "progress": 10},
            {"id": "2", "status": "downloading", "direction": "in", "progress": 50},
            {"id": "3", "status": "uploading", "direction": "out"},
            {"id": "4", "status": "rejected", "direction": "out", "progress": 150},
            {"id": "5", "status": "error", "direction": "in", "error": "  timeout  ", "progress": -3}
        ]);
        let history = TransferHistory::sanitize(&raw);
        let ids: Vec<_> = history.entries().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "4", "5"]);

        let complete = history.get("1").unwrap();
        assert_eq!(complete.progress, 100);
        assert_eq!(complete.local_id, "ft-1");
        assert_eq!(history.get("4").unwrap().progress, 100);
        assert_eq!(history.get("4").unwrap().name, "file");
        assert_eq!(history.get("4").unwrap().peer, "-");
        assert_eq!(history.get("5").unwrap().progress, 0);
        assert_eq!(history.get("5").unwrap().error.as_deref(), Some("timeout"));
    }

    #[test]
    fn strips_url_and_dedups() {
        let raw = json!({"v": 1, "transfers": [
            {"id": "1", "status": "complete", "direction": "in", "name": "first", "url": "https://x/blob"},
            {"id": "1", "status": "error", "direction": "in", "name": "second"},
            {"id": "", "status": "complete", "direction": "in"},
            {"id": "2", "status": "complete", "direction": "sideways"}
        ]});
        let history = TransferHistory::parse(raw.to_string().as_bytes());
        assert_eq!(history.len(), 1);
        assert_eq!(history.get("1").unwrap().name, "first");

        let stored = String::from_utf8(history.to_bytes().unwrap()).unwrap();
        assert!(!stored.contains("url"));
        assert!(stored.starts_with(r#"{"v":1,"transfers":["#));
    }

    #[test]
    fn rejects_other_versions_and_garbage() {
        assert!(TransferHistory::parse(br#"{"v":2,"transfers":[{"id":"1","status":"complete","direction":"in"}]}"#).is_empty());
        assert!(TransferHistory::parse(br#"{"transfers":[]}"#).is_empty());
        assert!(TransferHistory::parse(b"\x00\x01").is_empty());
        assert!(TransferHistory::sanitize(&json!({"id": "1"})).is_empty());
    }

    #[test]
    fn record_prepends_and_replaces() {
        let history = TransferHistory::new()
            .record(finished("1", TransferStatus::Complete))
            .record(finished("2", TransferStatus::Error))
            .record(finished("1", TransferStatus::Uploaded));

        let ids: Vec<_> = history.entries().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(history.get("1").unwrap().status, TransferStatus::Uploaded);
        assert_eq!(history.get("2").unwrap().progress, 40);

        let same = history.record(finished("3", TransferStatus::Downloading));
        assert_eq!(same, history);
    }

    #[test]
    fn history_is_capped() {
        let mut history = TransferHistory::new();
        for i in 0..(MAX_TRANSFER_HISTORY + 3) {
            history = history.record(finished(&i.to_string(), TransferStatus::Complete));
        }
        assert_eq!(history.len(), MAX_TRANSFER_HISTORY);
        assert_eq!(history.entries()[0].id, (MAX_TRANSFER_HISTORY + 2).to_string());
    }

    #[test]
    fn load_and_save_through_kv() {
        let kv = MemoryKv::new();
        let history = TransferHistory::new().record(finished("1", TransferStatus::Rejected));
        save_transfer_history(&kv, "me", &history).unwrap();
        assert_eq!(load_transfer_history(&kv, "me").unwrap(), history);

        save_transfer_history(&kv, "me", &TransferHistory::new()).unwrap();
        assert!(kv.get("courier_file_transfers_v1:me").unwrap().is_none());
    }
}
