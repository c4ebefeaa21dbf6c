//! Live file transfers and their persisted history.
//!
//! A transfer is tracked in memory with its ephemeral URL while it runs.
//! When it reaches a terminal status it leaves the live set and becomes a
//! [`TransferHistoryEntry`] without the URL.

use std::collections::BTreeMap;

use courier_shared::{PeerId, RoomId};
use courier_store::{
    load_transfer_history, save_transfer_history, KvStore, StoreError, TransferDirection,
    TransferHistory, TransferHistoryEntry, TransferStatus,
};

/// What is known about a file before any byte moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMeta {
    pub id: String,
    /// Id of the chat message carrying the file, when there is one.
    pub local_id: Option<String>,
    pub name: String,
    pub size: u64,
    pub peer: PeerId,
    pub room: Option<RoomId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTransfer {
    pub meta: TransferMeta,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub progress: u8,
    /// Download source or upload target. Never persisted.
    pub url: Option<String>,
}

impl LiveTransfer {
    fn to_history(&self, status: TransferStatus, error: Option<String>) -> TransferHistoryEntry {
        let meta = &self.meta;
        TransferHistoryEntry {
            id: meta.id.clone(),
            local_id: meta
                .local_id
                .clone()
                .unwrap_or_else(|| format!("ft-{}", meta.id)),
            name: meta.name.clone(),
            size: meta.size,
            direction: self.direction,
            peer: meta.peer.to_string(),
            room: meta.room.as_ref().map(RoomId::to_string),
            status,
            progress: if status.is_success() { 100 } else { self.progress },
            error,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferTracker {
    live: BTreeMap<String, LiveTransfer>,
    history: TransferHistory,
}

fn percent(done: u64, size: u64) -> u8 {
    if size == 0 {
        return 0;
    }
    (done.min(size).saturating_mul(100) / size) as u8
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(history: TransferHistory) -> Self {
        Self {
            live: BTreeMap::new(),
            history,
        }
    }

    pub fn load(kv: &dyn KvStore, user: &str) -> Result<Self, StoreError> {
        Ok(Self::with_history(load_transfer_history(kv, user)?))
    }

    pub fn save(&self, kv: &dyn KvStore, user: &str) -> Result<(), StoreError> {
        save_transfer_history(kv, user, &self.history)
    }

    fn start(
        &mut self,
        meta: TransferMeta,
        direction: TransferDirection,
        status: TransferStatus,
        url: Option<String>,
    ) -> &LiveTransfer {
        tracing::debug!(id = %meta.id, ?direction, ?status, "transfer started");
        let id = meta.id.clone();
        self.live.insert(
            id.clone(),
            LiveTransfer {
                meta,
                direction,
                status,
                progress: 0,
                url,
            },
        );
        &self.live[&id]
    }

    /// Track an incoming file fetched from `url`.
    pub fn begin_download(&mut self, meta: TransferMeta, url: impl Into<String>) -> &LiveTransfer {
        self.start(
            meta,
            TransferDirection::In,
            TransferStatus::Downloading,
            Some(url.into()),
        )
    }

    /// Offer a file to a peer before it is uploaded.
    pub fn offer(&mut self, meta: TransferMeta) -> &LiveTransfer {
        self.start(meta, TransferDirection::Out, TransferStatus::Offering, None)
    }

    /// Start uploading, either a previously offered file or a new one.
    pub fn begin_upload(&mut self, meta: TransferMeta, url: Option<String>) -> &LiveTransfer {
        let id = meta.id.clone();
        let offered = self
            .live
            .get(&id)
            .is_some_and(|t| t.direction == TransferDirection::Out && !t.status.is_terminal());
        if !offered {
            return self.start(meta, TransferDirection::Out, TransferStatus::Uploading, url);
        }
        if let Some(t) = self.live.get_mut(&id) {
            t.status = TransferStatus::Uploading;
            if url.is_some() {
                t.url = url;
            }
        }
        &self.live[&id]
    }

    /// Record `done` bytes moved. Returns the new percentage.
    pub fn update_progress(&mut self, id: &str, done: u64) -> Option<u8> {
        let transfer = self.live.get_mut(id)?;
        transfer.progress = percent(done, transfer.meta.size);
        Some(transfer.progress)
    }

    /// The size became known once the server answered.
    pub fn set_size(&mut self, id: &str, size: u64) -> bool {
        match self.live.get_mut(id) {
            Some(t) => {
                t.meta.size = size;
                true
            }
            None => false,
        }
    }

    /// A refreshed download URL replaces the expired one.
    pub fn set_url(&mut self, id: &str, url: impl Into<String>) -> bool {
        match self.live.get_mut(id) {
            Some(t) => {
                t.url = Some(url.into());
                true
            }
            None => false,
        }
    }

    /// End a transfer: `Ok` completes it, `Err` records the failure text.
    pub fn finish(&mut self, id: &str, result: Result<(), String>) -> Option<TransferHistoryEntry> {
        let transfer = self.live.get(id)?;
        let (status, error) = match result {
            Ok(()) => match transfer.direction {
                TransferDirection::In => (TransferStatus::Complete, None),
                TransferDirection::Out => (TransferStatus::Uploaded, None),
            },
            Err(reason) => (TransferStatus::Error, Some(reason)),
        };
        self.close(id, status, error)
    }

    /// The peer declined the offer, or the user declined an incoming file.
    pub fn reject(&mut self, id: &str) -> Option<TransferHistoryEntry> {
        self.close(id, TransferStatus::Rejected, None)
    }

    fn close(
        &mut self,
        id: &str,
        status: TransferStatus,
        error: Option<String>,
    ) -> Option<TransferHistoryEntry> {
        let transfer = self.live.remove(id)?;
        let entry = transfer.to_history(status, error);
        tracing::info!(id, ?status, progress = entry.progress, "transfer finished");
        self.history = self.history.record(entry.clone());
        Some(entry)
    }

    pub fn live(&self, id: &str) -> Option<&LiveTransfer> {
        self.live.get(id)
    }

    pub fn live_transfers(&self) -> impl Iterator<Item = &LiveTransfer> {
        self.live.values()
    }

    pub fn history(&self) -> &TransferHistory {
        &self.history
    }

    pub fn forget(&mut self, id: &str) {
        self.history = self.history.remove(id);
    }
}
