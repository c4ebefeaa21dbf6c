//! Records persisted through the key/value store.
//!
//! Every struct derives `Serialize` and `Deserialize`; the JSON shape is the
//! on-disk format.

use courier_shared::{LocalId, Target};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Send state of a pending outgoing message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    #[default]
    Queued,
    Sending,
    Sent,
    Error,
}

impl OutboxStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "queued" => Some(Self::Queued),
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One outgoing message the server has not confirmed yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Idempotency key, unique within the conversation.
    pub local_id: LocalId,
    /// Creation time, epoch milliseconds.
    pub ts: i64,
    pub text: String,
    /// Destination, flattened as `to` or `room`.
    #[serde(flatten)]
    pub target: Target,
    #[serde(default)]
    pub status: OutboxStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<i64>,
    /// Earliest send time, epoch milliseconds. `None` sends right away.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_at: Option<i64>,
    /// Hold the entry until the peer is seen online.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub when_online: bool,
    /// Ask the server not to notify the recipient.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub silent: bool,
}

impl OutboxEntry {
    /// A fresh queued entry.
    pub fn new(local_id: LocalId, target: Target, text: impl Into<String>, ts: i64) -> Self {
        Self {
            local_id,
            ts,
            text: text.into(),
            target,
            status: OutboxStatus::Queued,
            attempts: 0,
            last_attempt_at: None,
            schedule_at: None,
            when_online: false,
            silent: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Transfer history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    In,
    Out,
}

impl TransferDirection {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "in" => Some(Self::In),
            "out" => Some(Self::Out),
            _ => None,
        }
    }
}

/// Lifecycle of a file transfer. Only terminal states are persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Offering,
    Uploading,
    Downloading,
    Complete,
    Uploaded,
    Error,
    Rejected,
}

impl TransferStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "offering" => Some(Self::Offering),
            "uploading" => Some(Self::Uploading),
            "downloading" => Some(Self::Downloading),
            "complete" => Some(Self::Complete),
            "uploaded" => Some(Self::Uploaded),
            "error" => Some(Self::Error),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Uploaded | Self::Error | Self::Rejected
        )
    }

    /// Terminal and successful.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Complete | Self::Uploaded)
    }
}

/// Terminal outcome of one transfer. Carries no URL or blob handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferHistoryEntry {
    pub id: String,
    pub local_id: String,
    pub name: String,
    pub size: u64,
    pub direction: TransferDirection,
    pub peer: String,
    pub room: Option<String>,
    pub status: TransferStatus,
    /// Percent, 0..=100.
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
