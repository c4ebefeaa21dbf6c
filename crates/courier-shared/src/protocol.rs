use serde::{Deserialize, Serialize};

use crate::constants::{RETRYABLE_SEND_ERROR_CODES, SEND_ERROR_CODES};
use crate::error::ProtocolError;
use crate::types::{LocalId, PeerId, RoomId, Target};

/// Events pushed by the server that touch message delivery state.
///
/// Unrelated control frames (roster, presence, ...) decode as
/// [`ServerEvent::Unknown`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// The server accepted a message and handed it to the recipient
    MessageDelivered(DeliveryAck),

    /// The server stored a message for a recipient that is offline
    MessageQueued(DeliveryAck),

    /// The server refused a message for policy reasons
    MessageBlocked(SendBlocked),

    /// Generic server error, possibly about the last send
    Error(ServerError),

    /// Result of an edit (ours, echoed back) or a peer's edit
    MessageEdited(EditAck),

    /// A message was deleted
    MessageDeleted(DeleteAck),

    /// The peer has read our messages up to an id
    MessageReadAck(ReadAck),

    /// A page of authoritative history
    HistoryResult(HistoryPage),

    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub to: Option<PeerId>,
    pub room: Option<RoomId>,
    pub id: u64,
    /// Echo of the request's local id, when the server supports it
    pub local_id: Option<LocalId>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendBlocked {
    pub to: Option<PeerId>,
    pub room: Option<RoomId>,
    #[serde(default)]
    pub reason: String,
    pub local_id: Option<LocalId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    pub message: String,
    pub to: Option<PeerId>,
    pub room: Option<RoomId>,
    pub local_id: Option<LocalId>,
}

impl ServerError {
    /// Whether the code refers to a rejected send.
    pub fn is_send_error(&self) -> bool {
        SEND_ERROR_CODES.contains(&self.message.as_str())
    }

    pub fn is_retryable(&self) -> bool {
        RETRYABLE_SEND_ERROR_CODES.contains(&self.message.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditAck {
    pub ok: bool,
    pub reason: Option<String>,
    pub from: Option<PeerId>,
    pub to: Option<PeerId>,
    pub room: Option<RoomId>,
    pub id: Option<u64>,
    pub local_id: Option<LocalId>,
    pub text: Option<String>,
    pub edited_ts: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteAck {
    #[serde(default = "default_true")]
    pub ok: bool,
    pub reason: Option<String>,
    pub from: Option<PeerId>,
    pub to: Option<PeerId>,
    pub room: Option<RoomId>,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadAck {
    pub peer: PeerId,
    pub up_to_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub peer: Option<PeerId>,
    pub room: Option<RoomId>,
    #[serde(default)]
    pub rows: Vec<HistoryRow>,
    pub before_id: Option<u64>,
    #[serde(default)]
    pub has_more: bool,
}

/// One authoritative message as stored by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub id: u64,
    pub from: PeerId,
    pub to: Option<PeerId>,
    pub room: Option<RoomId>,
    #[serde(default)]
    pub text: String,
    /// Epoch milliseconds
    pub ts: i64,
    pub delivered: Option<bool>,
    pub read: Option<bool>,
    pub local_id: Option<LocalId>,
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub edited: bool,
    pub edited_ts: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_id: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    pub mime: Option<String>,
}

/// One message handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    #[serde(flatten)]
    pub target: Target,
    pub text: String,
    pub local_id: LocalId,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub silent: bool,
}

fn default_true() -> bool {
    true
}
