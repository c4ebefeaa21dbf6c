use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{MAX_CONVERSATION_KEY_LEN, MAX_LOCAL_ID_LEN};
use crate::error::ProtocolError;

// Account identifier as assigned by the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// Group or board identifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Destination of an outgoing message. Serialized as `{"to": ..}` or
/// `{"room": ..}` so it can be flattened into wire and storage records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Target {
    #[serde(rename = "to")]
    Peer(PeerId),
    #[serde(rename = "room")]
    Room(RoomId),
}

impl Target {
    pub fn conversation_key(&self) -> ConversationKey {
        match self {
            Target::Peer(peer) => ConversationKey::dm(peer),
            Target::Room(room) => ConversationKey::room(room),
        }
    }

    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            Target::Peer(peer) => Some(peer),
            Target::Room(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    Direct,
    Room,
}

/// Key of one conversation log and its outbox queue: `dm:<peer>` or
/// `room:<room>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationKey(String);

impl ConversationKey {
    const DM_PREFIX: &'static str = "dm:";
    const ROOM_PREFIX: &'static str = "room:";

    pub fn dm(peer: &PeerId) -> Self {
        Self(format!("{}{}", Self::DM_PREFIX, peer.0))
    }

    pub fn room(room: &RoomId) -> Self {
        Self(format!("{}{}", Self::ROOM_PREFIX, room.0))
    }

    /// Parse a raw key, rejecting unknown prefixes, empty ids and keys
    /// longer than [`MAX_CONVERSATION_KEY_LEN`].
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.len() > MAX_CONVERSATION_KEY_LEN {
            return None;
        }
        let id = raw
            .strip_prefix(Self::DM_PREFIX)
            .or_else(|| raw.strip_prefix(Self::ROOM_PREFIX))?;
        if id.trim().is_empty() {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn kind(&self) -> ConversationKind {
        if self.0.starts_with(Self::DM_PREFIX) {
            ConversationKind::Direct
        } else {
            ConversationKind::Room
        }
    }

    /// The peer or room id without its prefix.
    pub fn id(&self) -> &str {
        self.0
            .strip_prefix(Self::DM_PREFIX)
            .or_else(|| self.0.strip_prefix(Self::ROOM_PREFIX))
            .unwrap_or(&self.0)
    }

    pub fn target(&self) -> Target {
        match self.kind() {
            ConversationKind::Direct => Target::Peer(PeerId::new(self.id())),
            ConversationKind::Room => Target::Room(RoomId::new(self.id())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ConversationKey {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or(ProtocolError::InvalidConversationKey(value))
    }
}

impl From<ConversationKey> for String {
    fn from(key: ConversationKey) -> Self {
        key.0
    }
}

/// Client-generated idempotency key of an outgoing message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct LocalId(String);

impl LocalId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.len() > MAX_LOCAL_ID_LEN {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for LocalId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or(ProtocolError::InvalidLocalId(value))
    }
}

impl From<LocalId> for String {
    fn from(id: LocalId) -> Self {
        id.0
    }
}
