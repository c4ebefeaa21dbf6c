//! Rendered conversation logs.

use std::collections::BTreeMap;

use courier_shared::protocol::Attachment;
use courier_shared::{ConversationKey, LocalId, PeerId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Out,
    In,
    Sys,
}

/// Delivery status of an outgoing message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Sending,
    Sent,
    Delivered,
    Read,
    Error,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Queued => 0,
            MessageStatus::Sending | MessageStatus::Error => 1,
            MessageStatus::Sent => 2,
            MessageStatus::Delivered => 3,
            MessageStatus::Read => 4,
        }
    }

    /// Fold a server-reported status into the current one. Server facts only
    /// move a message forward, so replaying an event changes nothing.
    pub fn advance(current: Option<Self>, reported: Self) -> Self {
        match current {
            Some(current) if current.rank() > reported.rank() => current,
            _ => reported,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationMessage {
    pub kind: MessageKind,
    /// Server id; `None` while the message only exists locally.
    pub id: Option<u64>,
    /// Join key to the outbox entry. Kept after the id is known.
    pub local_id: Option<LocalId>,
    pub from: Option<PeerId>,
    pub status: Option<MessageStatus>,
    /// Epoch milliseconds.
    pub ts: i64,
    pub text: String,
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub edited: bool,
    pub edited_ts: Option<i64>,
}

impl ConversationMessage {
    /// Optimistic copy of a message the user just composed.
    pub fn outgoing(local_id: LocalId, from: PeerId, text: impl Into<String>, ts: i64) -> Self {
        Self {
            kind: MessageKind::Out,
            id: None,
            local_id: Some(local_id),
            from: Some(from),
            status: Some(MessageStatus::Queued),
            ts,
            text: text.into(),
            attachment: None,
            edited: false,
            edited_ts: None,
        }
    }

    /// Local notice rendered inline in the log.
    pub fn system(text: impl Into<String>, ts: i64) -> Self {
        Self {
            kind: MessageKind::Sys,
            id: None,
            local_id: None,
            from: None,
            status: None,
            ts,
            text: text.into(),
            attachment: None,
            edited: false,
            edited_ts: None,
        }
    }

    /// Outgoing and not yet acknowledged by the server.
    pub fn is_pending(&self) -> bool {
        self.kind == MessageKind::Out
            && self.id.is_none()
            && matches!(
                self.status,
                Some(MessageStatus::Queued | MessageStatus::Sending)
            )
    }
}

/// All conversation logs, keyed like the outbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Conversations {
    logs: BTreeMap<ConversationKey, Vec<ConversationMessage>>,
}

impl Conversations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ConversationKey) -> &[ConversationMessage] {
        self.logs.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Mutable log for `key`, created on first use.
    pub fn log_mut(&mut self, key: &ConversationKey) -> &mut Vec<ConversationMessage> {
        self.logs.entry(key.clone()).or_default()
    }

    /// Existing log for `key`, if any.
    pub fn existing_mut(&mut self, key: &ConversationKey) -> Option<&mut Vec<ConversationMessage>> {
        self.logs.get_mut(key)
    }

    pub fn push(&mut self, key: &ConversationKey, message: ConversationMessage) {
        self.log_mut(key).push(message);
    }

    pub fn position_by_id(&self, key: &ConversationKey, id: u64) -> Option<usize> {
        self.get(key).iter().position(|m| m.id == Some(id))
    }

    pub fn position_by_local_id(&self, key: &ConversationKey, local_id: &LocalId) -> Option<usize> {
        self.get(key)
            .iter()
            .position(|m| m.kind == MessageKind::Out && m.local_id.as_ref() == Some(local_id))
    }

    /// First conversation holding a message with `id`.
    pub fn locate_id(&self, id: u64) -> Option<(ConversationKey, usize)> {
        self.logs.iter().find_map(|(key, log)| {
            log.iter()
                .position(|m| m.id == Some(id))
                .map(|pos| (key.clone(), pos))
        })
    }

    pub fn locate_local_id(&self, local_id: &LocalId) -> Option<(ConversationKey, usize)> {
        self.logs.iter().find_map(|(key, log)| {
            log.iter()
                .position(|m| m.local_id.as_ref() == Some(local_id))
                .map(|pos| (key.clone(), pos))
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &ConversationKey> {
        self.logs.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConversationKey, &[ConversationMessage])> {
        self.logs.iter().map(|(k, v)| (k, v.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_never_moves_backwards() {
        use MessageStatus::*;
        assert_eq!(MessageStatus::advance(Some(Read), Delivered), Read);
        assert_eq!(MessageStatus::advance(Some(Delivered), Delivered), Delivered);
        assert_eq!(MessageStatus::advance(Some(Sending), Delivered), Delivered);
        assert_eq!(MessageStatus::advance(None, Queued), Queued);
        assert_eq!(MessageStatus::advance(Some(Error), Sent), Sent);
    }

    #[test]
    fn pending_is_outgoing_without_id() {
        let me = PeerId::from("me");
        let mut msg = ConversationMessage::outgoing(LocalId::generate(), me, "hi", 1);
        assert!(msg.is_pending());
        msg.id = Some(4);
        assert!(!msg.is_pending());
        assert!(!ConversationMessage::system("note", 1).is_pending());
    }

    #[test]
    fn locate_across_logs() {
        let mut convs = Conversations::new();
        let key = ConversationKey::dm(&PeerId::from("bob"));
        let mut msg = ConversationMessage::system("x", 1);
        msg.id = Some(9);
        convs.push(&key, msg);

        assert_eq!(convs.locate_id(9), Some((key.clone(), 0)));
        assert_eq!(convs.locate_id(10), None);
        assert!(convs.get(&ConversationKey::dm(&PeerId::from("eve"))).is_empty());
    }
}
