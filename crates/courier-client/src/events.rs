use courier_shared::ConversationKey;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::reconcile::Notice;
use crate::state::CoreState;

pub const EVENT_CONVERSATION_CHANGED: &str = "conversation-changed";
pub const EVENT_OUTBOX_CHANGED: &str = "outbox-changed";
pub const EVENT_NOTICE: &str = "notice";
pub const EVENT_TRANSFER_CHANGED: &str = "transfer-changed";

/// Capacity of the update channel; slow subscribers see `Lagged` and should
/// re-read a snapshot.
pub const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Change notification for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum CoreUpdate {
    ConversationChanged { key: ConversationKey },
    OutboxChanged,
    Notice { notice: Notice },
    TransferChanged { id: String },
}

impl CoreUpdate {
    pub fn name(&self) -> &'static str {
        match self {
            CoreUpdate::ConversationChanged { .. } => EVENT_CONVERSATION_CHANGED,
            CoreUpdate::OutboxChanged => EVENT_OUTBOX_CHANGED,
            CoreUpdate::Notice { .. } => EVENT_NOTICE,
            CoreUpdate::TransferChanged { .. } => EVENT_TRANSFER_CHANGED,
        }
    }
}

/// Updates describing the move from `before` to `after`, followed by the
/// notices.
pub fn diff_updates(before: &CoreState, after: &CoreState, notices: &[Notice]) -> Vec<CoreUpdate> {
    let mut updates: Vec<CoreUpdate> = Vec::new();

    let mut keys: Vec<&ConversationKey> = before.conversations.keys().collect();
    keys.extend(after.conversations.keys());
    keys.sort();
    keys.dedup();
    for key in keys {
        if before.conversations.get(key) != after.conversations.get(key) {
            updates.push(CoreUpdate::ConversationChanged { key: key.clone() });
        }
    }

    if before.outbox != after.outbox {
        updates.push(CoreUpdate::OutboxChanged);
    }

    updates.extend(
        notices
            .iter()
            .cloned()
            .map(|notice| CoreUpdate::Notice { notice }),
    );
    updates
}

pub fn emit(tx: &broadcast::Sender<CoreUpdate>, update: CoreUpdate) {
    let event = update.name();
    if tx.send(update).is_err() {
        tracing::trace!(event, "No subscribers for update");
    }
}

#[cfg(test)]
mod tests {
    use courier_shared::{LocalId, PeerId, Target};
    use courier_store::OutboxEntry;

    use super::*;
    use crate::conversation::ConversationMessage;

    #[test]
    fn diff_reports_changed_keys_and_outbox() {
        let before = CoreState::new(PeerId::from("alice"));
        let key = ConversationKey::dm(&PeerId::from("bob"));
        let lid = LocalId::parse("l1").unwrap();

        let mut after = before.clone();
        after.conversations.push(
            &key,
            ConversationMessage::outgoing(lid.clone(), PeerId::from("alice"), "hi", 10),
        );
        after.outbox = after.outbox.add(
            &key,
            OutboxEntry::new(lid, Target::Peer(PeerId::from("bob")), "hi", 10),
        );

        let notice = Notice::ServerError {
            message: "boom".into(),
        };
        let updates = diff_updates(&before, &after, std::slice::from_ref(&notice));
        assert_eq!(
            updates,
            vec![
                CoreUpdate::ConversationChanged { key },
                CoreUpdate::OutboxChanged,
                CoreUpdate::Notice { notice },
            ]
        );
        assert!(diff_updates(&after, &after, &[]).is_empty());
    }

    #[test]
    fn serializes_with_event_tag() {
        let json = serde_json::to_value(CoreUpdate::TransferChanged { id: "t1".into() }).unwrap();
        assert_eq!(json["event"], "transfer-changed");
        assert_eq!(json["id"], "t1");
        assert_eq!(CoreUpdate::OutboxChanged.name(), EVENT_OUTBOX_CHANGED);
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        emit(&tx, CoreUpdate::OutboxChanged);
    }
}
