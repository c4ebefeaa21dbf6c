//! Folding server events into conversation and outbox state.
//!
//! [`reconcile`] is a pure function from `(state, event)` to the next state.
//! Every match is made by an explicit key (`local_id` or server `id`), never
//! by position in the log, and every server fact only moves a message
//! forward. Replaying an event therefore leaves the state unchanged.

use courier_shared::constants::HISTORY_MATCH_WINDOW_MS;
use courier_shared::protocol::{
    DeleteAck, DeliveryAck, EditAck, HistoryPage, HistoryRow, ReadAck, ServerEvent,
};
use courier_shared::{ConversationKey, LocalId, PeerId, RoomId};
use courier_store::OutboxStatus;
use serde::Serialize;

use crate::conversation::{ConversationMessage, MessageKind, MessageStatus};
use crate::state::CoreState;

/// Something the user should be told about, beyond the state change itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// The server refused a message; it stays in the outbox as `Error`.
    SendRejected {
        key: ConversationKey,
        local_id: Option<LocalId>,
        reason: String,
    },
    /// Retries ran out for a message.
    SendFailed {
        key: ConversationKey,
        local_id: LocalId,
        reason: String,
    },
    EditFailed { reason: String },
    DeleteFailed { reason: String },
    /// A server error not tied to a send.
    ServerError { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub state: CoreState,
    pub notices: Vec<Notice>,
}

/// Apply one server event. `now` stamps locally generated system lines.
pub fn reconcile(state: &CoreState, event: &ServerEvent, now: i64) -> Reconciled {
    let mut next = state.clone();
    let mut notices = Vec::new();

    match event {
        ServerEvent::MessageDelivered(ack) => apply_ack(&mut next, ack, MessageStatus::Delivered),
        ServerEvent::MessageQueued(ack) => apply_ack(&mut next, ack, MessageStatus::Queued),
        ServerEvent::MessageBlocked(blocked) => apply_rejection(
            &mut next,
            Rejection {
                to: blocked.to.as_ref(),
                room: blocked.room.as_ref(),
                local_id: blocked.local_id.as_ref(),
                line: format!("[blocked] {}", blocked.reason),
                reason: blocked.reason.clone(),
                retryable: false,
            },
            now,
            &mut notices,
        ),
        ServerEvent::Error(err) if err.is_send_error() => apply_rejection(
            &mut next,
            Rejection {
                to: err.to.as_ref(),
                room: err.room.as_ref(),
                local_id: err.local_id.as_ref(),
                line: describe_send_error(&err.message).to_string(),
                reason: err.message.clone(),
                retryable: err.is_retryable(),
            },
            now,
            &mut notices,
        ),
        ServerEvent::Error(err) => notices.push(Notice::ServerError {
            message: err.message.clone(),
        }),
        ServerEvent::MessageEdited(edit) => apply_edit(&mut next, edit, &mut notices),
        ServerEvent::MessageDeleted(delete) => apply_delete(&mut next, delete, &mut notices),
        ServerEvent::MessageReadAck(ack) => apply_read_ack(&mut next, ack),
        ServerEvent::HistoryResult(page) => apply_history(&mut next, page),
        ServerEvent::Unknown => {}
    }

    Reconciled {
        state: next,
        notices,
    }
}

/// User-facing line for a send error code.
pub fn describe_send_error(code: &str) -> &'static str {
    match code {
        "not_in_group" => "You are not a member of this chat",
        "group_post_forbidden" => "Posting in this chat is not allowed",
        "board_post_forbidden" => "Only the board owner can post here",
        "board_check_failed" | "group_check_failed" => "Could not verify access to this chat",
        "broadcast_disabled" => "Broadcast messages are disabled",
        "message_too_long" => "Message is too long",
        "bad_text" => "Message text is invalid",
        "bad_recipient" => "Recipient does not exist",
        "rate_limited" => "Sending too fast, retrying",
        _ => "Message was not sent",
    }
}

fn destination_key(to: Option<&PeerId>, room: Option<&RoomId>) -> Option<ConversationKey> {
    match (room, to) {
        (Some(room), _) => Some(ConversationKey::room(room)),
        (None, Some(peer)) => Some(ConversationKey::dm(peer)),
        (None, None) => None,
    }
}

/// Find the conversation of a `local_id` when the event omits its
/// destination.
fn key_of_local_id(state: &CoreState, local_id: &LocalId) -> Option<ConversationKey> {
    state
        .outbox
        .locate(local_id)
        .map(|(key, _)| key.clone())
        .or_else(|| {
            state
                .conversations
                .locate_local_id(local_id)
                .map(|(key, _)| key)
        })
}

fn resolve_key(
    state: &CoreState,
    to: Option<&PeerId>,
    room: Option<&RoomId>,
    local_id: Option<&LocalId>,
) -> Option<ConversationKey> {
    destination_key(to, room).or_else(|| local_id.and_then(|id| key_of_local_id(state, id)))
}

/// First pending message that has a send call in flight, else the first
/// pending one.
fn first_in_flight(log: &[ConversationMessage]) -> Option<usize> {
    log.iter()
        .position(|m| m.is_pending() && m.status == Some(MessageStatus::Sending))
        .or_else(|| log.iter().position(ConversationMessage::is_pending))
}

fn find_acked_message(log: &[ConversationMessage], ack: &DeliveryAck) -> Option<usize> {
    if let Some(local_id) = &ack.local_id {
        return log
            .iter()
            .position(|m| m.kind == MessageKind::Out && m.local_id.as_ref() == Some(local_id))
            .or_else(|| log.iter().position(|m| m.id == Some(ack.id)));
    }

    if let Some(pos) = log
        .iter()
        .position(|m| m.kind == MessageKind::Out && m.id == Some(ack.id))
    {
        return Some(pos);
    }

    if let Some(text) = &ack.text {
        if let Some(pos) = log.iter().rposition(|m| m.is_pending() && &m.text == text) {
            return Some(pos);
        }
    }

    first_in_flight(log)
}

fn apply_ack(state: &mut CoreState, ack: &DeliveryAck, reported: MessageStatus) {
    let Some(key) = resolve_key(
        state,
        ack.to.as_ref(),
        ack.room.as_ref(),
        ack.local_id.as_ref(),
    ) else {
        tracing::debug!(id = ack.id, "ack without destination");
        return;
    };

    let mut local_id = ack.local_id.clone();
    let pos = find_acked_message(state.conversations.get(&key), ack);
    match pos {
        Some(pos) => {
            let msg = &mut state.conversations.log_mut(&key)[pos];
            msg.status = Some(match msg.id {
                None => reported,
                Some(_) => MessageStatus::advance(msg.status, reported),
            });
            msg.id = Some(ack.id);
            if local_id.is_none() {
                local_id = msg.local_id.clone();
            }
            tracing::debug!(key = %key, id = ack.id, status = ?msg.status, "applied send ack");
        }
        None => tracing::debug!(key = %key, id = ack.id, "ack matches no pending message"),
    }

    if let Some(local_id) = local_id {
        state.outbox = state.outbox.remove(&key, &local_id);
    }
}

struct Rejection<'a> {
    to: Option<&'a PeerId>,
    room: Option<&'a RoomId>,
    local_id: Option<&'a LocalId>,
    /// System line appended to the log.
    line: String,
    reason: String,
    retryable: bool,
}

fn apply_rejection(
    state: &mut CoreState,
    rejection: Rejection<'_>,
    now: i64,
    notices: &mut Vec<Notice>,
) {
    let Some(key) = resolve_key(state, rejection.to, rejection.room, rejection.local_id) else {
        notices.push(Notice::ServerError {
            message: rejection.reason,
        });
        return;
    };

    let pos = match rejection.local_id {
        Some(local_id) => state.conversations.position_by_local_id(&key, local_id),
        None => first_in_flight(state.conversations.get(&key)),
    };
    let Some(pos) = pos else {
        notices.push(Notice::SendRejected {
            key,
            local_id: rejection.local_id.cloned(),
            reason: rejection.reason,
        });
        return;
    };

    let log = state.conversations.log_mut(&key);
    if !log[pos].is_pending() {
        return;
    }
    let local_id = log[pos].local_id.clone();

    if rejection.retryable {
        log[pos].status = Some(MessageStatus::Queued);
        if let Some(local_id) = &local_id {
            state.outbox = state
                .outbox
                .update(&key, local_id, |e| e.status = OutboxStatus::Queued);
        }
        tracing::debug!(key = %key, reason = %rejection.reason, "send throttled, will retry");
        return;
    }

    log[pos].status = Some(MessageStatus::Error);
    log.push(ConversationMessage::system(rejection.line, now));
    if let Some(local_id) = &local_id {
        state.outbox = state
            .outbox
            .update(&key, local_id, |e| e.status = OutboxStatus::Error);
    }
    tracing::info!(key = %key, reason = %rejection.reason, "send rejected by server");
    notices.push(Notice::SendRejected {
        key,
        local_id,
        reason: rejection.reason,
    });
}

/// Conversations an edit or delete may refer to, most specific first.
fn candidate_keys(
    state: &CoreState,
    from: Option<&PeerId>,
    to: Option<&PeerId>,
    room: Option<&RoomId>,
) -> Vec<ConversationKey> {
    let mut keys = Vec::new();
    if let Some(room) = room {
        keys.push(ConversationKey::room(room));
    }
    for peer in [to, from].into_iter().flatten() {
        if peer != &state.self_id {
            let key = ConversationKey::dm(peer);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys
}

/// Locate a message by server id in the candidate conversations, then in
/// every conversation. Server ids are unique per account.
fn locate_by_id(
    state: &CoreState,
    candidates: &[ConversationKey],
    id: u64,
) -> Option<(ConversationKey, usize)> {
    candidates
        .iter()
        .find_map(|key| {
            state
                .conversations
                .position_by_id(key, id)
                .map(|pos| (key.clone(), pos))
        })
        .or_else(|| state.conversations.locate_id(id))
}

fn locate_by_local_id(
    state: &CoreState,
    candidates: &[ConversationKey],
    local_id: &LocalId,
) -> Option<(ConversationKey, usize)> {
    candidates
        .iter()
        .find_map(|key| {
            state
                .conversations
                .position_by_local_id(key, local_id)
                .map(|pos| (key.clone(), pos))
        })
        .or_else(|| state.conversations.locate_local_id(local_id))
}

fn apply_edit(state: &mut CoreState, edit: &EditAck, notices: &mut Vec<Notice>) {
    if !edit.ok {
        notices.push(Notice::EditFailed {
            reason: edit.reason.clone().unwrap_or_else(|| "edit_failed".to_string()),
        });
        return;
    }
    let Some(text) = &edit.text else {
        return;
    };

    let candidates = candidate_keys(state, edit.from.as_ref(), edit.to.as_ref(), edit.room.as_ref());
    let found = edit
        .id
        .and_then(|id| locate_by_id(state, &candidates, id))
        .or_else(|| {
            edit.local_id
                .as_ref()
                .and_then(|local_id| locate_by_local_id(state, &candidates, local_id))
        });
    let Some((key, pos)) = found else {
        tracing::debug!(id = ?edit.id, "edit for unknown message");
        return;
    };

    let msg = &mut state.conversations.log_mut(&key)[pos];
    msg.text = text.clone();
    msg.edited = true;
    if edit.edited_ts.is_some() {
        msg.edited_ts = edit.edited_ts;
    }
}

fn apply_delete(state: &mut CoreState, delete: &DeleteAck, notices: &mut Vec<Notice>) {
    if !delete.ok {
        notices.push(Notice::DeleteFailed {
            reason: delete
                .reason
                .clone()
                .unwrap_or_else(|| "delete_failed".to_string()),
        });
        return;
    }

    let candidates = candidate_keys(
        state,
        delete.from.as_ref(),
        delete.to.as_ref(),
        delete.room.as_ref(),
    );
    let Some((key, pos)) = locate_by_id(state, &candidates, delete.id) else {
        return;
    };

    let removed = state.conversations.log_mut(&key).remove(pos);
    if let Some(local_id) = removed.local_id {
        state.outbox = state.outbox.remove(&key, &local_id);
    }
}

fn apply_read_ack(state: &mut CoreState, ack: &ReadAck) {
    let key = ConversationKey::dm(&ack.peer);
    let Some(log) = state.conversations.existing_mut(&key) else {
        return;
    };
    for msg in log.iter_mut().filter(|m| m.kind == MessageKind::Out) {
        let Some(id) = msg.id else {
            continue;
        };
        if ack.up_to_id.map_or(true, |up_to| id <= up_to) {
            msg.status = Some(MessageStatus::advance(msg.status, MessageStatus::Read));
        }
    }
}

/// Status implied by a history row's delivery flags. Rows without flags
/// (room posts) only prove the server has the message.
fn row_status(row: &HistoryRow) -> MessageStatus {
    match (row.delivered, row.read) {
        (_, Some(true)) => MessageStatus::Read,
        (Some(true), _) => MessageStatus::Delivered,
        (Some(false), _) => MessageStatus::Queued,
        (None, _) => MessageStatus::Sent,
    }
}

fn message_from_row(row: &HistoryRow, outgoing: bool) -> ConversationMessage {
    ConversationMessage {
        kind: if outgoing {
            MessageKind::Out
        } else {
            MessageKind::In
        },
        id: Some(row.id),
        local_id: row.local_id.clone(),
        from: Some(row.from.clone()),
        status: outgoing.then(|| row_status(row)),
        ts: row.ts,
        text: row.text.clone(),
        attachment: row.attachment.clone(),
        edited: row.edited,
        edited_ts: row.edited_ts,
    }
}

fn apply_history(state: &mut CoreState, page: &HistoryPage) {
    let Some(key) = destination_key(page.peer.as_ref(), page.room.as_ref()) else {
        tracing::debug!("history page without conversation");
        return;
    };
    for row in &page.rows {
        merge_history_row(state, &key, row);
    }
}

/// Optimistic message that a history row without `local_id` most likely
/// confirms: same text, closest timestamp within the match window.
fn closest_optimistic(log: &[ConversationMessage], row: &HistoryRow) -> Option<usize> {
    log.iter()
        .enumerate()
        .filter(|(_, m)| {
            m.is_pending()
                && m.attachment.is_none()
                && m.text == row.text
                && (m.ts - row.ts).abs() <= HISTORY_MATCH_WINDOW_MS
        })
        .min_by_key(|(_, m)| (m.ts - row.ts).abs())
        .map(|(pos, _)| pos)
}

fn merge_history_row(state: &mut CoreState, key: &ConversationKey, row: &HistoryRow) {
    let outgoing = row.from == state.self_id;
    let log = state.conversations.log_mut(key);

    if let Some(pos) = log.iter().position(|m| m.id == Some(row.id)) {
        let msg = &mut log[pos];
        msg.text = row.text.clone();
        msg.attachment = row.attachment.clone();
        if row.edited {
            msg.edited = true;
            msg.edited_ts = row.edited_ts.or(msg.edited_ts);
        }
        if outgoing {
            msg.status = Some(MessageStatus::advance(msg.status, row_status(row)));
        }
        if let Some(local_id) = msg.local_id.clone() {
            state.outbox = state.outbox.remove(key, &local_id);
        }
        return;
    }

    let optimistic = if outgoing {
        row.local_id
            .as_ref()
            .and_then(|local_id| {
                log.iter().position(|m| {
                    m.kind == MessageKind::Out && m.local_id.as_ref() == Some(local_id)
                })
            })
            .or_else(|| {
                if row.attachment.is_none() {
                    closest_optimistic(log, row)
                } else {
                    None
                }
            })
    } else {
        None
    };

    let local_id = match optimistic {
        Some(pos) => {
            let local_id = log[pos].local_id.clone().or_else(|| row.local_id.clone());
            let mut confirmed = message_from_row(row, outgoing);
            confirmed.local_id = local_id.clone();
            log[pos] = confirmed;
            local_id
        }
        None => {
            let pos = log
                .iter()
                .position(|m| m.id.map_or(m.ts > row.ts, |id| id > row.id))
                .unwrap_or(log.len());
            log.insert(pos, message_from_row(row, outgoing));
            row.local_id.clone()
        }
    };

    if let Some(local_id) = local_id {
        state.outbox = state.outbox.remove(key, &local_id);
    }
}
