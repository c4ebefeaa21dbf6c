//! Outbox drain planning and the send-attempt state transitions.
//!
//! Everything here is pure. [`plan_drain`] decides which entries may be sent
//! now; the [`Courier`](crate::Courier) facade performs the network calls
//! and feeds results back through [`mark_sending`] and [`mark_failed`].

use courier_shared::{ConversationKey, LocalId, Target};
use courier_store::{OutboxEntry, OutboxStatus};

use crate::backoff::Backoff;
use crate::conversation::{ConversationMessage, MessageStatus};
use crate::error::SendError;
use crate::reconcile::{describe_send_error, Notice};
use crate::state::CoreState;

#[derive(Debug, Clone, PartialEq)]
pub struct DrainPolicy {
    /// Sends per drain pass, across all conversations.
    pub drain_max: usize,
    /// Scheduled entries due within this window count as due.
    pub schedule_grace_ms: i64,
    /// Wait after the n-th failed attempt.
    pub retry: Backoff,
    /// Retryable failures before an entry turns `Error`.
    pub max_attempts: u32,
    /// In-flight sends older than this are re-queued.
    pub sending_timeout_ms: i64,
}

/// Entries to send now, grouped per conversation in `ts` order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainPlan {
    pub batches: Vec<(ConversationKey, Vec<LocalId>)>,
    /// Earliest time a currently gated entry becomes sendable.
    pub next_wake_at: Option<i64>,
}

impl DrainPlan {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batches.iter().map(|(_, ids)| ids.len()).sum()
    }

    fn wake_at(&mut self, at: i64) {
        self.next_wake_at = Some(self.next_wake_at.map_or(at, |cur| cur.min(at)));
    }
}

/// Select the entries that may be sent at `now`.
///
/// Within a conversation entries go out in `ts` order: an entry that is in
/// flight or waiting out its retry backoff holds back the ones after it.
/// Scheduled and `when_online` entries only hold back themselves.
pub fn plan_drain(state: &CoreState, policy: &DrainPolicy, now: i64) -> DrainPlan {
    let mut plan = DrainPlan::default();
    if !state.connected {
        return plan;
    }

    let mut candidates: Vec<(i64, &ConversationKey, &LocalId)> = Vec::new();
    for (key, entries) in state.outbox.iter() {
        for entry in entries {
            match entry.status {
                OutboxStatus::Sending => break,
                OutboxStatus::Error | OutboxStatus::Sent => continue,
                OutboxStatus::Queued => {}
            }

            if let Some(at) = entry.schedule_at {
                if at > now + policy.schedule_grace_ms {
                    plan.wake_at(at - policy.schedule_grace_ms);
                    continue;
                }
            }

            if entry.when_online && !peer_reachable(state, &entry.target) {
                continue;
            }

            if let Some(ready_at) = retry_ready_at(entry, &policy.retry) {
                if ready_at > now {
                    plan.wake_at(ready_at);
                    break;
                }
            }

            candidates.push((entry.ts, key, &entry.local_id));
        }
    }

    // Oldest first across conversations; each conversation's picks stay a
    // prefix of its queue because its candidates are already ts-ordered.
    candidates.sort_by_key(|(ts, _, _)| *ts);
    candidates.truncate(policy.drain_max);

    for (_, key, local_id) in candidates {
        match plan.batches.iter_mut().find(|(k, _)| k == key) {
            Some((_, ids)) => ids.push(local_id.clone()),
            None => plan.batches.push((key.clone(), vec![local_id.clone()])),
        }
    }

    plan
}

fn peer_reachable(state: &CoreState, target: &Target) -> bool {
    match target {
        Target::Peer(peer) => state.is_online(peer),
        Target::Room(_) => true,
    }
}

fn retry_ready_at(entry: &OutboxEntry, retry: &Backoff) -> Option<i64> {
    if entry.attempts == 0 {
        return None;
    }
    let last = entry.last_attempt_at?;
    Some(last.saturating_add(retry.delay_ms(entry.attempts)))
}

/// Set the status of the optimistic message joined to `local_id`, if it has
/// not been confirmed by the server meanwhile.
fn set_pending_status(
    state: &mut CoreState,
    key: &ConversationKey,
    local_id: &LocalId,
    status: MessageStatus,
) {
    if let Some(pos) = state.conversations.position_by_local_id(key, local_id) {
        let msg = &mut state.conversations.log_mut(key)[pos];
        if msg.id.is_none() {
            msg.status = Some(status);
        }
    }
}

/// Record a send attempt: `Sending`, one more attempt, stamped `now`.
pub fn mark_sending(
    state: &CoreState,
    key: &ConversationKey,
    local_id: &LocalId,
    now: i64,
) -> CoreState {
    let mut next = state.clone();
    next.outbox = state.outbox.update(key, local_id, |entry| {
        entry.status = OutboxStatus::Sending;
        entry.attempts = entry.attempts.saturating_add(1);
        entry.last_attempt_at = Some(now);
    });
    set_pending_status(&mut next, key, local_id, MessageStatus::Sending);
    next
}

/// Record a failed send call.
///
/// Retryable failures put the entry back in the queue until
/// `max_attempts` is reached; everything else leaves it as `Error` with a
/// notice for the user.
pub fn mark_failed(
    state: &CoreState,
    key: &ConversationKey,
    local_id: &LocalId,
    error: &SendError,
    policy: &DrainPolicy,
    now: i64,
) -> (CoreState, Option<Notice>) {
    let Some(entry) = state.outbox.find(key, local_id) else {
        return (state.clone(), None);
    };
    let mut next = state.clone();

    if error.is_retryable() && entry.attempts < policy.max_attempts {
        tracing::debug!(key = %key, local_id = %local_id, attempts = entry.attempts, error = %error, "send failed, will retry");
        next.outbox = state
            .outbox
            .update(key, local_id, |e| e.status = OutboxStatus::Queued);
        set_pending_status(&mut next, key, local_id, MessageStatus::Queued);
        return (next, None);
    }

    next.outbox = state
        .outbox
        .update(key, local_id, |e| e.status = OutboxStatus::Error);
    set_pending_status(&mut next, key, local_id, MessageStatus::Error);

    let notice = match error {
        SendError::Rejected { code } if !error.is_retryable() => {
            next.conversations
                .push(key, ConversationMessage::system(describe_send_error(code), now));
            Notice::SendRejected {
                key: key.clone(),
                local_id: Some(local_id.clone()),
                reason: code.clone(),
            }
        }
        _ => Notice::SendFailed {
            key: key.clone(),
            local_id: local_id.clone(),
            reason: error.to_string(),
        },
    };
    tracing::warn!(key = %key, local_id = %local_id, error = %error, "send failed permanently");
    (next, Some(notice))
}

/// Put in-flight entries back in the queue: all of them when `timeout_ms`
/// is `None` (the connection was lost), otherwise those whose attempt is at
/// least `timeout_ms` old.
pub fn requeue_in_flight(state: &CoreState, now: i64, timeout_ms: Option<i64>) -> CoreState {
    let stale: Vec<(ConversationKey, LocalId)> = state
        .outbox
        .iter()
        .flat_map(|(key, entries)| {
            entries
                .iter()
                .filter(|e| e.status == OutboxStatus::Sending)
                .filter(move |e| match (timeout_ms, e.last_attempt_at) {
                    (Some(timeout), Some(last)) => now - last >= timeout,
                    _ => true,
                })
                .map(move |e| (key.clone(), e.local_id.clone()))
        })
        .collect();

    if stale.is_empty() {
        return state.clone();
    }

    let mut next = state.clone();
    for (key, local_id) in &stale {
        tracing::debug!(key = %key, local_id = %local_id, "re-queueing unanswered send");
        next.outbox = next
            .outbox
            .update(key, local_id, |e| e.status = OutboxStatus::Queued);
        set_pending_status(&mut next, key, local_id, MessageStatus::Queued);
    }
    next
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_shared::{PeerId, RoomId};

    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn policy() -> DrainPolicy {
        DrainPolicy {
            drain_max: 12,
            schedule_grace_ms: 1_200,
            retry: Backoff::new(Duration::from_millis(900), Duration::from_millis(60_000)),
            max_attempts: 3,
            sending_timeout_ms: 30_000,
        }
    }

    fn lid(s: &str) -> LocalId {
        LocalId::parse(s).unwrap()
    }

    fn dm(peer: &str) -> ConversationKey {
        ConversationKey::dm(&PeerId::from(peer))
    }

    fn connected_state() -> CoreState {
        let mut state = CoreState::new(PeerId::from("me"));
        state.connected = true;
        state
    }

    fn queue(state: &mut CoreState, peer: &str, local_id: &str, ts: i64) {
        let entry = OutboxEntry::new(lid(local_id), Target::Peer(PeerId::from(peer)), "hi", ts);
        state.outbox = state.outbox.add(&dm(peer), entry);
        state.conversations.push(
            &dm(peer),
            ConversationMessage::outgoing(lid(local_id), PeerId::from("me"), "hi", ts),
        );
    }

    fn ids(plan: &DrainPlan, key: &ConversationKey) -> Vec<String> {
        plan.batches
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, ids)| ids.iter().map(|i| i.to_string()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn nothing_is_sent_while_disconnected() {
        let mut state = connected_state();
        queue(&mut state, "bob", "a", NOW);
        state.connected = false;
        assert!(plan_drain(&state, &policy(), NOW).is_empty());
    }

    #[test]
    fn entries_go_out_in_ts_order_per_key() {
        let mut state = connected_state();
        queue(&mut state, "bob", "b", NOW + 2);
        queue(&mut state, "bob", "a", NOW + 1);
        queue(&mut state, "eve", "c", NOW);

        let plan = plan_drain(&state, &policy(), NOW + 10);
        assert_eq!(ids(&plan, &dm("bob")), vec!["a", "b"]);
        assert_eq!(ids(&plan, &dm("eve")), vec!["c"]);
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn budget_takes_oldest_entries() {
        let mut state = connected_state();
        queue(&mut state, "bob", "b1", NOW + 1);
        queue(&mut state, "bob", "b2", NOW + 4);
        queue(&mut state, "eve", "e1", NOW + 2);
        queue(&mut state, "eve", "e2", NOW + 3);

        let plan = plan_drain(&state, &DrainPolicy { drain_max: 3, ..policy() }, NOW + 10);
        assert_eq!(ids(&plan, &dm("bob")), vec!["b1"]);
        assert_eq!(ids(&plan, &dm("eve")), vec!["e1", "e2"]);
    }

    #[test]
    fn scheduled_entries_wait_for_their_time() {
        let mut state = connected_state();
        queue(&mut state, "bob", "later", NOW);
        queue(&mut state, "bob", "now", NOW + 1);
        state.outbox = state
            .outbox
            .update(&dm("bob"), &lid("later"), |e| e.schedule_at = Some(NOW + 60_000));

        let plan = plan_drain(&state, &policy(), NOW);
        assert_eq!(ids(&plan, &dm("bob")), vec!["now"]);
        assert_eq!(plan.next_wake_at, Some(NOW + 60_000 - 1_200));

        let plan = plan_drain(&state, &policy(), NOW + 59_000);
        assert_eq!(ids(&plan, &dm("bob")), vec!["later", "now"]);
    }

    #[test]
    fn when_online_waits_for_peer() {
        let mut state = connected_state();
        queue(&mut state, "bob", "a", NOW);
        state.outbox = state
            .outbox
            .update(&dm("bob"), &lid("a"), |e| e.when_online = true);

        assert!(plan_drain(&state, &policy(), NOW).is_empty());
        state.online_peers.insert(PeerId::from("bob"));
        assert_eq!(plan_drain(&state, &policy(), NOW).len(), 1);
    }

    #[test]
    fn when_online_does_not_gate_rooms() {
        let mut state = connected_state();
        let key = ConversationKey::room(&RoomId::from("r1"));
        let mut entry = OutboxEntry::new(lid("a"), Target::Room(RoomId::from("r1")), "hi", NOW);
        entry.when_online = true;
        state.outbox = state.outbox.add(&key, entry);
        assert_eq!(plan_drain(&state, &policy(), NOW).len(), 1);
    }

    #[test]
    fn backoff_holds_back_the_conversation() {
        let mut state = connected_state();
        queue(&mut state, "bob", "a", NOW);
        queue(&mut state, "bob", "b", NOW + 1);
        queue(&mut state, "eve", "c", NOW + 2);
        state = mark_sending(&state, &dm("bob"), &lid("a"), NOW);
        let (failed, notice) = mark_failed(
            &state,
            &dm("bob"),
            &lid("a"),
            &SendError::Transport("reset".into()),
            &policy(),
            NOW,
        );
        assert!(notice.is_none());

        let plan = plan_drain(&failed, &policy(), NOW + 100);
        assert!(ids(&plan, &dm("bob")).is_empty());
        assert_eq!(ids(&plan, &dm("eve")), vec!["c"]);
        assert_eq!(plan.next_wake_at, Some(NOW + 900));

        let plan = plan_drain(&failed, &policy(), NOW + 900);
        assert_eq!(ids(&plan, &dm("bob")), vec!["a", "b"]);
    }

    #[test]
    fn in_flight_entry_blocks_its_key() {
        let mut state = connected_state();
        queue(&mut state, "bob", "a", NOW);
        queue(&mut state, "bob", "b", NOW + 1);
        let state = mark_sending(&state, &dm("bob"), &lid("a"), NOW);

        assert!(plan_drain(&state, &policy(), NOW + 5).is_empty());

        let entry = state.outbox.find(&dm("bob"), &lid("a")).unwrap();
        assert_eq!(entry.status, OutboxStatus::Sending);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_attempt_at, Some(NOW));
        assert_eq!(
            state.conversations.get(&dm("bob"))[0].status,
            Some(MessageStatus::Sending)
        );
    }

    #[test]
    fn errored_entries_are_skipped() {
        let mut state = connected_state();
        queue(&mut state, "bob", "a", NOW);
        queue(&mut state, "bob", "b", NOW + 1);
        state.outbox = state
            .outbox
            .update(&dm("bob"), &lid("a"), |e| e.status = OutboxStatus::Error);
        assert_eq!(ids(&plan_drain(&state, &policy(), NOW), &dm("bob")), vec!["b"]);
    }

    #[test]
    fn retries_are_bounded() {
        let mut state = connected_state();
        queue(&mut state, "bob", "a", NOW);
        let err = SendError::Transport("timeout".into());

        for attempt in 0..2 {
            state = mark_sending(&state, &dm("bob"), &lid("a"), NOW + attempt);
            state = mark_failed(&state, &dm("bob"), &lid("a"), &err, &policy(), NOW).0;
        }
        state = mark_sending(&state, &dm("bob"), &lid("a"), NOW + 2);
        let (state, notice) = mark_failed(&state, &dm("bob"), &lid("a"), &err, &policy(), NOW);

        let entry = state.outbox.find(&dm("bob"), &lid("a")).unwrap();
        assert_eq!(entry.status, OutboxStatus::Error);
        assert!(matches!(notice, Some(Notice::SendFailed { .. })));
        assert_eq!(
            state.conversations.get(&dm("bob"))[0].status,
            Some(MessageStatus::Error)
        );
    }

    #[test]
    fn rejection_is_not_retried() {
        let mut state = connected_state();
        queue(&mut state, "bob", "a", NOW);
        state = mark_sending(&state, &dm("bob"), &lid("a"), NOW);
        let err = SendError::Rejected { code: "bad_recipient".into() };

        let (next, notice) = mark_failed(&state, &dm("bob"), &lid("a"), &err, &policy(), NOW);
        assert_eq!(
            next.outbox.find(&dm("bob"), &lid("a")).unwrap().status,
            OutboxStatus::Error
        );
        let log = next.conversations.get(&dm("bob"));
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].text, "Recipient does not exist");
        assert!(matches!(notice, Some(Notice::SendRejected { .. })));
    }

    #[test]
    fn failure_for_cancelled_entry_is_ignored() {
        let state = connected_state();
        let err = SendError::Transport("x".into());
        let (next, notice) = mark_failed(&state, &dm("bob"), &lid("gone"), &err, &policy(), NOW);
        assert_eq!(next, state);
        assert!(notice.is_none());
    }

    #[test]
    fn requeue_respects_timeout() {
        let mut state = connected_state();
        queue(&mut state, "bob", "old", NOW);
        queue(&mut state, "eve", "fresh", NOW);
        state = mark_sending(&state, &dm("bob"), &lid("old"), NOW);
        state = mark_sending(&state, &dm("eve"), &lid("fresh"), NOW + 25_000);

        let timed_out = requeue_in_flight(&state, NOW + 30_000, Some(30_000));
        assert_eq!(
            timed_out.outbox.find(&dm("bob"), &lid("old")).unwrap().status,
            OutboxStatus::Queued
        );
        assert_eq!(
            timed_out.outbox.find(&dm("eve"), &lid("fresh")).unwrap().status,
            OutboxStatus::Sending
        );

        let all = requeue_in_flight(&state, NOW, None);
        assert!(all
            .outbox
            .iter()
            .all(|(_, entries)| entries.iter().all(|e| e.status == OutboxStatus::Queued)));
        assert_eq!(requeue_in_flight(&all, NOW, None), all);
    }
}
