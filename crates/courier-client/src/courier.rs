//! The [`Courier`] facade: owns the current [`CoreState`], persists the
//! outbox, drives the send queue and broadcasts [`CoreUpdate`]s.
//!
//! All state transitions are computed by the pure functions in
//! [`reconcile`](crate::reconcile) and [`drain`](crate::drain). The state
//! lock is never held across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use courier_shared::protocol::{SendRequest, ServerEvent};
use courier_shared::{ConversationKey, LocalId, PeerId, ProtocolError, Target};
use courier_store::outbox::normalize_text;
use courier_store::{
    load_outbox, save_outbox, KvStore, OutboxEntry, OutboxMap, OutboxStatus, TransferHistory,
    TransferHistoryEntry,
};
use futures::future::join_all;
use tokio::sync::broadcast;

use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::conversation::{ConversationMessage, MessageStatus};
use crate::drain::{mark_failed, mark_sending, plan_drain, requeue_in_flight, DrainPolicy};
use crate::error::{CoreError, SendError};
use crate::events::{diff_updates, emit, CoreUpdate, UPDATE_CHANNEL_CAPACITY};
use crate::reconcile::{reconcile, Notice};
use crate::schedule::ScheduleGate;
use crate::state::CoreState;
use crate::transfers::{TransferMeta, TransferTracker};

/// Writes send requests to the server.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Send one message. A transport that gets the server's answer inline
    /// returns it; otherwise the answer arrives later through
    /// [`Courier::handle_event`].
    async fn send(&self, request: &SendRequest) -> Result<Option<ServerEvent>, SendError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Send at this epoch-ms time instead of now.
    pub schedule_at: Option<i64>,
    /// Hold until the peer is online. Direct conversations only.
    pub when_online: bool,
    pub silent: bool,
    /// Board posts have a shorter scheduling horizon.
    pub board_post: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub failed: usize,
    /// When to drain again for entries gated by a schedule or backoff.
    pub next_wake_at: Option<i64>,
}

struct Inner {
    state: CoreState,
    transfers: TransferTracker,
    kv: Box<dyn KvStore>,
}

pub struct Courier {
    inner: Mutex<Inner>,
    transport: Arc<dyn MessageTransport>,
    clock: Arc<dyn Clock>,
    policy: DrainPolicy,
    updates: broadcast::Sender<CoreUpdate>,
}

impl Courier {
    pub fn new(self_id: PeerId, kv: Box<dyn KvStore>, transport: Arc<dyn MessageTransport>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                state: CoreState::new(self_id),
                transfers: TransferTracker::new(),
                kv,
            }),
            transport,
            clock: Arc::new(SystemClock),
            policy: ClientConfig::default().drain_policy(),
            updates,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: &ClientConfig) -> Self {
        self.policy = config.drain_policy();
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreUpdate> {
        self.updates.subscribe()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, CoreError> {
        self.inner.lock().map_err(|_| CoreError::LockPoisoned)
    }

    /// Apply `f` to a copy of the state. On success the outbox is persisted
    /// if it changed, the copy becomes current and updates are broadcast.
    /// On error nothing changes.
    fn commit<T>(
        &self,
        f: impl FnOnce(&mut CoreState, &mut Vec<Notice>) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let (value, updates) = {
            let mut inner = self.lock()?;
            let mut next = inner.state.clone();
            let mut notices = Vec::new();
            let value = f(&mut next, &mut notices)?;

            if next.outbox != inner.state.outbox {
                save_outbox(inner.kv.as_ref(), next.self_id.as_str(), &next.outbox)?;
            }
            let updates = diff_updates(&inner.state, &next, &notices);
            inner.state = next;
            (value, updates)
        };

        for update in updates {
            emit(&self.updates, update);
        }
        Ok(value)
    }

    pub fn snapshot(&self) -> Result<CoreState, CoreError> {
        Ok(self.lock()?.state.clone())
    }

    pub fn conversation(&self, key: &ConversationKey) -> Result<Vec<ConversationMessage>, CoreError> {
        Ok(self.lock()?.state.conversations.get(key).to_vec())
    }

    pub fn outbox(&self) -> Result<OutboxMap, CoreError> {
        Ok(self.lock()?.state.outbox.clone())
    }

    /// Load the persisted outbox and transfer history. Outbox entries whose
    /// message is missing from its conversation get their optimistic copy
    /// back. Returns the number of entries loaded.
    pub fn restore(&self) -> Result<usize, CoreError> {
        let loaded = {
            let mut inner = self.lock()?;
            let user = inner.state.self_id.as_str().to_string();
            let transfers = TransferTracker::load(inner.kv.as_ref(), &user)?;
            inner.transfers = transfers;
            load_outbox(inner.kv.as_ref(), &user)?
        };

        let count = loaded.len();
        self.commit(|state, _| {
            for (key, entries) in loaded.iter() {
                for entry in entries {
                    state.outbox = state.outbox.add(key, entry.clone());
                    if state
                        .conversations
                        .position_by_local_id(key, &entry.local_id)
                        .is_none()
                    {
                        insert_optimistic(state, key, entry);
                    }
                }
            }
            Ok(())
        })?;

        tracing::info!(entries = count, "outbox restored");
        Ok(count)
    }

    /// Queue a message and show it optimistically. Call [`Self::drain`] to
    /// send it.
    pub fn enqueue(&self, target: Target, text: &str, options: SendOptions) -> Result<LocalId, CoreError> {
        let text = normalize_text(text).ok_or(CoreError::InvalidMessage("message text is empty"))?;
        let key = target.conversation_key();
        if ConversationKey::parse(key.as_str()).is_none() {
            return Err(ProtocolError::InvalidConversationKey(key.to_string()).into());
        }
        if options.when_online && target.peer().is_none() {
            return Err(CoreError::InvalidMessage(
                "only direct messages can wait for the peer",
            ));
        }

        let now = self.clock.now_ms();
        let schedule_at = match options.schedule_at {
            Some(at) => {
                let gate = if options.board_post {
                    ScheduleGate::BOARD_POST
                } else {
                    ScheduleGate::MESSAGE
                };
                Some(gate.clamp(at, now)?)
            }
            None => None,
        };

        let local_id = LocalId::generate();
        let mut entry = OutboxEntry::new(local_id.clone(), target, text.clone(), now);
        entry.schedule_at = schedule_at;
        entry.when_online = options.when_online;
        entry.silent = options.silent;

        self.commit(|state, _| {
            let outbox = state.outbox.add(&key, entry);
            if outbox.find(&key, &local_id).is_none() {
                return Err(CoreError::InvalidMessage("message could not be queued"));
            }
            state.outbox = outbox;
            let message =
                ConversationMessage::outgoing(local_id.clone(), state.self_id.clone(), text, now);
            state.conversations.push(&key, message);
            Ok(())
        })?;

        tracing::debug!(key = %key, local_id = %local_id, scheduled = schedule_at.is_some(), "message queued");
        Ok(local_id)
    }

    /// Drop a message the server has not confirmed, in any outbox status.
    /// An answer to a send already in flight is ignored once it arrives.
    pub fn cancel(&self, key: &ConversationKey, local_id: &LocalId) -> Result<(), CoreError> {
        self.commit(|state, _| {
            find_entry(state, key, local_id)?;
            state.outbox = state.outbox.remove(key, local_id);
            if let Some(log) = state.conversations.existing_mut(key) {
                log.retain(|m| !(m.id.is_none() && m.local_id.as_ref() == Some(local_id)));
            }
            Ok(())
        })
    }

    /// Replace the text of a message the server has not confirmed. A send
    /// already in flight keeps the old text; a retry uses the new one.
    pub fn edit_pending(
        &self,
        key: &ConversationKey,
        local_id: &LocalId,
        text: &str,
    ) -> Result<(), CoreError> {
        let text = normalize_text(text).ok_or(CoreError::InvalidMessage("message text is empty"))?;
        self.commit(|state, _| {
            find_entry(state, key, local_id)?;
            state.outbox = state
                .outbox
                .update(key, local_id, |e| e.text = text.clone());
            if let Some(pos) = state.conversations.position_by_local_id(key, local_id) {
                state.conversations.log_mut(key)[pos].text = text;
            }
            Ok(())
        })
    }

    /// Put a failed message back in the queue with a fresh attempt budget.
    pub fn retry(&self, key: &ConversationKey, local_id: &LocalId) -> Result<(), CoreError> {
        self.commit(|state, _| {
            let entry = find_entry(state, key, local_id)?;
            if entry.status != OutboxStatus::Error {
                return Err(CoreError::NotRetryable(local_id.to_string()));
            }
            state.outbox = state.outbox.update(key, local_id, |e| {
                e.status = OutboxStatus::Queued;
                e.attempts = 0;
                e.last_attempt_at = None;
            });
            if let Some(pos) = state.conversations.position_by_local_id(key, local_id) {
                state.conversations.log_mut(key)[pos].status = Some(MessageStatus::Queued);
            }
            Ok(())
        })
    }

    /// Fold a server event into the state. Returns the notices it produced.
    pub fn handle_event(&self, event: &ServerEvent) -> Result<Vec<Notice>, CoreError> {
        let now = self.clock.now_ms();
        self.commit(|state, notices| {
            let reconciled = reconcile(state, event, now);
            *state = reconciled.state;
            notices.extend(reconciled.notices.iter().cloned());
            Ok(reconciled.notices)
        })
    }

    pub fn handle_raw(&self, raw: &str) -> Result<Vec<Notice>, CoreError> {
        let event = ServerEvent::from_json(raw)?;
        self.handle_event(&event)
    }

    /// Sends in flight when the connection came back will never be answered,
    /// so they return to the queue.
    pub fn set_connected(&self, connected: bool) -> Result<(), CoreError> {
        let now = self.clock.now_ms();
        self.commit(|state, _| {
            let was_connected = state.connected;
            state.connected = connected;
            if connected && !was_connected {
                *state = requeue_in_flight(state, now, None);
            }
            Ok(())
        })?;
        tracing::info!(connected, "connection state changed");
        Ok(())
    }

    pub fn set_peer_online(&self, peer: PeerId, online: bool) -> Result<(), CoreError> {
        self.commit(|state, _| {
            if online {
                state.online_peers.insert(peer);
            } else {
                state.online_peers.remove(&peer);
            }
            Ok(())
        })
    }

    /// Send what is due. Conversations are drained concurrently, each one
    /// strictly in order and stopping at its first failure.
    pub async fn drain(&self) -> Result<DrainReport, CoreError> {
        let now = self.clock.now_ms();
        let policy = &self.policy;
        let plan = self.commit(|state, _| {
            *state = requeue_in_flight(state, now, Some(policy.sending_timeout_ms));
            Ok(plan_drain(state, policy, now))
        })?;

        let mut report = DrainReport {
            next_wake_at: plan.next_wake_at,
            ..DrainReport::default()
        };
        if plan.is_empty() {
            return Ok(report);
        }
        tracing::debug!(entries = plan.len(), conversations = plan.batches.len(), "draining outbox");

        let runs = plan
            .batches
            .into_iter()
            .map(|(key, ids)| self.drain_conversation(key, ids));
        for result in join_all(runs).await {
            let (sent, failed) = result?;
            report.sent += sent;
            report.failed += failed;
        }
        Ok(report)
    }

    async fn drain_conversation(
        &self,
        key: ConversationKey,
        ids: Vec<LocalId>,
    ) -> Result<(usize, usize), CoreError> {
        let mut sent = 0;
        for local_id in ids {
            let now = self.clock.now_ms();
            let next = self.commit(|state, _| {
                let Some(entry) = state.outbox.find(&key, &local_id) else {
                    return Ok(NextSend::Removed);
                };
                if entry.status != OutboxStatus::Queued {
                    return Ok(NextSend::Blocked);
                }
                let request = SendRequest {
                    target: entry.target.clone(),
                    text: entry.text.clone(),
                    local_id: local_id.clone(),
                    silent: entry.silent,
                };
                *state = mark_sending(state, &key, &local_id, now);
                Ok(NextSend::Send(request))
            })?;
            let request = match next {
                NextSend::Send(request) => request,
                NextSend::Removed => continue,
                // Another drain owns this entry; later ones must wait for it.
                NextSend::Blocked => {
                    tracing::debug!(key = %key, local_id = %local_id, "conversation busy, stopping batch");
                    break;
                }
            };

            match self.transport.send(&request).await {
                Ok(reply) => {
                    sent += 1;
                    if let Some(event) = reply {
                        self.apply_reply(&key, &local_id, &event)?;
                    }
                }
                Err(error) => {
                    let now = self.clock.now_ms();
                    self.commit(|state, notices| {
                        let (next, notice) =
                            mark_failed(state, &key, &local_id, &error, &self.policy, now);
                        *state = next;
                        notices.extend(notice);
                        Ok(())
                    })?;
                    return Ok((sent, 1));
                }
            }
        }
        Ok((sent, 0))
    }

    /// Fold the inline answer to a send, unless the entry was cancelled
    /// while the call was in flight.
    fn apply_reply(
        &self,
        key: &ConversationKey,
        local_id: &LocalId,
        event: &ServerEvent,
    ) -> Result<(), CoreError> {
        let now = self.clock.now_ms();
        self.commit(|state, notices| {
            if state.outbox.find(key, local_id).is_none() {
                tracing::debug!(key = %key, local_id = %local_id, "entry cancelled during send, reply ignored");
                return Ok(());
            }
            let reconciled = reconcile(state, event, now);
            *state = reconciled.state;
            notices.extend(reconciled.notices);
            Ok(())
        })
    }

    /// Start tracking an incoming file.
    pub fn begin_download(&self, meta: TransferMeta, url: &str) -> Result<(), CoreError> {
        let id = meta.id.clone();
        self.lock()?.transfers.begin_download(meta, url);
        emit(&self.updates, CoreUpdate::TransferChanged { id });
        Ok(())
    }

    pub fn begin_upload(&self, meta: TransferMeta, url: Option<String>) -> Result<(), CoreError> {
        let id = meta.id.clone();
        self.lock()?.transfers.begin_upload(meta, url);
        emit(&self.updates, CoreUpdate::TransferChanged { id });
        Ok(())
    }

    pub fn transfer_progress(&self, id: &str, done: u64) -> Result<Option<u8>, CoreError> {
        let progress = self.lock()?.transfers.update_progress(id, done);
        if progress.is_some() {
            emit(&self.updates, CoreUpdate::TransferChanged { id: id.to_string() });
        }
        Ok(progress)
    }

    /// End a transfer and persist the history.
    pub fn finish_transfer(
        &self,
        id: &str,
        result: Result<(), String>,
    ) -> Result<Option<TransferHistoryEntry>, CoreError> {
        self.close_transfer(id, |t| t.finish(id, result))
    }

    pub fn reject_transfer(&self, id: &str) -> Result<Option<TransferHistoryEntry>, CoreError> {
        self.close_transfer(id, |t| t.reject(id))
    }

    fn close_transfer(
        &self,
        id: &str,
        f: impl FnOnce(&mut TransferTracker) -> Option<TransferHistoryEntry>,
    ) -> Result<Option<TransferHistoryEntry>, CoreError> {
        let entry = {
            let mut inner = self.lock()?;
            let entry = f(&mut inner.transfers);
            if entry.is_some() {
                let user = inner.state.self_id.as_str().to_string();
                inner.transfers.save(inner.kv.as_ref(), &user)?;
            }
            entry
        };
        if entry.is_some() {
            emit(&self.updates, CoreUpdate::TransferChanged { id: id.to_string() });
        }
        Ok(entry)
    }

    pub fn transfer_history(&self) -> Result<TransferHistory, CoreError> {
        Ok(self.lock()?.transfers.history().clone())
    }
}

enum NextSend {
    Send(SendRequest),
    Removed,
    Blocked,
}

fn find_entry(
    state: &CoreState,
    key: &ConversationKey,
    local_id: &LocalId,
) -> Result<OutboxEntry, CoreError> {
    state
        .outbox
        .find(key, local_id)
        .cloned()
        .ok_or_else(|| CoreError::UnknownEntry {
            key: key.to_string(),
            local_id: local_id.to_string(),
        })
}

/// Re-create the optimistic message of a persisted entry, in `ts` order.
fn insert_optimistic(state: &mut CoreState, key: &ConversationKey, entry: &OutboxEntry) {
    let mut message = ConversationMessage::outgoing(
        entry.local_id.clone(),
        state.self_id.clone(),
        entry.text.clone(),
        entry.ts,
    );
    if entry.status == OutboxStatus::Error {
        message.status = Some(MessageStatus::Error);
    }
    let log = state.conversations.log_mut(key);
    let pos = log.iter().position(|m| m.ts > entry.ts).unwrap_or(log.len());
    log.insert(pos, message);
}
