use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use courier_client::conversation::{MessageKind, MessageStatus};
use courier_client::{
    Courier, CoreUpdate, ManualClock, MessageTransport, Notice, SendError, SendOptions,
};
use courier_shared::protocol::{SendRequest, ServerEvent};
use courier_shared::{ConversationKey, PeerId, Target};
use courier_store::{MemoryKv, OutboxStatus};

const NOW: i64 = 1_700_000_000_000;

#[derive(Default)]
struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<Option<ServerEvent>, SendError>>>,
    sent: Mutex<Vec<SendRequest>>,
}

impl ScriptedTransport {
    fn reply(&self, reply: Result<Option<ServerEvent>, SendError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|r| r.text.clone()).collect()
    }
}

#[async_trait]
impl MessageTransport for ScriptedTransport {
    async fn send(&self, request: &SendRequest) -> Result<Option<ServerEvent>, SendError> {
        self.sent.lock().unwrap().push(request.clone());
        self.replies.lock().unwrap().pop_front().unwrap_or(Ok(None))
    }
}

fn courier_on(kv: Arc<MemoryKv>, transport: Arc<ScriptedTransport>, clock: Arc<ManualClock>) -> Courier {
    Courier::new(PeerId::from("alice"), Box::new(kv), transport).with_clock(clock)
}

fn bob() -> Target {
    Target::Peer(PeerId::from("bob"))
}

fn bob_key() -> ConversationKey {
    ConversationKey::dm(&PeerId::from("bob"))
}

#[tokio::test]
async fn outbox_survives_restart_and_history_confirms_it() {
    let kv = Arc::new(MemoryKv::new());
    let clock = Arc::new(ManualClock::new(NOW));
    let transport = Arc::new(ScriptedTransport::default());

    let local_id = {
        let courier = courier_on(kv.clone(), transport.clone(), clock.clone());
        courier.enqueue(bob(), "see you at 5", SendOptions::default()).unwrap()
    };

    // A fresh process restores the pending message from storage.
    let courier = courier_on(kv.clone(), transport.clone(), clock.clone());
    assert_eq!(courier.restore().unwrap(), 1);
    let log = courier.conversation(&bob_key()).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].local_id.as_ref(), Some(&local_id));
    assert_eq!(log[0].status, Some(MessageStatus::Queued));

    // The server already stored it before the restart: history says so.
    let history = format!(
        r#"{{"type":"history_result","peer":"bob","rows":[
            {{"id":7,"from":"alice","to":"bob","text":"see you at 5","ts":{},"delivered":true,"local_id":"{}"}}
        ]}}"#,
        NOW + 300,
        local_id
    );
    courier.handle_raw(&history).unwrap();

    let log = courier.conversation(&bob_key()).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].id, Some(7));
    assert_eq!(log[0].status, Some(MessageStatus::Delivered));
    assert!(courier.outbox().unwrap().is_empty());

    // Replaying the same page changes nothing.
    let before = courier.snapshot().unwrap();
    courier.handle_raw(&history).unwrap();
    assert_eq!(courier.snapshot().unwrap(), before);

    // Nothing is left to send, and the emptied outbox was deleted on disk.
    courier.set_connected(true).unwrap();
    assert_eq!(courier.drain().await.unwrap().sent, 0);
    assert!(transport.sent_texts().is_empty());
    let reloaded = courier_on(kv, transport, clock);
    assert_eq!(reloaded.restore().unwrap(), 0);
}

#[tokio::test]
async fn rejection_marks_error_and_notifies() {
    let clock = Arc::new(ManualClock::new(NOW));
    let transport = Arc::new(ScriptedTransport::default());
    let courier = courier_on(Arc::new(MemoryKv::new()), transport.clone(), clock);
    let mut updates = courier.subscribe();

    courier.set_connected(true).unwrap();
    let local_id = courier.enqueue(bob(), "hi", SendOptions::default()).unwrap();
    courier.drain().await.unwrap();

    let blocked = format!(
        r#"{{"type":"message_blocked","to":"bob","reason":"blocked by user","local_id":"{local_id}"}}"#
    );
    let notices = courier.handle_raw(&blocked).unwrap();
    assert!(matches!(notices.as_slice(), [Notice::SendRejected { .. }]));

    let entry = courier.outbox().unwrap().find(&bob_key(), &local_id).cloned().unwrap();
    assert_eq!(entry.status, OutboxStatus::Error);
    let log = courier.conversation(&bob_key()).unwrap();
    assert_eq!(log[0].status, Some(MessageStatus::Error));
    assert_eq!(log.last().unwrap().kind, MessageKind::Sys);

    let mut saw_notice = false;
    while let Ok(update) = updates.try_recv() {
        saw_notice |= matches!(update, CoreUpdate::Notice { .. });
    }
    assert!(saw_notice);

    // The same rejection again is a no-op.
    let before = courier.snapshot().unwrap();
    courier.handle_raw(&blocked).unwrap();
    assert_eq!(courier.snapshot().unwrap(), before);
}

#[tokio::test]
async fn rate_limited_send_is_retried_later() {
    let clock = Arc::new(ManualClock::new(NOW));
    let transport = Arc::new(ScriptedTransport::default());
    let courier = courier_on(Arc::new(MemoryKv::new()), transport.clone(), clock.clone());

    transport.reply(Err(SendError::Rejected {
        code: "rate_limited".into(),
    }));
    courier.set_connected(true).unwrap();
    let local_id = courier.enqueue(bob(), "hi", SendOptions::default()).unwrap();

    let report = courier.drain().await.unwrap();
    assert_eq!(report.failed, 1);
    let entry = courier.outbox().unwrap().find(&bob_key(), &local_id).cloned().unwrap();
    assert_eq!(entry.status, OutboxStatus::Queued);
    assert!(courier
        .conversation(&bob_key())
        .unwrap()
        .iter()
        .all(|m| m.kind != MessageKind::Sys));

    clock.advance(60_000);
    assert_eq!(courier.drain().await.unwrap().sent, 1);
    assert_eq!(transport.sent_texts(), vec!["hi", "hi"]);
}

#[tokio::test]
async fn gated_entries_wait_for_schedule_and_presence() {
    let clock = Arc::new(ManualClock::new(NOW));
    let transport = Arc::new(ScriptedTransport::default());
    let courier = courier_on(Arc::new(MemoryKv::new()), transport.clone(), clock.clone());
    courier.set_connected(true).unwrap();

    let later = SendOptions {
        schedule_at: Some(NOW + 60_000),
        ..SendOptions::default()
    };
    courier.enqueue(Target::Peer(PeerId::from("carol")), "later", later).unwrap();
    let when_online = SendOptions {
        when_online: true,
        ..SendOptions::default()
    };
    let bob_lid = courier.enqueue(bob(), "when you're back", when_online).unwrap();

    let report = courier.drain().await.unwrap();
    assert_eq!(report.sent, 0);
    assert_eq!(report.next_wake_at, Some(NOW + 60_000 - 1_200));

    courier.set_peer_online(PeerId::from("bob"), true).unwrap();
    assert_eq!(courier.drain().await.unwrap().sent, 1);
    courier
        .handle_raw(&format!(
            r#"{{"type":"message_delivered","to":"bob","id":3,"local_id":"{bob_lid}"}}"#
        ))
        .unwrap();

    clock.set(NOW + 59_000);
    assert_eq!(courier.drain().await.unwrap().sent, 1);
    assert_eq!(transport.sent_texts(), vec!["when you're back", "later"]);
}

#[tokio::test]
async fn reconnect_requeues_unanswered_sends() {
    let clock = Arc::new(ManualClock::new(NOW));
    let transport = Arc::new(ScriptedTransport::default());
    let courier = courier_on(Arc::new(MemoryKv::new()), transport.clone(), clock.clone());

    courier.set_connected(true).unwrap();
    let local_id = courier.enqueue(bob(), "hi", SendOptions::default()).unwrap();
    courier.drain().await.unwrap();
    let status = |c: &Courier| c.outbox().unwrap().find(&bob_key(), &local_id).unwrap().status;
    assert_eq!(status(&courier), OutboxStatus::Sending);

    courier.set_connected(false).unwrap();
    courier.set_connected(true).unwrap();
    assert_eq!(status(&courier), OutboxStatus::Queued);

    clock.advance(10_000);
    assert_eq!(courier.drain().await.unwrap().sent, 1);
    assert_eq!(transport.sent.lock().unwrap()[1].local_id, local_id);
}
