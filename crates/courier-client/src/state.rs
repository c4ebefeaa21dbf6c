//! Snapshot of everything the delivery core knows.
//!
//! [`CoreState`] is a plain value. The reconciler and the send queue take a
//! snapshot and return the next one; the [`Courier`](crate::Courier) facade
//! owns the current snapshot and writes it back.

use std::collections::BTreeSet;

use courier_shared::PeerId;
use courier_store::OutboxMap;

use crate::conversation::Conversations;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreState {
    /// The signed-in account; history rows from it are outgoing.
    pub self_id: PeerId,

    pub conversations: Conversations,

    /// Messages not yet confirmed by the server.
    pub outbox: OutboxMap,

    /// Peers currently observed online, gating `when_online` entries.
    pub online_peers: BTreeSet<PeerId>,

    /// Connected and authenticated to the server.
    pub connected: bool,
}

impl CoreState {
    pub fn new(self_id: PeerId) -> Self {
        Self {
            self_id,
            conversations: Conversations::new(),
            outbox: OutboxMap::new(),
            online_peers: BTreeSet::new(),
            connected: false,
        }
    }

    pub fn is_online(&self, peer: &PeerId) -> bool {
        self.online_peers.contains(peer)
    }
}
