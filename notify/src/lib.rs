//! Internal pub/sub of pipeline lifecycle events.
//!
//! Nothing in the node core's data model depends on this crate — it exists
//! so the pieces that *do* want to react to what the pipeline is doing
//! (a `RelayFSM` announcing as soon as an object clears validation instead
//! of waiting for its next poll, a test harness asserting a block went
//! indelible, a wallet-facing RPC layer outside this core's scope) can
//! subscribe without the pipeline stages themselves taking a dependency on
//! any of those consumers. Each topic is a `tokio::sync::broadcast`
//! channel; publishing when nobody is subscribed is a no-op, matching the
//! fire-and-forget semantics the rest of the pipeline expects (§4's object
//! pipeline step 5: "publish ... so other peers' advertisers pick it up
//! without an extra poll", not "publish and block until they have").

use cc_hash::Oid;
use tokio::sync::broadcast;
use tracing::trace;

/// Backlog kept per topic before a slow subscriber starts missing events
/// (`broadcast::Receiver::recv` then returns `Lagged`, which callers should
/// treat the same as having missed nothing in particular — re-poll the
/// authoritative store rather than trying to reconstruct the gap).
const CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectValid {
    pub oid: Oid,
    pub is_block: bool,
    pub seqnum: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIndelible {
    pub oid: Oid,
    pub level: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnected {
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDisconnected {
    pub peer_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchConfirmed {
    pub buy_seqnum: i64,
    pub sell_seqnum: i64,
}

/// One broadcast sender per topic. Cloning a [`NotifyController`] is cheap
/// (each field is an `Arc`-backed `Sender` clone) and every clone publishes
/// to, and can subscribe from, the same set of topics.
#[derive(Clone)]
pub struct NotifyController {
    object_valid: broadcast::Sender<ObjectValid>,
    block_indelible: broadcast::Sender<BlockIndelible>,
    peer_connected: broadcast::Sender<PeerConnected>,
    peer_disconnected: broadcast::Sender<PeerDisconnected>,
    match_confirmed: broadcast::Sender<MatchConfirmed>,
}

impl Default for NotifyController {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyController {
    pub fn new() -> Self {
        NotifyController {
            object_valid: broadcast::channel(CHANNEL_CAPACITY).0,
            block_indelible: broadcast::channel(CHANNEL_CAPACITY).0,
            peer_connected: broadcast::channel(CHANNEL_CAPACITY).0,
            peer_disconnected: broadcast::channel(CHANNEL_CAPACITY).0,
            match_confirmed: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe_object_valid(&self) -> broadcast::Receiver<ObjectValid> {
        self.object_valid.subscribe()
    }

    pub fn subscribe_block_indelible(&self) -> broadcast::Receiver<BlockIndelible> {
        self.block_indelible.subscribe()
    }

    pub fn subscribe_peer_connected(&self) -> broadcast::Receiver<PeerConnected> {
        self.peer_connected.subscribe()
    }

    pub fn subscribe_peer_disconnected(&self) -> broadcast::Receiver<PeerDisconnected> {
        self.peer_disconnected.subscribe()
    }

    pub fn subscribe_match_confirmed(&self) -> broadcast::Receiver<MatchConfirmed> {
        self.match_confirmed.subscribe()
    }

    pub fn notify_object_valid(&self, event: ObjectValid) {
        publish(&self.object_valid, event, "object_valid");
    }

    pub fn notify_block_indelible(&self, event: BlockIndelible) {
        publish(&self.block_indelible, event, "block_indelible");
    }

    pub fn notify_peer_connected(&self, event: PeerConnected) {
        publish(&self.peer_connected, event, "peer_connected");
    }

    pub fn notify_peer_disconnected(&self, event: PeerDisconnected) {
        publish(&self.peer_disconnected, event, "peer_disconnected");
    }

    pub fn notify_match_confirmed(&self, event: MatchConfirmed) {
        publish(&self.match_confirmed, event, "match_confirmed");
    }
}

fn publish<T: Clone>(sender: &broadcast::Sender<T>, event: T, topic: &str) {
    // `send` only errors when there are no receivers; that's the normal
    // state whenever nothing happens to be subscribed right now.
    if sender.send(event).is_err() {
        trace!(topic, "notify: no subscribers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let ctrl = NotifyController::new();
        let mut rx = ctrl.subscribe_object_valid();

        let event = ObjectValid { oid: Oid::ZERO, is_block: false, seqnum: 7 };
        ctrl.notify_object_valid(event);

        let got = rx.recv().await.unwrap();
        assert_eq!(got, event);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let ctrl = NotifyController::new();
        ctrl.notify_block_indelible(BlockIndelible { oid: Oid::ZERO, level: 1 });
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_a_copy() {
        let ctrl = NotifyController::new();
        let mut a = ctrl.subscribe_peer_connected();
        let mut b = ctrl.subscribe_peer_connected();

        ctrl.notify_peer_connected(PeerConnected { peer_id: "peer-1".into() });

        assert_eq!(a.recv().await.unwrap().peer_id, "peer-1");
        assert_eq!(b.recv().await.unwrap().peer_id, "peer-1");
    }

    #[tokio::test]
    async fn cloned_controller_shares_topics() {
        let ctrl = NotifyController::new();
        let ctrl2 = ctrl.clone();
        let mut rx = ctrl.subscribe_match_confirmed();

        ctrl2.notify_match_confirmed(MatchConfirmed { buy_seqnum: 1, sell_seqnum: 2 });

        let got = rx.recv().await.unwrap();
        assert_eq!(got.buy_seqnum, 1);
        assert_eq!(got.sell_seqnum, 2);
    }
}
