//! Membership protocol delegate
//!
//! Bridges the callbacks of the membership protocol to the peer's state
//! registry and broadcast queue. Errors never propagate back into the
//! protocol; they are logged and the message or call is abandoned.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    time::{interval_at, Instant},
};
use tracing::{debug, warn, Instrument};

use super::{
    channel::stopped,
    error::{ClusterError, ClusterResult},
    membership::{
        AliveDelegate, ConflictDelegate, EventDelegate, MembershipDelegate, Node, PingDelegate,
    },
    metrics::{self, MSG_TYPE_FULL_STATE, MSG_TYPE_UPDATE},
    peer::Peer,
    proto::{FullState, Part},
};

pub struct Delegate {
    peer: Arc<Peer>,
}

impl std::fmt::Debug for Delegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delegate")
            .field("peer", &self.peer.name())
            .finish()
    }
}

impl Delegate {
    /// Create the delegate for `peer` and start its queue-depth governor.
    pub fn new(peer: Arc<Peer>) -> Arc<Self> {
        let delegate = Arc::new(Self { peer });

        let period = delegate.peer.config().queue_depth_interval();
        let stop = delegate.peer.stop_signal();
        let span = tracing::info_span!("queue_depth", peer = %delegate.peer.name());
        tokio::spawn(
            delegate
                .clone()
                .handle_queue_depth(period, stop)
                .instrument(span),
        );

        delegate
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Prune the broadcast queue down to the configured cap if it has grown
    /// past it. Returns the number of dropped messages.
    pub fn prune_queue(&self) -> usize {
        let queue = self.peer.broadcast_queue();
        let limit = self.peer.config().max_queue_size;
        let current = queue.num_queued();
        if current <= limit {
            return 0;
        }

        warn!(current, limit, "Dropping messages because too many are queued");
        let pruned = queue.prune(limit);
        metrics::record_pruned(pruned);
        metrics::set_queued(queue.num_queued());
        pruned
    }

    async fn handle_queue_depth(
        self: Arc<Self>,
        period: Duration,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = ticker.tick() => {
                    self.prune_queue();
                }
            }
        }
        debug!("Queue depth governor stopped");
    }

    fn handle_msg(&self, msg: &[u8]) -> ClusterResult<()> {
        let part = Part::from_bytes(msg)?;
        self.peer.states().merge(&part)
    }

    fn encode_local_state(&self) -> ClusterResult<Vec<u8>> {
        let parts = self.peer.states().snapshot_all()?;
        Ok(FullState { parts }.to_bytes())
    }

    /// Merge every part of a remote full state. Unknown keys are skipped;
    /// the first merge error aborts the remaining parts.
    fn merge_full_state(&self, buf: &[u8]) -> ClusterResult<usize> {
        let full_state = FullState::from_bytes(buf)?;
        let mut merged = 0;
        for part in &full_state.parts {
            match self.peer.states().merge(part) {
                Ok(()) => merged += 1,
                Err(ClusterError::UnknownKey(key)) => {
                    warn!(len = buf.len(), key = %key, "Unknown state key");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(merged)
    }
}

impl MembershipDelegate for Delegate {
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    fn notify_msg(&self, msg: &[u8]) {
        metrics::record_received(MSG_TYPE_UPDATE, msg.len());

        match self.handle_msg(msg) {
            Ok(()) => {}
            Err(err @ ClusterError::Decode { .. }) => {
                warn!(error = %err, "Decode broadcast");
            }
            Err(ClusterError::UnknownKey(key)) => {
                debug!(key = %key, "Dropping broadcast for unknown state key");
            }
            Err(err) => {
                warn!(error = %err, "Merge broadcast");
            }
        }
    }

    fn broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let queue = self.peer.broadcast_queue();
        let msgs = queue.get_broadcasts(overhead, limit);
        if !msgs.is_empty() {
            let size = msgs.iter().map(Vec::len).sum();
            metrics::record_sent(MSG_TYPE_UPDATE, msgs.len(), size);
        }
        metrics::set_queued(queue.num_queued());
        msgs
    }

    fn local_state(&self, _join: bool) -> Option<Vec<u8>> {
        match self.encode_local_state() {
            Ok(buf) => {
                metrics::record_sent(MSG_TYPE_FULL_STATE, 1, buf.len());
                Some(buf)
            }
            Err(err) => {
                warn!(error = %err, "Encode local state");
                None
            }
        }
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        metrics::record_received(MSG_TYPE_FULL_STATE, buf.len());

        match self.merge_full_state(buf) {
            Ok(merged) => debug!(parts = merged, join, "Merged remote state"),
            Err(err) => warn!(error = %err, join, "Merge remote state"),
        }
    }
}

impl EventDelegate for Delegate {
    fn notify_join(&self, node: &Node) {
        debug!(node = %node.name, addr = %node.address, "NotifyJoin");
        self.peer.peer_join(node);
    }

    fn notify_leave(&self, node: &Node) {
        debug!(node = %node.name, addr = %node.address, "NotifyLeave");
        self.peer.peer_leave(node);
    }

    fn notify_update(&self, node: &Node) {
        debug!(node = %node.name, addr = %node.address, "NotifyUpdate");
        self.peer.peer_update(node);
    }
}

impl PingDelegate for Delegate {
    fn ack_payload(&self) -> Vec<u8> {
        Vec::new()
    }

    fn notify_ping_complete(&self, node: &Node, rtt: Duration, _payload: &[u8]) {
        debug!(node = %node.name, rtt = ?rtt, "Completed ping");
        metrics::record_ping(rtt);
    }
}

impl AliveDelegate for Delegate {
    fn notify_alive(&self, node: &Node) -> anyhow::Result<()> {
        debug!(node = %node.name, "Alive");
        Ok(())
    }
}

impl ConflictDelegate for Delegate {
    fn notify_conflict(&self, existing: &Node, other: &Node) {
        warn!(
            peer = %existing.name,
            existing = %existing.address,
            other = %other.address,
            "Found conflicting peer IDs"
        );
    }
}
