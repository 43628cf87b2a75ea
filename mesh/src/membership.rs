//! Seams to the external membership protocol
//!
//! The gossip and failure-detection protocol is not implemented here. It is
//! reached through [`Membership`], and it calls back into this crate through
//! the delegate traits below.

use std::{fmt, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A cluster member as reported by the membership protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub address: SocketAddr,
}

impl Node {
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Handle to a running membership protocol instance.
#[async_trait]
pub trait Membership: Send + Sync {
    /// Name of the local node as known to the protocol.
    fn local_name(&self) -> String;

    /// All live members, the local node included.
    fn members(&self) -> Vec<Node>;

    /// Deliver `msg` to `node` over a reliable stream. The receiver sees it
    /// through [`MembershipDelegate::notify_msg`].
    async fn send_reliable(&self, node: &Node, msg: &[u8]) -> anyhow::Result<()>;

    /// Join the cluster through the given addresses, running a push/pull
    /// full-state exchange with each. Returns the number of nodes contacted.
    async fn join(&self, addrs: &[String]) -> anyhow::Result<usize>;

    async fn leave(&self, timeout: Duration) -> anyhow::Result<()>;
}

/// User-data hooks invoked by the membership protocol.
pub trait MembershipDelegate: Send + Sync {
    /// Metadata attached to this node's alive messages.
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A user message arrived, via gossip or a reliable send.
    fn notify_msg(&self, msg: &[u8]);

    /// Pending broadcasts to piggyback on the next gossip packet.
    fn broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Full local state for a push/pull exchange. `None` means the state
    /// is unavailable this round.
    fn local_state(&self, join: bool) -> Option<Vec<u8>>;

    /// Full remote state received during a push/pull exchange.
    fn merge_remote_state(&self, buf: &[u8], join: bool);
}

/// Membership change notifications.
pub trait EventDelegate: Send + Sync {
    fn notify_join(&self, node: &Node);
    fn notify_leave(&self, node: &Node);
    fn notify_update(&self, node: &Node);
}

pub trait PingDelegate: Send + Sync {
    fn ack_payload(&self) -> Vec<u8>;
    fn notify_ping_complete(&self, node: &Node, rtt: Duration, payload: &[u8]);
}

pub trait AliveDelegate: Send + Sync {
    /// Returning an error rejects the alive message.
    fn notify_alive(&self, node: &Node) -> anyhow::Result<()>;
}

pub trait ConflictDelegate: Send + Sync {
    fn notify_conflict(&self, existing: &Node, other: &Node);
}
