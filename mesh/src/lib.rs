//! Mesh Cluster State Synchronization
//!
//! This crate keeps replicated state consistent across the nodes of a mesh cluster,
//! on top of an external gossip membership protocol:
//! - Keyed state registry with merge and snapshot hooks
//! - Per-key broadcast channels with point-to-point delivery for oversized deltas
//! - Membership delegate for gossip, push/pull full-state exchange and member events
//! - Bounded retransmit queue for the gossip path
//! - Peer bookkeeping: settle, reconnect and failed-peer expiry

pub mod broadcast_queue;
pub mod channel;
pub mod config;
pub mod delegate;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod peer;
pub mod proto;
pub mod stores;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use broadcast_queue::BroadcastQueue;
pub use channel::{Channel, Transport};
pub use config::ClusterConfig;
pub use delegate::Delegate;
pub use error::{ClusterError, ClusterResult};
pub use membership::{
    AliveDelegate, ConflictDelegate, EventDelegate, Membership, MembershipDelegate, Node,
    PingDelegate,
};
pub use peer::{ClusterStatus, Peer, PeerRecord, PeerStatus};
pub use proto::{FullState, Part};
pub use stores::{State, StateRegistry};
