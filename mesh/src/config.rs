//! Cluster synchronization configuration
//!
//! Defaults mirror the LAN profile of the underlying membership protocol.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};

/// Maximum size of a single gossip packet. Payloads above half of this are
/// delivered point-to-point instead.
pub const MAX_GOSSIP_PACKET_SIZE: usize = 1400;

/// Number of oversize messages that may wait for point-to-point delivery.
pub const OVERSIZE_QUEUE_CAPACITY: usize = 200;

/// Hard cap on pending entries in the reliable broadcast queue.
pub const MAX_QUEUE_SIZE: usize = 4096;

/// How often the broadcast queue depth is checked.
pub const QUEUE_DEPTH_INTERVAL: Duration = Duration::from_secs(15 * 60);

pub const DEFAULT_RETRANSMIT_MULT: usize = 4;
pub const DEFAULT_RELIABLE_SEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_OVERSIZE_SEND_CONCURRENCY: usize = 32;
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// Consecutive stable membership polls required before a peer is settled.
pub const NUM_OK_REQUIRED: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Node name; a random one is generated when empty
    pub name: String,
    pub max_gossip_packet_size: usize,
    pub oversize_queue_capacity: usize,
    pub max_queue_size: usize,
    pub queue_depth_interval_secs: u64,
    pub retransmit_mult: usize,
    pub reliable_send_timeout_secs: u64,
    /// Cap on concurrent point-to-point sends per oversize message.
    /// `None` fans out to every peer at once.
    pub oversize_send_concurrency: Option<usize>,
    pub reconnect_interval_secs: u64,
    pub reconnect_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_gossip_packet_size: MAX_GOSSIP_PACKET_SIZE,
            oversize_queue_capacity: OVERSIZE_QUEUE_CAPACITY,
            max_queue_size: MAX_QUEUE_SIZE,
            queue_depth_interval_secs: QUEUE_DEPTH_INTERVAL.as_secs(),
            retransmit_mult: DEFAULT_RETRANSMIT_MULT,
            reliable_send_timeout_secs: DEFAULT_RELIABLE_SEND_TIMEOUT.as_secs(),
            oversize_send_concurrency: Some(DEFAULT_OVERSIZE_SEND_CONCURRENCY),
            reconnect_interval_secs: DEFAULT_RECONNECT_INTERVAL.as_secs(),
            reconnect_timeout_secs: DEFAULT_RECONNECT_TIMEOUT.as_secs(),
        }
    }
}

impl ClusterConfig {
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> ClusterResult<()> {
        if self.max_gossip_packet_size == 0 {
            return Err(ClusterError::Config(
                "max_gossip_packet_size must be greater than zero".to_string(),
            ));
        }
        if self.oversize_queue_capacity == 0 {
            return Err(ClusterError::Config(
                "oversize_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(ClusterError::Config(
                "max_queue_size must be greater than zero".to_string(),
            ));
        }
        if self.retransmit_mult == 0 {
            return Err(ClusterError::Config(
                "retransmit_mult must be greater than zero".to_string(),
            ));
        }
        if self.queue_depth_interval_secs == 0 {
            return Err(ClusterError::Config(
                "queue_depth_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.oversize_send_concurrency == Some(0) {
            return Err(ClusterError::Config(
                "oversize_send_concurrency must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn queue_depth_interval(&self) -> Duration {
        Duration::from_secs(self.queue_depth_interval_secs)
    }

    /// Zero disables the per-send timeout.
    pub fn reliable_send_timeout(&self) -> Option<Duration> {
        (self.reliable_send_timeout_secs > 0)
            .then(|| Duration::from_secs(self.reliable_send_timeout_secs))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }
}
