//! Metrics emitted by the synchronization layer
//!
//! Recorded through the `metrics` facade; installing an exporter is up to
//! the embedding process.

use std::time::Duration;

use ::metrics::{counter, gauge, histogram};

pub const MSG_TYPE_UPDATE: &str = "update";
pub const MSG_TYPE_FULL_STATE: &str = "full_state";

const OVERSIZE_SENT: &str = "mesh_cluster_oversize_gossip_message_sent_total";
const OVERSIZE_DROPPED: &str = "mesh_cluster_oversize_gossip_message_dropped_total";
const OVERSIZE_FAILURE: &str = "mesh_cluster_oversize_gossip_message_failure_total";
const OVERSIZE_DURATION: &str = "mesh_cluster_oversize_gossip_message_duration_seconds";
const MESSAGES_RECEIVED: &str = "mesh_cluster_messages_received_total";
const MESSAGES_RECEIVED_SIZE: &str = "mesh_cluster_messages_received_size_total";
const MESSAGES_SENT: &str = "mesh_cluster_messages_sent_total";
const MESSAGES_SENT_SIZE: &str = "mesh_cluster_messages_sent_size_total";
const MESSAGES_PRUNED: &str = "mesh_cluster_messages_pruned_total";
const MESSAGES_QUEUED: &str = "mesh_cluster_messages_queued";
const MEMBERS: &str = "mesh_cluster_members";
const FAILED_PEERS: &str = "mesh_cluster_failed_peers";
const PING_DURATION: &str = "mesh_cluster_node_ping_duration_seconds";

pub fn record_oversize_sent(key: &str, elapsed: Duration) {
    counter!(OVERSIZE_SENT, "key" => key.to_string()).increment(1);
    histogram!(OVERSIZE_DURATION, "key" => key.to_string()).record(elapsed.as_secs_f64());
}

pub fn record_oversize_dropped(key: &str) {
    counter!(OVERSIZE_DROPPED, "key" => key.to_string()).increment(1);
}

pub fn record_oversize_failure(key: &str) {
    counter!(OVERSIZE_FAILURE, "key" => key.to_string()).increment(1);
}

pub fn record_received(msg_type: &'static str, size: usize) {
    counter!(MESSAGES_RECEIVED, "msg_type" => msg_type).increment(1);
    counter!(MESSAGES_RECEIVED_SIZE, "msg_type" => msg_type).increment(size as u64);
}

pub fn record_sent(msg_type: &'static str, count: usize, size: usize) {
    counter!(MESSAGES_SENT, "msg_type" => msg_type).increment(count as u64);
    counter!(MESSAGES_SENT_SIZE, "msg_type" => msg_type).increment(size as u64);
}

pub fn record_pruned(count: usize) {
    counter!(MESSAGES_PRUNED).increment(count as u64);
}

pub fn set_queued(count: usize) {
    gauge!(MESSAGES_QUEUED).set(count as f64);
}

pub fn set_members(alive: usize, failed: usize) {
    gauge!(MEMBERS).set(alive as f64);
    gauge!(FAILED_PEERS).set(failed as f64);
}

pub fn record_ping(rtt: Duration) {
    histogram!(PING_DURATION).record(rtt.as_secs_f64());
}
