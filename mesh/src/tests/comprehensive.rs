//! Comprehensive Cluster Synchronization Tests
//!
//! Multi-node scenarios over [`MemoryNetwork`]:
//! - Cluster formation through a seed node
//! - Small deltas spreading through gossip rounds
//! - Full-state push/pull on join
//! - Oversized deltas delivered point-to-point
//! - Leave, failure and reconnect bookkeeping
//! - Settling and shutdown

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing as log;

use super::test_utils::{init_test_logging, MemoryNetwork, SetState, TestNode};
use crate::{channel::Channel, peer::PeerStatus};

struct ClusterNode {
    node: TestNode,
    alerts: Arc<SetState>,
    channel: Channel,
}

/// Start `names` as one cluster, every node joining through the first one.
async fn start_cluster(
    network: &Arc<MemoryNetwork>,
    names: &[&str],
    stop: &watch::Receiver<bool>,
) -> Vec<ClusterNode> {
    let mut nodes: Vec<ClusterNode> = Vec::new();
    for (name, port) in names.iter().zip(9000u16..) {
        let node = TestNode::new(network, name, port, stop.clone());
        let alerts = Arc::new(SetState::new());
        let channel = node.add_state("alerts", alerts.clone());

        let known = match nodes.first() {
            Some(seed) => vec![seed.node.addr()],
            None => Vec::new(),
        };
        node.join(&known).await;
        nodes.push(ClusterNode {
            node,
            alerts,
            channel,
        });
    }
    log::info!(nodes = names.len(), "Cluster started");
    nodes
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn large_batch(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("alert-{i:04}-with-labels")).collect()
}

#[tokio::test]
async fn test_cluster_formation() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let (_stop_tx, stop) = watch::channel(false);

    let nodes = start_cluster(&network, &["a", "b", "c"], &stop).await;

    for n in &nodes {
        assert_eq!(n.node.peer.cluster_size(), 3, "{}", n.node.peer.name());
        assert!(n.node.peer.failed_peers().is_empty());
    }
    let positions: Vec<usize> = nodes.iter().map(|n| n.node.peer.position()).collect();
    assert_eq!(positions, vec![0, 1, 2]);

    // the seed's address placeholder is replaced once its name is known
    let names: Vec<String> = nodes[2]
        .node
        .peer
        .peers()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[tokio::test]
async fn test_small_delta_spreads_through_gossip() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let (_stop_tx, stop) = watch::channel(false);
    let nodes = start_cluster(&network, &["a", "b", "c"], &stop).await;
    let a = &nodes[0];

    a.alerts.insert("alert-1");
    let delta = SetState::delta(&["alert-1"]);
    assert!(!a.channel.is_oversized(&delta));
    a.channel.broadcast(&delta);
    assert_eq!(a.node.peer.broadcast_queue().num_queued(), 1);

    assert_eq!(network.gossip_round(), 1);
    for n in &nodes[1..] {
        assert_eq!(n.alerts.items(), vec!["alert-1"], "{}", n.node.peer.name());
        // receivers merge exactly the published bytes
        assert_eq!(n.alerts.merge_calls(), vec![delta.clone()]);
    }

    // 4 * ceil(log10(3 + 1)) transmissions in a three node cluster
    for _ in 0..3 {
        assert_eq!(network.gossip_round(), 1);
    }
    assert_eq!(network.gossip_round(), 0);
    assert_eq!(a.node.peer.broadcast_queue().num_queued(), 0);
    assert_eq!(network.reliable_sends(), 0);
}

#[tokio::test]
async fn test_delta_for_unregistered_key_is_ignored() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let (_stop_tx, stop) = watch::channel(false);
    let nodes = start_cluster(&network, &["a", "b"], &stop).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let silences = Arc::new(SetState::new());
    let channel = a.node.add_state("silences", silences.clone());
    channel.broadcast(&SetState::delta(&["silence-1"]));
    a.channel.broadcast(&SetState::delta(&["alert-1"]));

    assert_eq!(network.gossip_round(), 2);
    assert_eq!(b.alerts.items(), vec!["alert-1"]);
    assert!(b.node.peer.states().get("silences").is_none());
}

#[tokio::test]
async fn test_join_exchanges_full_state() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let (_stop_tx, stop) = watch::channel(false);

    let a = TestNode::new(&network, "a", 9000, stop.clone());
    let a_notifications = Arc::new(SetState::with_items(&["n1", "n2"]));
    a.add_state("notifications", a_notifications.clone());
    a.join(&[]).await;

    let b = TestNode::new(&network, "b", 9001, stop.clone());
    let b_notifications = Arc::new(SetState::with_items(&["n3"]));
    b.add_state("notifications", b_notifications.clone());
    assert_eq!(b.join(&[a.addr()]).await, 1);

    assert_eq!(b_notifications.items(), vec!["n1", "n2", "n3"]);
    assert_eq!(a_notifications.items(), vec!["n1", "n2", "n3"]);
    // exactly one snapshot went each way
    assert_eq!(a_notifications.merge_calls().len(), 1);
    assert_eq!(b_notifications.merge_calls().len(), 1);
    assert_eq!(a.peer.cluster_size(), 2);
    assert_eq!(b.peer.cluster_size(), 2);
}

#[tokio::test]
async fn test_join_with_unreachable_peer_keeps_it_failed() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let (_stop_tx, stop) = watch::channel(false);

    let a = TestNode::new(&network, "a", 9000, stop.clone());
    assert_eq!(a.join(&["127.0.0.1:9999".to_string()]).await, 0);

    let failed = a.peer.failed_peers();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].address, "127.0.0.1:9999");
    assert_eq!(a.peer.cluster_size(), 1);
}

#[tokio::test]
async fn test_oversized_delta_delivered_point_to_point() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let (_stop_tx, stop) = watch::channel(false);
    let nodes = start_cluster(&network, &["a", "b", "c"], &stop).await;
    let a = &nodes[0];

    let batch = large_batch(100);
    let items: Vec<&str> = batch.iter().map(String::as_str).collect();
    let delta = SetState::delta(&items);
    assert!(a.channel.is_oversized(&delta));
    a.channel.broadcast(&delta);

    wait_until(|| nodes[1..].iter().all(|n| n.alerts.items().len() == 100)).await;
    wait_until(|| network.reliable_sends() == 2).await;

    // the gossip path is never used for oversized deltas
    assert_eq!(a.node.peer.broadcast_queue().num_queued(), 0);
    assert_eq!(network.gossip_round(), 0);
    assert_eq!(a.channel.pending_oversize(), 0);
}

#[tokio::test]
async fn test_leave_shrinks_cluster() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let (_stop_tx, stop) = watch::channel(false);
    let nodes = start_cluster(&network, &["a", "b", "c"], &stop).await;
    let (a, c) = (&nodes[0], &nodes[2]);

    c.node.peer.leave(Duration::from_secs(1)).await.unwrap();

    for n in &nodes[..2] {
        assert_eq!(n.node.peer.cluster_size(), 2, "{}", n.node.peer.name());
    }
    let failed = a.node.peer.failed_peers();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "c");
    assert_eq!(failed[0].status, PeerStatus::Failed);

    // oversized deltas only go to members that are still alive
    let batch = large_batch(100);
    let items: Vec<&str> = batch.iter().map(String::as_str).collect();
    a.channel.broadcast(&SetState::delta(&items));
    wait_until(|| nodes[1].alerts.items().len() == 100).await;
    wait_until(|| network.reliable_sends() == 1).await;
    assert!(c.alerts.items().is_empty());
}

#[tokio::test]
async fn test_reconnect_after_failure() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let (_stop_tx, stop) = watch::channel(false);
    let nodes = start_cluster(&network, &["a", "b"], &stop).await;
    let a = &nodes[0];

    network.fail("b");
    assert_eq!(a.node.peer.cluster_size(), 1);
    assert_eq!(a.node.peer.reconnect().await.unwrap(), 0);

    network.revive("b");
    assert_eq!(a.node.peer.reconnect().await.unwrap(), 1);
    assert_eq!(a.node.peer.cluster_size(), 2);
    assert!(a.node.peer.failed_peers().is_empty());
}

#[tokio::test]
async fn test_failed_peer_expires() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let (_stop_tx, stop) = watch::channel(false);
    let nodes = start_cluster(&network, &["a", "b"], &stop).await;
    let a = &nodes[0];

    network.fail("b");
    assert_eq!(a.node.peer.remove_failed_peers(Duration::from_secs(3600)), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(a.node.peer.remove_failed_peers(Duration::from_millis(1)), 1);
    assert!(a.node.peer.peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_settle_with_stable_membership() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let (_stop_tx, stop) = watch::channel(false);
    let nodes = start_cluster(&network, &["a", "b"], &stop).await;

    let b = nodes[1].node.peer.clone();
    let waiter = tokio::spawn(async move {
        b.wait_ready().await;
        b.info()
    });

    nodes[1].node.peer.settle(Duration::from_secs(1)).await;
    let info = waiter.await.unwrap();
    assert_eq!(info.status, "ready");
    assert_eq!(info.cluster_size, 2);
    assert!(!nodes[0].node.peer.ready());
}

#[tokio::test]
async fn test_stop_signal_halts_workers() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let (stop_tx, stop) = watch::channel(false);
    let nodes = start_cluster(&network, &["a", "b"], &stop).await;

    assert!(nodes.iter().all(|n| n.channel.is_running()));
    stop_tx.send(true).unwrap();
    wait_until(|| nodes.iter().all(|n| !n.channel.is_running())).await;

    // a stopped channel drops oversized deltas
    let batch = large_batch(100);
    let items: Vec<&str> = batch.iter().map(String::as_str).collect();
    nodes[0].channel.broadcast(&SetState::delta(&items));
    assert_eq!(network.reliable_sends(), 0);

    let delegate = nodes[0].node.delegate.clone();
    assert_eq!(delegate.peer().name(), "a");
}
