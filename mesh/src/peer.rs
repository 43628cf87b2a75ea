//! Local cluster peer
//!
//! Owns the state registry and the outbound broadcast queue, and keeps the
//! bookkeeping of which remote peers are alive or failed as reported by the
//! membership protocol.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::{
    net::lookup_host,
    sync::watch,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing as log;
use tracing::Instrument;

use super::{
    broadcast_queue::BroadcastQueue,
    channel::{stopped, Channel, Transport},
    config::{ClusterConfig, NUM_OK_REQUIRED},
    error::{ClusterError, ClusterResult},
    membership::{Membership, Node},
    metrics,
    stores::{State, StateRegistry},
};

/// How often failed peers are checked against the reconnect timeout.
const FAILED_PEER_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Upper bound on resolving the host name of a known peer.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Alive,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub name: String,
    pub address: String,
    pub status: PeerStatus,
    pub left_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub name: String,
    pub status: String,
    pub cluster_size: usize,
    pub peers: Vec<PeerRecord>,
}

pub struct Peer {
    name: String,
    config: ClusterConfig,
    states: Arc<StateRegistry>,
    records: DashMap<String, PeerRecord>,
    cluster_size: Arc<AtomicUsize>,
    queue: Arc<BroadcastQueue>,
    membership: OnceLock<Arc<dyn Membership>>,
    ready_tx: watch::Sender<bool>,
    stop: watch::Receiver<bool>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("cluster_size", &self.cluster_size())
            .field("states", &self.states)
            .finish()
    }
}

impl Peer {
    /// Create a peer. Every task the peer (and its channels and delegate)
    /// spawns stops once `stop` flips to `true`.
    pub fn new(config: ClusterConfig, stop: watch::Receiver<bool>) -> ClusterResult<Arc<Self>> {
        config.validate()?;

        let name = if config.name.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.name.clone()
        };

        let cluster_size = Arc::new(AtomicUsize::new(1));
        let size = cluster_size.clone();
        let queue = Arc::new(BroadcastQueue::new(config.retransmit_mult, move || {
            size.load(Ordering::SeqCst)
        }));
        let (ready_tx, _) = watch::channel(false);

        log::info!(name = %name, "Created cluster peer");

        Ok(Arc::new(Self {
            name,
            config,
            states: Arc::new(StateRegistry::new()),
            records: DashMap::new(),
            cluster_size,
            queue,
            membership: OnceLock::new(),
            ready_tx,
            stop,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn states(&self) -> &Arc<StateRegistry> {
        &self.states
    }

    pub fn broadcast_queue(&self) -> &Arc<BroadcastQueue> {
        &self.queue
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.clone()
    }

    /// Register `state` under `key` and return the channel used to publish
    /// its deltas.
    pub fn add_state(
        self: &Arc<Self>,
        key: impl Into<String>,
        state: Arc<dyn State>,
    ) -> ClusterResult<Channel> {
        let key = key.into();
        self.states.register(key.clone(), state)?;
        log::debug!(key = %key, states = self.states.len(), "Added cluster state");

        let transport = Arc::new(PeerTransport { peer: self.clone() });
        Channel::new(key, transport, &self.config, self.stop.clone())
    }

    /// Attach the running membership protocol and join through `known_peers`.
    ///
    /// Failing to reach any known peer is not an error: the peers are kept
    /// as failed and retried by the reconnect loop.
    pub async fn join(
        self: &Arc<Self>,
        membership: Arc<dyn Membership>,
        known_peers: &[String],
    ) -> ClusterResult<usize> {
        if self.membership.set(membership.clone()).is_err() {
            return Err(ClusterError::AlreadyJoined);
        }
        if membership.local_name() != self.name {
            log::warn!(
                peer = %self.name,
                membership = %membership.local_name(),
                "Membership node name differs from peer name"
            );
        }

        let mut placeholders = Vec::with_capacity(known_peers.len());
        for addr in known_peers {
            placeholders.push((addr.clone(), resolve_peer_address(addr).await));
        }
        self.set_initial_failed(&placeholders);

        let joined = if known_peers.is_empty() {
            0
        } else {
            match membership.join(known_peers).await {
                Ok(n) => {
                    log::info!(peers = ?known_peers, contacted = n, "Joined cluster");
                    n
                }
                Err(err) => {
                    log::warn!(peers = ?known_peers, error = %err, "Failed to join cluster");
                    0
                }
            }
        };

        self.spawn_maintenance();
        Ok(joined)
    }

    pub async fn leave(&self, timeout: Duration) -> ClusterResult<()> {
        let membership = self.membership.get().ok_or(ClusterError::NotJoined)?;
        log::info!(name = %self.name, "Leaving cluster");
        membership
            .leave(timeout)
            .await
            .map_err(ClusterError::Membership)
    }

    /// Number of alive members, the local node included.
    pub fn cluster_size(&self) -> usize {
        self.cluster_size.load(Ordering::SeqCst)
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    pub fn failed_peers(&self) -> Vec<PeerRecord> {
        self.peers()
            .into_iter()
            .filter(|p| p.status == PeerStatus::Failed)
            .collect()
    }

    /// Index of this node among all alive members sorted by name.
    pub fn position(&self) -> usize {
        let mut names: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.status == PeerStatus::Alive)
            .map(|r| r.name.clone())
            .collect();
        names.push(self.name.clone());
        names.sort();
        names.iter().position(|n| *n == self.name).unwrap_or(0)
    }

    pub fn ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    pub async fn wait_ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Poll the member count every `interval` until it has been stable for
    /// several consecutive polls, then mark the peer ready. The stop signal
    /// ends settling early and also marks the peer ready.
    pub async fn settle(&self, interval: Duration) {
        let mut stop = self.stop.clone();
        let start = Instant::now();
        let mut n_peers = 0;
        let mut n_okay = 0;
        let mut total_polls = 0;

        log::info!(interval = ?interval, "Waiting for gossip to settle...");
        loop {
            if *stop.borrow() {
                log::info!(elapsed = ?start.elapsed(), "Gossip not settled but continuing anyway");
                break;
            }
            tokio::select! {
                _ = stopped(&mut stop) => {
                    log::info!(elapsed = ?start.elapsed(), "Gossip not settled but continuing anyway");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let elapsed = start.elapsed();
            let n = self.num_members();
            if n_okay >= NUM_OK_REQUIRED {
                log::info!(polls = total_polls, elapsed = ?elapsed, "Gossip settled; proceeding");
                break;
            }
            if n == n_peers {
                n_okay += 1;
                log::debug!(polls = total_polls, elapsed = ?elapsed, "Gossip looks settled");
            } else {
                n_okay = 0;
                log::info!(
                    polls = total_polls,
                    before = n_peers,
                    now = n,
                    elapsed = ?elapsed,
                    "Gossip not settled"
                );
            }
            n_peers = n;
            total_polls += 1;
        }
        self.ready_tx.send_replace(true);
    }

    pub fn info(&self) -> ClusterStatus {
        ClusterStatus {
            name: self.name.clone(),
            status: if self.ready() { "ready" } else { "settling" }.to_string(),
            cluster_size: self.cluster_size(),
            peers: self.peers(),
        }
    }

    /// Attempt to rejoin every failed peer. Returns the number of successful
    /// join attempts; a peer only turns alive once the membership protocol
    /// reports its join.
    pub async fn reconnect(&self) -> ClusterResult<usize> {
        let membership = self.membership.get().ok_or(ClusterError::NotJoined)?;
        let mut rejoined = 0;

        for record in self.failed_peers() {
            log::debug!(peer = %record.name, addr = %record.address, "Trying to reconnect");
            match membership.join(std::slice::from_ref(&record.address)).await {
                Ok(_) => {
                    log::info!(peer = %record.name, addr = %record.address, "Reconnected to peer");
                    rejoined += 1;
                }
                Err(err) => {
                    log::debug!(peer = %record.name, error = %err, "Reconnect failed");
                }
            }
        }

        Ok(rejoined)
    }

    /// Forget peers that have been failed for longer than `timeout`.
    pub fn remove_failed_peers(&self, timeout: Duration) -> usize {
        let now = Utc::now();
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return 0;
        };
        let before = self.records.len();

        self.records.retain(|_, record| {
            let expired = record.status == PeerStatus::Failed
                && record
                    .left_at
                    .is_some_and(|left_at| now.signed_duration_since(left_at) > timeout);
            if expired {
                log::debug!(peer = %record.name, addr = %record.address, "Failed peer has timed out");
            }
            !expired
        });

        let removed = before - self.records.len();
        if removed > 0 {
            self.update_cluster_size();
        }
        removed
    }

    pub(crate) fn peer_join(&self, node: &Node) {
        if node.name == self.name {
            return;
        }
        let address = node.address.to_string();

        // Drop the placeholder recorded for a known peer before its name was known.
        self.records
            .retain(|name, record| !(record.address == address && *name != node.name));

        let was_failed = self
            .records
            .get(&node.name)
            .is_some_and(|r| r.status == PeerStatus::Failed);
        self.records.insert(
            node.name.clone(),
            PeerRecord {
                name: node.name.clone(),
                address,
                status: PeerStatus::Alive,
                left_at: None,
            },
        );
        if was_failed {
            log::info!(peer = %node.name, "Failed peer rejoined");
        }
        self.update_cluster_size();
    }

    pub(crate) fn peer_leave(&self, node: &Node) {
        if node.name == self.name {
            return;
        }
        self.records
            .entry(node.name.clone())
            .and_modify(|r| {
                r.status = PeerStatus::Failed;
                r.left_at = Some(Utc::now());
            })
            .or_insert_with(|| PeerRecord {
                name: node.name.clone(),
                address: node.address.to_string(),
                status: PeerStatus::Failed,
                left_at: Some(Utc::now()),
            });
        self.update_cluster_size();
    }

    pub(crate) fn peer_update(&self, node: &Node) {
        if let Some(mut record) = self.records.get_mut(&node.name) {
            record.address = node.address.to_string();
        }
    }

    /// Record every known peer as failed under its configured address until
    /// the membership protocol reports it. `placeholders` pairs the configured
    /// address with the resolved one a join will carry.
    fn set_initial_failed(&self, placeholders: &[(String, String)]) {
        let now = Utc::now();
        for (name, address) in placeholders {
            self.records.entry(name.clone()).or_insert_with(|| PeerRecord {
                name: name.clone(),
                address: address.clone(),
                status: PeerStatus::Failed,
                left_at: Some(now),
            });
        }
        self.update_cluster_size();
    }

    fn update_cluster_size(&self) {
        let alive = self
            .records
            .iter()
            .filter(|r| r.status == PeerStatus::Alive)
            .count();
        let failed = self.records.len() - alive;
        self.cluster_size.store(alive + 1, Ordering::SeqCst);
        metrics::set_members(alive + 1, failed);
    }

    fn num_members(&self) -> usize {
        match self.membership.get() {
            Some(membership) => membership.members().len(),
            None => self.cluster_size(),
        }
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        let reconnect_interval = self.config.reconnect_interval();
        if reconnect_interval.is_zero() {
            return;
        }

        let span = tracing::info_span!("reconnect", peer = %self.name);
        tokio::spawn(
            self.clone()
                .handle_reconnect(reconnect_interval, self.stop.clone())
                .instrument(span),
        );

        let reconnect_timeout = self.config.reconnect_timeout();
        if !reconnect_timeout.is_zero() {
            let span = tracing::info_span!("reconnect_timeout", peer = %self.name);
            tokio::spawn(
                self.clone()
                    .handle_reconnect_timeout(reconnect_timeout, self.stop.clone())
                    .instrument(span),
            );
        }
    }

    async fn handle_reconnect(self: Arc<Self>, period: Duration, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.reconnect().await {
                        log::debug!(error = %err, "Reconnect round skipped");
                    }
                }
            }
        }
        log::debug!("Reconnect loop stopped");
    }

    async fn handle_reconnect_timeout(
        self: Arc<Self>,
        timeout: Duration,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = interval_at(
            Instant::now() + FAILED_PEER_SWEEP_INTERVAL,
            FAILED_PEER_SWEEP_INTERVAL,
        );
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = ticker.tick() => {
                    let removed = self.remove_failed_peers(timeout);
                    if removed > 0 {
                        log::info!(removed, "Removed timed out failed peers");
                    }
                }
            }
        }
    }
}

/// Resolve a configured peer address to the socket address the membership
/// protocol reports for it, preferring IPv4. Unresolvable addresses are kept
/// as configured.
async fn resolve_peer_address(addr: &str) -> String {
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return socket.to_string();
    }
    match tokio::time::timeout(RESOLVE_TIMEOUT, lookup_host(addr)).await {
        Ok(Ok(resolved)) => {
            let resolved: Vec<SocketAddr> = resolved.collect();
            resolved
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| resolved.first())
                .map_or_else(|| addr.to_string(), SocketAddr::to_string)
        }
        Ok(Err(err)) => {
            log::debug!(addr = %addr, error = %err, "Failed to resolve known peer");
            addr.to_string()
        }
        Err(_) => {
            log::debug!(addr = %addr, "Timed out resolving known peer");
            addr.to_string()
        }
    }
}

/// Channel transport backed by the peer: gossip goes through the broadcast
/// queue, reliable sends through the membership protocol.
struct PeerTransport {
    peer: Arc<Peer>,
}

#[async_trait]
impl Transport for PeerTransport {
    fn send(&self, msg: Vec<u8>) {
        self.peer.queue.queue_broadcast(msg);
    }

    fn peers(&self) -> Vec<Node> {
        let Some(membership) = self.peer.membership.get() else {
            return Vec::new();
        };
        let local = membership.local_name();
        membership
            .members()
            .into_iter()
            .filter(|n| n.name != local)
            .collect()
    }

    async fn send_reliable(&self, node: &Node, msg: &[u8]) -> anyhow::Result<()> {
        let membership = self.peer.membership.get().ok_or(ClusterError::NotJoined)?;
        membership.send_reliable(node, msg).await
    }
}
