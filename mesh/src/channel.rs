//! Per-key broadcast channel
//!
//! Small deltas go out through the unreliable gossip path. Deltas too large
//! for a gossip packet are queued and delivered point-to-point to every peer
//! by a single dispatch worker, so a burst of large messages never opens an
//! unbounded number of parallel streams.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    time::Instant,
};
use tracing::{debug, Instrument};

use super::{
    config::ClusterConfig,
    error::{ClusterError, ClusterResult},
    membership::Node,
    metrics,
    proto::Part,
};

/// Outbound primitives a [`Channel`] needs from the cluster.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Best-effort cluster-wide send. Never blocks, never fails.
    fn send(&self, msg: Vec<u8>);

    /// Peers to reach on the reliable path, excluding the local node.
    fn peers(&self) -> Vec<Node>;

    async fn send_reliable(&self, node: &Node, msg: &[u8]) -> anyhow::Result<()>;
}

/// Resolves once `stop` holds `true` or its sender is dropped.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|value| *value).await;
}

/// Whether an encoded message must bypass gossip.
pub fn is_oversized(msg: &[u8], max_gossip_packet_size: usize) -> bool {
    msg.len() > max_gossip_packet_size / 2
}

/// Publishes deltas for a single state key.
pub struct Channel {
    key: String,
    transport: Arc<dyn Transport>,
    oversize_tx: mpsc::Sender<Vec<u8>>,
    max_gossip_packet_size: usize,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("key", &self.key)
            .field("pending_oversize", &self.pending_oversize())
            .finish()
    }
}

impl Channel {
    /// Create a channel and spawn its oversize dispatch worker on the
    /// current runtime. The worker stops when `stop` flips to `true` or its
    /// sender is dropped.
    pub fn new(
        key: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: &ClusterConfig,
        stop: watch::Receiver<bool>,
    ) -> ClusterResult<Self> {
        config.validate()?;
        let key = key.into();
        let (oversize_tx, oversize_rx) = mpsc::channel(config.oversize_queue_capacity);

        let dispatcher = OversizeDispatcher {
            key: key.clone(),
            transport: transport.clone(),
            send_timeout: config.reliable_send_timeout(),
            concurrency: config.oversize_send_concurrency,
        };
        let span = tracing::info_span!("oversize_dispatch", key = %key);
        tokio::spawn(dispatcher.run(oversize_rx, stop).instrument(span));

        Ok(Self {
            key,
            transport,
            oversize_tx,
            max_gossip_packet_size: config.max_gossip_packet_size,
        })
    }

    /// Broadcast a delta for this channel's key. Returns immediately; a
    /// message that cannot be queued is dropped.
    pub fn broadcast(&self, data: &[u8]) {
        let msg = Part::new(self.key.clone(), data).to_bytes();

        if !self.is_oversized(&msg) {
            self.transport.send(msg);
            return;
        }

        match self.oversize_tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(key = %self.key, "Oversized gossip channel full, dropping message");
                metrics::record_oversize_dropped(&self.key);
            }
            Err(TrySendError::Closed(_)) => {
                debug!(key = %self.key, "Oversized gossip channel closed, dropping message");
                metrics::record_oversize_dropped(&self.key);
            }
        }
    }

    pub fn is_oversized(&self, msg: &[u8]) -> bool {
        is_oversized(msg, self.max_gossip_packet_size)
    }

    /// Oversize messages waiting for the dispatch worker.
    pub fn pending_oversize(&self) -> usize {
        self.oversize_tx.max_capacity() - self.oversize_tx.capacity()
    }

    /// False once the dispatch worker has stopped.
    pub fn is_running(&self) -> bool {
        !self.oversize_tx.is_closed()
    }
}

struct OversizeDispatcher {
    key: String,
    transport: Arc<dyn Transport>,
    send_timeout: Option<Duration>,
    concurrency: Option<usize>,
}

impl OversizeDispatcher {
    async fn run(self, mut rx: mpsc::Receiver<Vec<u8>>, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                biased;

                _ = stopped(&mut stop) => break,

                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        break;
                    };
                    // In-flight sends are dropped if the stop signal wins.
                    tokio::select! {
                        biased;
                        _ = stopped(&mut stop) => break,
                        _ = self.deliver(&msg) => {}
                    }
                }
            }
        }
        debug!("Oversize dispatch worker stopped");
    }

    /// Send one message to every current peer and wait for all sends.
    async fn deliver(&self, msg: &[u8]) {
        let peers = self.transport.peers();
        let start = Instant::now();

        stream::iter(peers)
            .for_each_concurrent(self.concurrency, |node| async move {
                if let Err(err) = self.send_to(&node, msg).await {
                    debug!(node = %node, error = %err, "Failed to send reliable");
                    metrics::record_oversize_failure(&self.key);
                }
            })
            .await;

        metrics::record_oversize_sent(&self.key, start.elapsed());
    }

    async fn send_to(&self, node: &Node, msg: &[u8]) -> anyhow::Result<()> {
        match self.send_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.transport.send_reliable(node, msg))
                .await
                .map_err(|_| ClusterError::SendTimeout {
                    node: node.name.clone(),
                    timeout,
                })?,
            None => self.transport.send_reliable(node, msg).await,
        }
    }
}
