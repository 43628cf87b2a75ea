//! Transmit-limited broadcast queue
//!
//! Pending broadcasts are piggybacked onto gossip packets by the membership
//! protocol. Each entry is replayed a bounded number of times, scaled by the
//! current cluster size, then dropped.

use std::{collections::BTreeMap, fmt};

use parking_lot::Mutex;

type NumNodes = Box<dyn Fn() -> usize + Send + Sync>;

/// Orders entries by fewest transmissions first, then oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    transmits: usize,
    id: u64,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<EntryKey, Vec<u8>>,
    next_id: u64,
}

pub struct BroadcastQueue {
    retransmit_mult: usize,
    num_nodes: NumNodes,
    inner: Mutex<Inner>,
}

impl fmt::Debug for BroadcastQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastQueue")
            .field("retransmit_mult", &self.retransmit_mult)
            .field("queued", &self.num_queued())
            .finish()
    }
}

/// Number of times a message is replayed in a cluster of `num_nodes`.
pub fn retransmit_limit(retransmit_mult: usize, num_nodes: usize) -> usize {
    let node_scale = ((num_nodes + 1) as f64).log10().ceil() as usize;
    retransmit_mult * node_scale
}

impl BroadcastQueue {
    pub fn new<F>(retransmit_mult: usize, num_nodes: F) -> Self
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        Self {
            retransmit_mult,
            num_nodes: Box::new(num_nodes),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn queue_broadcast(&self, msg: Vec<u8>) {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(EntryKey { transmits: 0, id }, msg);
    }

    /// Select pending messages that fit into `limit` bytes, charging
    /// `overhead` bytes per message.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock();
        if inner.entries.is_empty() {
            return Vec::new();
        }

        let transmit_limit = retransmit_limit(self.retransmit_mult, (self.num_nodes)());
        let mut used = 0usize;
        let mut selected = Vec::new();

        for (key, msg) in inner.entries.iter() {
            let cost = overhead + msg.len();
            if used + cost > limit {
                continue;
            }
            used += cost;
            selected.push(*key);
            if limit - used <= overhead {
                break;
            }
        }

        let mut out = Vec::with_capacity(selected.len());
        for key in selected {
            let Some(msg) = inner.entries.remove(&key) else {
                continue;
            };
            let transmits = key.transmits + 1;
            if transmits < transmit_limit {
                inner.entries.insert(
                    EntryKey {
                        transmits,
                        id: key.id,
                    },
                    msg.clone(),
                );
            }
            out.push(msg);
        }
        out
    }

    pub fn num_queued(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Drop the oldest entries until at most `max_retain` remain.
    /// Returns the number of entries removed.
    pub fn prune(&self, max_retain: usize) -> usize {
        let mut inner = self.inner.lock();
        let excess = inner.entries.len().saturating_sub(max_retain);
        if excess == 0 {
            return 0;
        }

        let mut keys: Vec<EntryKey> = inner.entries.keys().copied().collect();
        keys.sort_unstable_by_key(|k| k.id);
        for key in keys.into_iter().take(excess) {
            inner.entries.remove(&key);
        }
        excess
    }
}
