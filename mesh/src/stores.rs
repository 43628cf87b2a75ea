//! State registry for mesh cluster synchronization
//!
//! Subsystems register a mergeable [`State`] under a unique key at startup.
//! Inbound deltas and full-state exchanges are routed to the state by key.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;
use tracing::debug;

use super::{
    error::{ClusterError, ClusterResult},
    proto::Part,
};

/// A caller-owned value that can be reconciled from remote bytes.
///
/// `merge` must be idempotent and tolerate out-of-order delivery: the same
/// delta may arrive several times, and a full snapshot may arrive after
/// newer deltas. A failed merge is never retried.
pub trait State: Send + Sync {
    fn merge(&self, data: &[u8]) -> anyhow::Result<()>;

    /// Full binary encoding of the state, fed to remote `merge` on join.
    fn snapshot(&self) -> anyhow::Result<Vec<u8>>;
}

/// Thread-safe key to state mapping. Populated at startup, read-mostly after.
#[derive(Default)]
pub struct StateRegistry {
    states: RwLock<BTreeMap<String, Arc<dyn State>>>,
}

impl std::fmt::Debug for StateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: impl Into<String>, state: Arc<dyn State>) -> ClusterResult<()> {
        let key = key.into();
        let mut states = self.states.write();
        if states.contains_key(&key) {
            return Err(ClusterError::DuplicateKey(key));
        }
        debug!(key = %key, "Registered cluster state");
        states.insert(key, state);
        Ok(())
    }

    /// The lock is released before the state is returned, so merges on the
    /// returned state never hold up other readers.
    pub fn get(&self, key: &str) -> Option<Arc<dyn State>> {
        self.states.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.states.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a single part to the state registered under its key.
    pub fn merge(&self, part: &Part) -> ClusterResult<()> {
        let state = self
            .get(&part.key)
            .ok_or_else(|| ClusterError::UnknownKey(part.key.clone()))?;
        state.merge(&part.data).map_err(|error| ClusterError::Merge {
            key: part.key.clone(),
            error,
        })
    }

    /// Snapshot every registered state, ordered by key.
    ///
    /// A single failing snapshot fails the whole call.
    pub fn snapshot_all(&self) -> ClusterResult<Vec<Part>> {
        let states = self.states.read();
        let mut parts = Vec::with_capacity(states.len());
        for (key, state) in states.iter() {
            let data = state.snapshot().map_err(|error| ClusterError::Snapshot {
                key: key.clone(),
                error,
            })?;
            parts.push(Part {
                key: key.clone(),
                data,
            });
        }
        Ok(parts)
    }
}
