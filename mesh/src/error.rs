//! Cluster synchronization error types.
//!
//! None of these are fatal: membership callbacks turn them into log events.

use std::time::Duration;

use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to decode {kind}: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: prost::DecodeError,
    },

    #[error("Unknown state key: {0}")]
    UnknownKey(String),

    #[error("State key already registered: {0}")]
    DuplicateKey(String),

    #[error("Failed to merge state '{key}': {error:#}")]
    Merge { key: String, error: anyhow::Error },

    #[error("Failed to snapshot state '{key}': {error:#}")]
    Snapshot { key: String, error: anyhow::Error },

    #[error("Peer has not joined a cluster")]
    NotJoined,

    #[error("Peer already joined a cluster")]
    AlreadyJoined,

    #[error("Reliable send to {node} timed out after {timeout:?}")]
    SendTimeout { node: String, timeout: Duration },

    #[error("Membership error: {0:#}")]
    Membership(anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
