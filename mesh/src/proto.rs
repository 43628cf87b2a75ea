//! Wire messages exchanged between peers.
//!
//! Every single-delta broadcast is an encoded [`Part`]; every push/pull
//! exchange is an encoded [`FullState`].

use prost::Message;

use crate::error::{ClusterError, ClusterResult};

/// A state key paired with its binary payload.
#[derive(Clone, PartialEq, Message)]
pub struct Part {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

/// One [`Part`] per registered state key.
#[derive(Clone, PartialEq, Message)]
pub struct FullState {
    #[prost(message, repeated, tag = "1")]
    pub parts: Vec<Part>,
}

impl Part {
    pub fn new(key: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            data: data.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> ClusterResult<Self> {
        Self::decode(bytes).map_err(|source| ClusterError::Decode {
            kind: "part",
            source,
        })
    }
}

impl FullState {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> ClusterResult<Self> {
        Self::decode(bytes).map_err(|source| ClusterError::Decode {
            kind: "full state",
            source,
        })
    }
}
