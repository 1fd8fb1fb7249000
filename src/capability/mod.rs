//! Capability services.
//!
//! Each capability comes as a trait with two implementations: a local
//! delegate and an RPC client for the same interface on another node. A
//! [`Service`](crate::service::Service) adapter exposes the local side. Which
//! implementation a caller holds is decided when it is constructed.

pub mod display_sink;
pub mod display_source;
pub mod node;
pub mod peripheral;

use serde::{Deserialize, Serialize};

/// Opaque display parameters produced by the display codec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayDescriptor(pub Vec<u8>);

impl DisplayDescriptor {
    /// Encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for DisplayDescriptor {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}
