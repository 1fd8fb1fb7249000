//! Node and service identifiers.

use std::fmt;
use std::str::FromStr;

use iroh::EndpointId;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Stable identifier of a node in the fabric.
///
/// This is the textual form of the node's public key. Ids are totally
/// ordered by their string value; discovery uses that order to decide which
/// side of a pair initiates the connection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an already-encoded node id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The encoded id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the id back into the transport's peer id.
    pub fn to_endpoint_id(&self) -> Result<EndpointId> {
        EndpointId::from_str(&self.0).map_err(|e| Error::InvalidNodeId {
            node_id: self.0.clone(),
            reason: e.to_string(),
        })
    }
}

impl From<EndpointId> for NodeId {
    fn from(id: EndpointId) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a service exposed by a node.
///
/// A plain id such as `node` names a singleton service. A parameterized id
/// `{base}/{argument}` addresses one instance among several, e.g.
/// `display-sink/monitor-1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// Create a service id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a parameterized service id `{base}/{argument}`.
    pub fn with_argument(base: &str, argument: &str) -> Self {
        Self(format!("{base}/{argument}"))
    }

    /// The full id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the first `/`, or the whole id.
    pub fn base(&self) -> &str {
        self.0.split_once('/').map_or(&self.0, |(base, _)| base)
    }

    /// The part after the first `/`, if any.
    pub fn argument(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, arg)| arg)
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
