//! Error types for kvm-fabric.

use std::path::PathBuf;
use std::time::Duration;

use crate::alpn::ProtocolId;
use crate::id::{NodeId, ServiceId};

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A node with this id is already attached to the registrar.
    #[error("node {0} is already attached")]
    NodeIdAlreadyExists(NodeId),

    /// No node with this id is attached to the registrar.
    #[error("node {0} is not attached")]
    NodeIdNotFound(NodeId),

    /// The service repository holds no service with this id.
    #[error("service {0} not found")]
    ServiceNotFound(ServiceId),

    /// Two services with the same id were handed to one repository.
    #[error("service {0} registered twice")]
    DuplicateService(ServiceId),

    /// Error reported by the remote side in a response header.
    #[error("{0}")]
    Remote(String),

    /// The request body could not be decoded.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The request header named a method the service does not implement.
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// A value could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// A value could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// The stream ended before a complete value or payload was read.
    #[error("stream ended unexpectedly")]
    UnexpectedEof,

    /// A single encoded value exceeded the line limit.
    #[error("encoded value exceeds {max} bytes")]
    ValueTooLarge {
        /// Maximum accepted line length.
        max: usize,
    },

    /// A declared binary payload is larger than the pool permits.
    #[error("payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge {
        /// Declared payload size.
        size: u64,
        /// Largest buffer the pool hands out.
        max: usize,
    },

    /// A node id could not be decoded into a transport peer id.
    #[error("invalid node id {node_id}: {reason}")]
    InvalidNodeId {
        /// The offending id.
        node_id: String,
        /// Decoder message.
        reason: String,
    },

    /// Dialing a peer failed.
    #[error("dial {node_id} on {protocol}: {source}")]
    Dial {
        /// Remote node.
        node_id: NodeId,
        /// Protocol being dialed.
        protocol: ProtocolId,
        /// Transport error.
        #[source]
        source: iroh::endpoint::ConnectError,
    },

    /// Opening a stream on an established connection failed.
    #[error("open stream to {node_id} on {protocol}: {source}")]
    OpenStream {
        /// Remote node.
        node_id: NodeId,
        /// Protocol of the connection.
        protocol: ProtocolId,
        /// Connection error.
        #[source]
        source: iroh::endpoint::ConnectionError,
    },

    /// The identity key file could not be used.
    #[error("identity key {path}: {reason}")]
    Identity {
        /// Key file path.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// Filesystem failure while loading or persisting the identity.
    #[error("identity key {path}: {source}")]
    IdentityIo {
        /// Key file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The transport endpoint could not be bound.
    #[error("bind transport: {0}")]
    Bind(String),

    /// Local network discovery could not be started.
    #[error("discovery: {0}")]
    Discovery(String),

    /// An operation did not complete within its deadline.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// What was being attempted.
        operation: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// A peripheral id is unknown to the repository.
    #[error("peripheral {0} not found")]
    PeripheralNotFound(String),

    /// The transport has been terminated.
    #[error("transport terminated")]
    Terminated,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a timeout error.
    pub fn timeout<S: Into<String>>(operation: S, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Whether this is a registry invariant violation that callers usually
    /// treat as a benign race.
    pub fn is_registry_race(&self) -> bool {
        matches!(self, Self::NodeIdAlreadyExists(_) | Self::NodeIdNotFound(_))
    }
}
