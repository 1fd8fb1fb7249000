//! Peer-to-peer service fabric for remote peripherals over iroh.
//!
//! Nodes find each other on the local network, connect over authenticated
//! QUIC and expose capability services (node introspection, peripheral
//! inventories, display sources and sinks) through a small stream-based RPC
//! protocol. Every service gets its own protocol id
//! `/{application}/{service}`; one stream carries one call.

#![deny(missing_docs)]

pub mod alpn;
pub mod capability;
mod client;
pub mod discovery;
pub mod error;
pub mod id;
pub mod identity;
pub mod registrar;
pub mod repository;
pub mod rpc;
mod server;
pub mod service;
pub mod stream;
pub mod transport;
pub mod user_data;

pub use iroh;

pub use alpn::ProtocolId;
pub use capability::display_sink::{DisplaySink, DisplaySinkClient, DisplaySinkService};
pub use capability::display_source::{DisplaySource, DisplaySourceClient, DisplaySourceService};
pub use capability::node::{LocalNode, Node, NodeClient, NodeService};
pub use capability::peripheral::{
    LocalPeripheralRepository, PeripheralDescriptor, PeripheralId, PeripheralKind,
    PeripheralRepository, PeripheralRepositoryClient, PeripheralRepositoryService,
};
pub use capability::DisplayDescriptor;
pub use discovery::{Discoverer, DiscoveryOptions};
pub use error::{Error, Result};
pub use id::{NodeId, ServiceId};
pub use identity::NodeIdentity;
pub use registrar::{NodeRegistrar, RegistrarEvent};
pub use repository::ServiceRepository;
pub use rpc::{BufferPool, PooledBuffer, RpcClient, StreamOpener};
pub use service::Service;
pub use stream::ServiceStream;
pub use transport::{Transport, TransportHandle, TransportOptions};
