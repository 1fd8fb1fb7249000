//! Node introspection.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::id::{NodeId, ServiceId};
use crate::rpc::method::rpc_methods;
use crate::rpc::{handle_service_request, read_method, Empty, RpcClient, RpcCodec, StreamOpener};
use crate::service::Service;
use crate::stream::ServiceStream;

/// Service id of the node service.
pub const NODE_SERVICE: &str = "node";

rpc_methods! {
    /// Methods of the node service.
    pub enum NodeMethod {
        /// Return the node id.
        GetNodeId = "GetNodeId",
        /// Return the host name.
        GetHostName = "GetHostName",
        /// Return every hosted service id.
        GetServiceIds = "GetServiceIds",
    }
}

/// What every node answers about itself.
#[async_trait]
pub trait Node: Send + Sync + 'static {
    /// Stable node id.
    async fn node_id(&self) -> Result<NodeId>;

    /// Host name of the machine running the node.
    async fn host_name(&self) -> Result<String>;

    /// Services the node hosts.
    async fn service_ids(&self) -> Result<Vec<ServiceId>>;
}

/// The node running in this process.
#[derive(Debug, Clone)]
pub struct LocalNode {
    id: NodeId,
    host_name: String,
    service_ids: Vec<ServiceId>,
}

impl LocalNode {
    /// Describe the local node.
    pub fn new(id: NodeId, host_name: impl Into<String>, service_ids: Vec<ServiceId>) -> Self {
        Self {
            id,
            host_name: host_name.into(),
            service_ids,
        }
    }
}

#[async_trait]
impl Node for LocalNode {
    async fn node_id(&self) -> Result<NodeId> {
        Ok(self.id.clone())
    }

    async fn host_name(&self) -> Result<String> {
        Ok(self.host_name.clone())
    }

    async fn service_ids(&self) -> Result<Vec<ServiceId>> {
        Ok(self.service_ids.clone())
    }
}

/// Exposes a [`Node`] over RPC.
pub struct NodeService {
    node: Arc<dyn Node>,
}

impl NodeService {
    /// Serve `node`.
    pub fn new(node: Arc<dyn Node>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl Service for NodeService {
    fn service_id(&self) -> ServiceId {
        ServiceId::new(NODE_SERVICE)
    }

    async fn handle(&self, stream: ServiceStream) -> Result<()> {
        let mut codec = RpcCodec::new(stream);
        let node = &self.node;
        match read_method::<NodeMethod>(&mut codec).await? {
            NodeMethod::GetNodeId => {
                handle_service_request(&mut codec, |_: Empty| node.node_id()).await
            }
            NodeMethod::GetHostName => {
                handle_service_request(&mut codec, |_: Empty| node.host_name()).await
            }
            NodeMethod::GetServiceIds => {
                handle_service_request(&mut codec, |_: Empty| node.service_ids()).await
            }
        }
    }
}

/// A remote node reached over RPC.
#[derive(Debug, Clone)]
pub struct NodeClient {
    rpc: RpcClient,
}

impl NodeClient {
    /// Proxy for the node service on `node_id`.
    pub fn new(opener: Arc<dyn StreamOpener>, node_id: NodeId) -> Self {
        Self {
            rpc: RpcClient::new(opener, node_id, ServiceId::new(NODE_SERVICE)),
        }
    }

    /// Proxy using a preconfigured client.
    pub fn from_rpc(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl Node for NodeClient {
    async fn node_id(&self) -> Result<NodeId> {
        self.rpc.call(NodeMethod::GetNodeId, &Empty {}).await
    }

    async fn host_name(&self) -> Result<String> {
        self.rpc.call(NodeMethod::GetHostName, &Empty {}).await
    }

    async fn service_ids(&self) -> Result<Vec<ServiceId>> {
        self.rpc.call(NodeMethod::GetServiceIds, &Empty {}).await
    }
}
