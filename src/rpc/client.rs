//! Generic RPC client bound to one service on one node.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use super::binary::{handle_client_binary_request, handle_client_upload};
use super::codec::RpcCodec;
use super::dispatch::handle_client_request;
use super::method::Method;
use super::pool::{BufferPool, PooledBuffer};
use crate::error::{Error, Result};
use crate::id::{NodeId, ServiceId};
use crate::stream::ServiceStream;

/// Deadline applied to every call made through an [`RpcClient`].
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Anything that can open a bidirectional stream to a service on a node.
#[async_trait]
pub trait StreamOpener: Send + Sync + 'static {
    /// Open a fresh stream to `service_id` on `node_id`.
    async fn open_service_stream(
        &self,
        service_id: &ServiceId,
        node_id: &NodeId,
    ) -> Result<ServiceStream>;
}

/// Issues calls against one `(node, service)` pair, one stream per call.
#[derive(Clone)]
pub struct RpcClient {
    opener: Arc<dyn StreamOpener>,
    node_id: NodeId,
    service_id: ServiceId,
    timeout: Duration,
}

impl RpcClient {
    /// Create a client for `service_id` on `node_id`.
    pub fn new(opener: Arc<dyn StreamOpener>, node_id: NodeId, service_id: ServiceId) -> Self {
        Self {
            opener,
            node_id,
            service_id,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Target node.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Target service.
    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    /// Structured request, structured response.
    pub async fn call<M, Req, Res>(&self, method: M, request: &Req) -> Result<Res>
    where
        M: Method,
        Req: Serialize + ?Sized + Sync,
        Res: DeserializeOwned,
    {
        self.deadline(method, async {
            let mut codec = self.open().await?;
            handle_client_request(&mut codec, method.name(), request).await
        })
        .await
    }

    /// Structured request, binary response read into `pool`.
    pub async fn call_binary<M, Req>(
        &self,
        method: M,
        request: &Req,
        pool: &BufferPool,
    ) -> Result<PooledBuffer>
    where
        M: Method,
        Req: Serialize + ?Sized + Sync,
    {
        self.deadline(method, async {
            let mut codec = self.open().await?;
            handle_client_binary_request(&mut codec, method.name(), request, pool).await
        })
        .await
    }

    /// Binary request, empty response.
    pub async fn upload<M: Method>(&self, method: M, payload: &[u8]) -> Result<()> {
        self.deadline(method, async {
            let mut codec = self.open().await?;
            handle_client_upload(&mut codec, method.name(), payload).await
        })
        .await
    }

    async fn open(&self) -> Result<RpcCodec> {
        let stream = self
            .opener
            .open_service_stream(&self.service_id, &self.node_id)
            .await?;
        Ok(RpcCodec::new(stream))
    }

    async fn deadline<M, T, F>(&self, method: M, call: F) -> Result<T>
    where
        M: Method,
        F: std::future::Future<Output = Result<T>>,
    {
        trace!(node = %self.node_id, service = %self.service_id, method = method.name(), "rpc call");
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(
                format!("{}.{} on {}", self.service_id, method.name(), self.node_id),
                self.timeout,
            )),
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("node_id", &self.node_id)
            .field("service_id", &self.service_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}
