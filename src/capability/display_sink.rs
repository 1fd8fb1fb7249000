//! Frame consumers.

use std::sync::Arc;

use async_trait::async_trait;

use super::DisplayDescriptor;
use crate::error::Result;
use crate::id::{NodeId, ServiceId};
use crate::rpc::method::rpc_methods;
use crate::rpc::{
    handle_service_request, handle_service_upload, read_method, BufferPool, Empty, RpcClient,
    RpcCodec, StreamOpener,
};
use crate::service::Service;
use crate::stream::ServiceStream;

/// Base service id of display sinks; instances are `display-sink/{peripheral}`.
pub const DISPLAY_SINK_SERVICE: &str = "display-sink";

rpc_methods! {
    /// Methods of a display sink service.
    pub enum DisplaySinkMethod {
        /// Return the display descriptor.
        GetDisplayDescriptor = "GetDisplayDescriptor",
        /// Show one frame sent as a binary payload.
        PresentFrame = "PresentFrame",
    }
}

/// Something that shows frames.
#[async_trait]
pub trait DisplaySink: Send + Sync + 'static {
    /// Geometry and format of accepted frames.
    async fn display_descriptor(&self) -> Result<DisplayDescriptor>;

    /// Show one frame.
    async fn present_frame(&self, frame: &[u8]) -> Result<()>;
}

/// Exposes a [`DisplaySink`] over RPC.
///
/// Uploaded frames are received into buffers from `pool`, which also caps
/// the accepted frame size.
pub struct DisplaySinkService {
    service_id: ServiceId,
    sink: Arc<dyn DisplaySink>,
    pool: BufferPool,
}

impl DisplaySinkService {
    /// Serve `sink` as `display-sink/{peripheral}`.
    pub fn new(peripheral: &str, sink: Arc<dyn DisplaySink>, pool: BufferPool) -> Self {
        Self {
            service_id: ServiceId::with_argument(DISPLAY_SINK_SERVICE, peripheral),
            sink,
            pool,
        }
    }
}

#[async_trait]
impl Service for DisplaySinkService {
    fn service_id(&self) -> ServiceId {
        self.service_id.clone()
    }

    async fn handle(&self, stream: ServiceStream) -> Result<()> {
        let mut codec = RpcCodec::new(stream);
        let sink = &self.sink;
        match read_method::<DisplaySinkMethod>(&mut codec).await? {
            DisplaySinkMethod::GetDisplayDescriptor => {
                handle_service_request(&mut codec, |_: Empty| sink.display_descriptor()).await
            }
            DisplaySinkMethod::PresentFrame => {
                handle_service_upload(&mut codec, &self.pool, |frame| async move {
                    sink.present_frame(&frame).await
                })
                .await
            }
        }
    }
}

/// A remote display sink reached over RPC.
#[derive(Debug, Clone)]
pub struct DisplaySinkClient {
    rpc: RpcClient,
}

impl DisplaySinkClient {
    /// Proxy for `display-sink/{peripheral}` on `node_id`.
    pub fn new(opener: Arc<dyn StreamOpener>, node_id: NodeId, peripheral: &str) -> Self {
        Self {
            rpc: RpcClient::new(
                opener,
                node_id,
                ServiceId::with_argument(DISPLAY_SINK_SERVICE, peripheral),
            ),
        }
    }
}

#[async_trait]
impl DisplaySink for DisplaySinkClient {
    async fn display_descriptor(&self) -> Result<DisplayDescriptor> {
        self.rpc
            .call(DisplaySinkMethod::GetDisplayDescriptor, &Empty {})
            .await
    }

    async fn present_frame(&self, frame: &[u8]) -> Result<()> {
        self.rpc.upload(DisplaySinkMethod::PresentFrame, frame).await
    }
}
