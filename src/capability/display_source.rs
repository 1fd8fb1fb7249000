//! Frame producers.

use std::sync::Arc;

use async_trait::async_trait;

use super::DisplayDescriptor;
use crate::error::Result;
use crate::id::{NodeId, ServiceId};
use crate::rpc::method::rpc_methods;
use crate::rpc::{
    handle_service_binary_request, handle_service_request, read_method, BufferPool, Empty,
    PooledBuffer, RpcClient, RpcCodec, StreamOpener,
};
use crate::service::Service;
use crate::stream::ServiceStream;

/// Base service id of display sources; instances are `display-source/{peripheral}`.
pub const DISPLAY_SOURCE_SERVICE: &str = "display-source";

rpc_methods! {
    /// Methods of a display source service.
    pub enum DisplaySourceMethod {
        /// Return the display descriptor.
        GetDisplayDescriptor = "GetDisplayDescriptor",
        /// Return one frame as a binary payload.
        CaptureFrame = "CaptureFrame",
    }
}

/// Something that produces frames.
#[async_trait]
pub trait DisplaySource: Send + Sync + 'static {
    /// Geometry and format of produced frames.
    async fn display_descriptor(&self) -> Result<DisplayDescriptor>;

    /// Capture one frame into a buffer borrowed from `pool`.
    async fn capture_frame(&self, pool: &BufferPool) -> Result<PooledBuffer>;
}

/// Exposes a [`DisplaySource`] over RPC.
pub struct DisplaySourceService {
    service_id: ServiceId,
    source: Arc<dyn DisplaySource>,
    pool: BufferPool,
}

impl DisplaySourceService {
    /// Serve `source` as `display-source/{peripheral}`.
    pub fn new(peripheral: &str, source: Arc<dyn DisplaySource>, pool: BufferPool) -> Self {
        Self {
            service_id: ServiceId::with_argument(DISPLAY_SOURCE_SERVICE, peripheral),
            source,
            pool,
        }
    }
}

#[async_trait]
impl Service for DisplaySourceService {
    fn service_id(&self) -> ServiceId {
        self.service_id.clone()
    }

    async fn handle(&self, stream: ServiceStream) -> Result<()> {
        let mut codec = RpcCodec::new(stream);
        let source = &self.source;
        match read_method::<DisplaySourceMethod>(&mut codec).await? {
            DisplaySourceMethod::GetDisplayDescriptor => {
                handle_service_request(&mut codec, |_: Empty| source.display_descriptor()).await
            }
            DisplaySourceMethod::CaptureFrame => {
                let pool = &self.pool;
                handle_service_binary_request(&mut codec, |_: Empty| source.capture_frame(pool))
                    .await
            }
        }
    }
}

/// A remote display source reached over RPC.
#[derive(Debug, Clone)]
pub struct DisplaySourceClient {
    rpc: RpcClient,
    pool: BufferPool,
}

impl DisplaySourceClient {
    /// Proxy for `display-source/{peripheral}` on `node_id`.
    ///
    /// Captured frames land in buffers borrowed from `pool`.
    pub fn new(
        opener: Arc<dyn StreamOpener>,
        node_id: NodeId,
        peripheral: &str,
        pool: BufferPool,
    ) -> Self {
        Self {
            rpc: RpcClient::new(
                opener,
                node_id,
                ServiceId::with_argument(DISPLAY_SOURCE_SERVICE, peripheral),
            ),
            pool,
        }
    }
}

#[async_trait]
impl DisplaySource for DisplaySourceClient {
    async fn display_descriptor(&self) -> Result<DisplayDescriptor> {
        self.rpc
            .call(DisplaySourceMethod::GetDisplayDescriptor, &Empty {})
            .await
    }

    async fn capture_frame(&self, pool: &BufferPool) -> Result<PooledBuffer> {
        self.rpc
            .call_binary(DisplaySourceMethod::CaptureFrame, &Empty {}, pool)
            .await
    }
}

impl DisplaySourceClient {
    /// Capture a frame into the pool this client was built with.
    pub async fn capture(&self) -> Result<PooledBuffer> {
        self.capture_frame(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::testing::LoopbackOpener;
    use crate::error::Error;

    /// Produces a frame filled with one byte value.
    struct SolidSource {
        len: usize,
        fill: u8,
    }

    #[async_trait]
    impl DisplaySource for SolidSource {
        async fn display_descriptor(&self) -> Result<DisplayDescriptor> {
            Ok(DisplayDescriptor(vec![1, 9, 2, 0]))
        }

        async fn capture_frame(&self, pool: &BufferPool) -> Result<PooledBuffer> {
            if self.len == 0 {
                return Err(Error::Remote("no signal".into()));
            }
            let mut frame = pool.borrow(self.len)?;
            frame.fill(self.fill);
            Ok(frame)
        }
    }

    fn client(source: SolidSource, server_pool: BufferPool, client_pool: BufferPool) -> DisplaySourceClient {
        let opener = LoopbackOpener::new(vec![Arc::new(DisplaySourceService::new(
            "screen",
            Arc::new(source),
            server_pool,
        ))]);
        DisplaySourceClient::new(opener, NodeId::new("n1"), "screen", client_pool)
    }

    #[tokio::test]
    async fn frame_arrives_intact_and_buffers_return() {
        let server_pool = BufferPool::default();
        let client_pool = BufferPool::default();
        let client = client(
            SolidSource {
                len: 300_000,
                fill: 0xAB,
            },
            server_pool.clone(),
            client_pool.clone(),
        );

        assert_eq!(
            client.display_descriptor().await.unwrap(),
            DisplayDescriptor(vec![1, 9, 2, 0])
        );

        let frame = client.capture().await.unwrap();
        assert_eq!(frame.len(), 300_000);
        assert!(frame.iter().all(|&b| b == 0xAB));
        assert_eq!(client_pool.outstanding(), 1);
        drop(frame);
        assert_eq!(client_pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn capture_error_is_forwarded() {
        let pool = BufferPool::default();
        let client = client(SolidSource { len: 0, fill: 0 }, pool.clone(), pool.clone());
        let err = client.capture().await.unwrap_err();
        assert_eq!(err.to_string(), "no signal");
        assert_eq!(pool.outstanding(), 0);
    }
}
