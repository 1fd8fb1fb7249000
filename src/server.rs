//! Inbound side: protocol handlers and per-connection stream serving.

use std::sync::Arc;
use std::time::Duration;

use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use tracing::{debug, info, warn, Instrument};

use crate::alpn::ProtocolId;
use crate::id::{NodeId, ServiceId};
use crate::service::Service;
use crate::stream::{ServiceStream, StreamInfo};
use crate::transport::Shared;

/// Accepts connections for one service protocol and hands them to the transport.
#[derive(Clone)]
pub(crate) struct ServiceProtocolHandler {
    shared: Arc<Shared>,
    service_id: ServiceId,
}

impl ServiceProtocolHandler {
    pub(crate) fn new(shared: Arc<Shared>, service_id: ServiceId) -> Self {
        Self { shared, service_id }
    }
}

impl std::fmt::Debug for ServiceProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProtocolHandler")
            .field("service_id", &self.service_id)
            .finish_non_exhaustive()
    }
}

impl ProtocolHandler for ServiceProtocolHandler {
    fn accept(
        &self,
        connection: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let shared = Arc::clone(&self.shared);
        let service_id = self.service_id.clone();

        async move {
            let peer = connection.remote_id();
            info!(%peer, service = %service_id, "accepted connection");
            shared.adopt(connection, service_id);
            Ok(())
        }
    }
}

/// Serve every stream the peer opens on `connection` until it closes.
///
/// Each stream runs on its own task bounded by `handle_timeout`; a failing
/// or slow handler never affects the connection or its other streams.
///
/// At the deadline the handler future is dropped together with its stream,
/// so the caller sees the stream end instead of a response.
pub(crate) async fn serve_streams(
    connection: &Connection,
    service: Arc<dyn Service>,
    remote: NodeId,
    protocol: ProtocolId,
    handle_timeout: Duration,
) {
    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                debug!(peer = %remote, %protocol, reason = %e, "connection closed");
                return;
            }
        };

        let stream = ServiceStream::new(recv, send, StreamInfo::new(remote.clone(), protocol.clone()));
        let service = Arc::clone(&service);
        let span = tracing::debug_span!("stream", peer = %remote, %protocol);
        tokio::spawn(
            async move {
                match tokio::time::timeout(handle_timeout, service.handle(stream)).await {
                    Ok(Ok(())) => debug!("stream served"),
                    Ok(Err(e)) => debug!(error = %e, "stream handler failed"),
                    Err(_) => warn!(timeout = ?handle_timeout, "stream handler timed out"),
                }
            }
            .instrument(span),
        );
    }
}
