//! AsyncRead/AsyncWrite wrapper for service streams.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::alpn::ProtocolId;
use crate::id::NodeId;

/// Boxed read half of a service stream.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
/// Boxed write half of a service stream.
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Information about the peer on the other end of a stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// The remote node.
    pub remote: NodeId,
    /// Protocol the stream belongs to.
    pub protocol: ProtocolId,
    /// When the stream was opened or accepted.
    pub opened_at: Instant,
}

impl StreamInfo {
    /// Info for a stream opened now.
    pub fn new(remote: NodeId, protocol: ProtocolId) -> Self {
        Self {
            remote,
            protocol,
            opened_at: Instant::now(),
        }
    }
}

/// A duplex byte stream carrying one RPC exchange.
///
/// Over the network this wraps the two halves of a QUIC bidirectional
/// stream; for in-process calls it wraps the halves of an in-memory duplex.
pub struct ServiceStream {
    reader: BoxedReader,
    writer: BoxedWriter,
    info: StreamInfo,
}

impl std::fmt::Debug for ServiceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceStream")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl ServiceStream {
    /// Creates a ServiceStream from a read half, a write half and peer info.
    pub fn new<R, W>(reader: R, writer: W, info: StreamInfo) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
            info,
        }
    }

    /// Peer information.
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Split into the read half, the write half and the peer info.
    pub fn into_parts(self) -> (BoxedReader, BoxedWriter, StreamInfo) {
        (self.reader, self.writer, self.info)
    }
}

impl AsyncRead for ServiceStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.reader.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for ServiceStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.writer.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.writer.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.writer.as_mut().poll_shutdown(cx)
    }
}

/// Create two connected in-memory service streams.
///
/// `max_buf_size` bounds how many bytes may be in flight in each direction
/// before writers wait for the reader.
pub fn duplex_pair(
    max_buf_size: usize,
    a: StreamInfo,
    b: StreamInfo,
) -> (ServiceStream, ServiceStream) {
    let (left, right) = tokio::io::duplex(max_buf_size);
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);
    (
        ServiceStream::new(left_read, left_write, a),
        ServiceStream::new(right_read, right_write, b),
    )
}
