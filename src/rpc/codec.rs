//! Newline-delimited JSON value codec with raw payload passthrough.
//!
//! Each structured value is written as compact JSON followed by `\n`. Compact
//! JSON never contains a raw newline, so values are self-delimiting without a
//! length prefix: consecutive writes on one side match consecutive reads on
//! the other. Raw payload bytes are read through the same buffered reader, so
//! bytes already buffered behind a value line are not lost.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::trace;

use super::pool::{BufferPool, PooledBuffer};
use crate::error::{Error, Result};
use crate::stream::{BoxedReader, BoxedWriter, ServiceStream, StreamInfo};

/// Longest single encoded value accepted from the wire.
pub const MAX_VALUE_LEN: usize = 16 * 1024 * 1024;

const DEFAULT_READ_CAPACITY: usize = 8 * 1024;

/// Reads and writes framed values on one service stream.
pub struct RpcCodec {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    info: StreamInfo,
}

impl RpcCodec {
    /// Wrap a stream with the default read buffer size.
    pub fn new(stream: ServiceStream) -> Self {
        Self::with_read_capacity(DEFAULT_READ_CAPACITY, stream)
    }

    /// Wrap a stream with a specific read buffer size.
    pub fn with_read_capacity(capacity: usize, stream: ServiceStream) -> Self {
        let (reader, writer, info) = stream.into_parts();
        Self {
            reader: BufReader::with_capacity(capacity, reader),
            writer,
            info,
        }
    }

    /// Peer information of the underlying stream.
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Encode one value and flush it.
    pub async fn write_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let mut line = serde_json::to_vec(value).map_err(Error::Encode)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        trace!(bytes = line.len(), "wrote value");
        Ok(())
    }

    /// Decode the next value.
    pub async fn read_value<T: DeserializeOwned>(&mut self) -> Result<T> {
        let line = self.read_line().await?;
        serde_json::from_slice(&line).map_err(Error::Decode)
    }

    /// Write raw payload bytes and flush them.
    pub async fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Copy exactly `size` raw bytes into a buffer borrowed from `pool`.
    ///
    /// On any failure the borrowed buffer is returned to the pool before the
    /// error reaches the caller.
    pub async fn read_payload(&mut self, size: u64, pool: &BufferPool) -> Result<PooledBuffer> {
        let len = usize::try_from(size).map_err(|_| Error::PayloadTooLarge {
            size,
            max: pool.max_buffer_size(),
        })?;
        let mut buffer = pool.borrow(len)?;
        match self.reader.read_exact(&mut buffer).await {
            Ok(_) => Ok(buffer),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::UnexpectedEof),
            Err(e) => Err(e.into()),
        }
    }

    /// Close the write direction.
    pub async fn finish(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Err(Error::UnexpectedEof);
            }
            let (chunk, done) = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (&available[..pos], pos + 1),
                None => (available, available.len()),
            };
            if line.len() + chunk.len() > MAX_VALUE_LEN {
                return Err(Error::ValueTooLarge { max: MAX_VALUE_LEN });
            }
            line.extend_from_slice(chunk);
            let found_newline = done > chunk.len();
            self.reader.consume(done);
            if found_newline {
                return Ok(line);
            }
        }
    }
}

impl std::fmt::Debug for RpcCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcCodec")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alpn::ProtocolId;
    use crate::id::{NodeId, ServiceId};
    use crate::stream::duplex_pair;
    use serde::Deserialize;
    use tokio::io::AsyncWriteExt;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        lines: Vec<String>,
    }

    fn pair(capacity: usize) -> (RpcCodec, RpcCodec) {
        let info = || StreamInfo::new(NodeId::new("peer"), ProtocolId::new("t", &ServiceId::new("s")));
        let (a, b) = duplex_pair(64 * 1024, info(), info());
        (
            RpcCodec::with_read_capacity(capacity, a),
            RpcCodec::with_read_capacity(capacity, b),
        )
    }

    #[tokio::test]
    async fn consecutive_values_read_in_order() {
        let (mut a, mut b) = pair(16);
        let sample = Sample {
            name: "multi\nline".into(),
            lines: vec!["x".into(), "y\n".into()],
        };
        a.write_value(&sample).await.unwrap();
        a.write_value(&42u32).await.unwrap();

        assert_eq!(b.read_value::<Sample>().await.unwrap(), sample);
        assert_eq!(b.read_value::<u32>().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn value_split_across_reads() {
        let reader = tokio_test::io::Builder::new()
            .read(b"{\"name\":\"fr")
            .read(b"ag\",\"lines\":[]}")
            .read(b"\n7\n")
            .build();
        let writer = tokio_test::io::Builder::new().build();
        let info = StreamInfo::new(NodeId::new("peer"), ProtocolId::new("t", &ServiceId::new("s")));
        let mut codec = RpcCodec::with_read_capacity(4, ServiceStream::new(reader, writer, info));

        let sample: Sample = codec.read_value().await.unwrap();
        assert_eq!(sample.name, "frag");
        assert!(sample.lines.is_empty());
        assert_eq!(codec.read_value::<u8>().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn truncated_value_is_an_error() {
        let (a, mut b) = pair(16);
        let RpcCodec { mut writer, .. } = a;
        writer.write_all(b"{\"name\":\"cut").await.unwrap();
        writer.shutdown().await.unwrap();

        let err = b.read_value::<Sample>().await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof));
    }

    #[tokio::test]
    async fn garbage_is_a_decode_error() {
        let (a, mut b) = pair(16);
        let RpcCodec { mut writer, .. } = a;
        writer.write_all(b"not json\n").await.unwrap();

        let err = b.read_value::<Sample>().await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[tokio::test]
    async fn payload_follows_value_line_through_buffer() {
        let pool = BufferPool::default();
        for size in [0usize, 1, 15, 16, 17, 1000, 40_000] {
            let (mut a, mut b) = pair(16);
            let bytes: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            a.write_value(&size).await.unwrap();
            a.write_payload(&bytes).await.unwrap();

            let declared: usize = b.read_value().await.unwrap();
            let payload = b.read_payload(declared as u64, &pool).await.unwrap();
            assert_eq!(&payload[..], &bytes[..]);
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn short_payload_releases_buffer() {
        let pool = BufferPool::default();
        let (mut a, mut b) = pair(16);
        a.write_payload(b"only ten b").await.unwrap();
        a.finish().await.unwrap();

        let err = b.read_payload(100, &pool).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof));
        assert_eq!(pool.outstanding(), 0);
    }
}
