//! Binary-payload extension.
//!
//! Metadata travels as ordinary framed values; the bulk bytes follow a
//! [`PayloadHeader`] raw on the same stream and land in a buffer borrowed
//! from a caller-supplied [`BufferPool`].

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::codec::RpcCodec;
use super::dispatch::{report, MALFORMED_REQUEST};
use super::pool::{BufferPool, PooledBuffer};
use super::{Empty, PayloadHeader, RequestHeader, ResponseHeader};
use crate::error::{Error, Result};

/// Send one request and receive a binary payload in response.
pub async fn handle_client_binary_request<Req>(
    codec: &mut RpcCodec,
    method: &str,
    request: &Req,
    pool: &BufferPool,
) -> Result<PooledBuffer>
where
    Req: Serialize + ?Sized + Sync,
{
    codec
        .write_value(&RequestHeader {
            method_name: method.to_owned(),
        })
        .await?;
    codec.write_value(request).await?;

    let header: ResponseHeader = codec.read_value().await?;
    if let Some(error) = header.into_error() {
        return Err(Error::Remote(error));
    }
    let payload: PayloadHeader = codec.read_value().await?;
    codec.read_payload(payload.size, pool).await
}

/// Decode a request, run `handler`, and stream the bytes it returns.
pub async fn handle_service_binary_request<Req, P, F, Fut>(
    codec: &mut RpcCodec,
    handler: F,
) -> Result<()>
where
    Req: DeserializeOwned,
    P: AsRef<[u8]>,
    F: FnOnce(Req) -> Fut,
    Fut: Future<Output = Result<P>>,
{
    let request: Req = match codec.read_value().await {
        Ok(request) => request,
        Err(err) => {
            report(codec, MALFORMED_REQUEST).await;
            return Err(Error::MalformedRequest(err.to_string()));
        }
    };

    match handler(request).await {
        Ok(payload) => {
            let bytes = payload.as_ref();
            codec.write_value(&ResponseHeader::ok()).await?;
            codec
                .write_value(&PayloadHeader {
                    size: bytes.len() as u64,
                })
                .await?;
            codec.write_payload(bytes).await
        }
        Err(err) => {
            codec
                .write_value(&ResponseHeader::error(err.to_string()))
                .await?;
            Err(err)
        }
    }
}

/// Send a binary payload as the request body and wait for the acknowledgement.
pub async fn handle_client_upload(codec: &mut RpcCodec, method: &str, payload: &[u8]) -> Result<()> {
    codec
        .write_value(&RequestHeader {
            method_name: method.to_owned(),
        })
        .await?;
    codec
        .write_value(&PayloadHeader {
            size: payload.len() as u64,
        })
        .await?;
    codec.write_payload(payload).await?;

    let header: ResponseHeader = codec.read_value().await?;
    if let Some(error) = header.into_error() {
        return Err(Error::Remote(error));
    }
    let _: Empty = codec.read_value().await?;
    Ok(())
}

/// Receive a binary request body into a pooled buffer and run `handler` on it.
///
/// The buffer is owned by the handler future; it returns to the pool when
/// the handler finishes or when reading the payload fails.
pub async fn handle_service_upload<F, Fut>(
    codec: &mut RpcCodec,
    pool: &BufferPool,
    handler: F,
) -> Result<()>
where
    F: FnOnce(PooledBuffer) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let payload: PayloadHeader = match codec.read_value().await {
        Ok(payload) => payload,
        Err(err) => {
            report(codec, MALFORMED_REQUEST).await;
            return Err(Error::MalformedRequest(err.to_string()));
        }
    };

    let buffer = match codec.read_payload(payload.size, pool).await {
        Ok(buffer) => buffer,
        Err(err) => {
            report(codec, &err.to_string()).await;
            return Err(err);
        }
    };

    match handler(buffer).await {
        Ok(()) => {
            codec.write_value(&ResponseHeader::ok()).await?;
            codec.write_value(&Empty {}).await
        }
        Err(err) => {
            codec
                .write_value(&ResponseHeader::error(err.to_string()))
                .await?;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alpn::ProtocolId;
    use crate::id::{NodeId, ServiceId};
    use crate::stream::{duplex_pair, StreamInfo};

    fn codecs(read_capacity: usize) -> (RpcCodec, RpcCodec) {
        let info = || StreamInfo::new(NodeId::new("peer"), ProtocolId::new("t", &ServiceId::new("frames")));
        let (a, b) = duplex_pair(8192, info(), info());
        (
            RpcCodec::with_read_capacity(read_capacity, a),
            RpcCodec::with_read_capacity(read_capacity, b),
        )
    }

    fn frame(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn payload_size_independent_of_read_buffer() {
        let pool = BufferPool::default();
        for len in [0usize, 1, 63, 64, 65, 4096, 100_000] {
            let (mut client, mut server) = codecs(64);
            let served = tokio::spawn(async move {
                handle_service_binary_request(&mut server, |_: Empty| async move { Ok(frame(len)) })
                    .await
            });

            let payload = handle_client_binary_request(&mut client, "CaptureFrame", &Empty {}, &pool)
                .await
                .unwrap();
            assert_eq!(payload.len(), len);
            assert_eq!(&payload[..], &frame(len)[..]);
            served.await.unwrap().unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn binary_handler_error_skips_payload() {
        let pool = BufferPool::default();
        let (mut client, mut server) = codecs(64);
        let served = tokio::spawn(async move {
            handle_service_binary_request(&mut server, |_: Empty| async move {
                Err::<Vec<u8>, _>(Error::Remote("no signal".into()))
            })
            .await
        });

        let err = handle_client_binary_request(&mut client, "CaptureFrame", &Empty {}, &pool)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no signal");
        assert!(served.await.unwrap().is_err());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn upload_reaches_handler_and_releases_buffer() {
        let pool = BufferPool::default();
        let server_pool = pool.clone();
        let (mut client, mut server) = codecs(32);
        let served = tokio::spawn(async move {
            handle_service_upload(&mut server, &server_pool, |buffer| async move {
                assert_eq!(&buffer[..], &frame(5000)[..]);
                Ok(())
            })
            .await
        });

        handle_client_upload(&mut client, "PresentFrame", &frame(5000))
            .await
            .unwrap();
        served.await.unwrap().unwrap();
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn oversized_upload_is_refused() {
        let pool = BufferPool::new(1, 16);
        let (mut client, mut server) = codecs(32);
        let served = tokio::spawn(async move {
            // Header already consumed by the method table in real services.
            let _: RequestHeader = server.read_value().await?;
            handle_service_upload(&mut server, &pool, |_| async { Ok(()) }).await
        });

        let err = handle_client_upload(&mut client, "PresentFrame", &frame(17))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
        assert!(matches!(
            served.await.unwrap(),
            Err(Error::PayloadTooLarge { size: 17, max: 16 })
        ));
    }
}
