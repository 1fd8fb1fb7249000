//! Client and service helpers for structured request/response calls.

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::codec::RpcCodec;
use super::method::Method;
use super::{RequestHeader, ResponseHeader};
use crate::error::{Error, Result};

/// Error text sent back when a request header or body cannot be decoded.
pub const MALFORMED_REQUEST: &str = "malformed request";

/// Send one request and wait for its response.
///
/// An error reported by the remote side comes back as [`Error::Remote`]
/// carrying the remote text unchanged.
pub async fn handle_client_request<Req, Res>(
    codec: &mut RpcCodec,
    method: &str,
    request: &Req,
) -> Result<Res>
where
    Req: Serialize + ?Sized + Sync,
    Res: DeserializeOwned,
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
    codec.read_value().await
}

/// Read the request header and resolve it against a method table.
///
/// Undecodable headers and unknown methods are reported to the caller
/// through the response header before the error is returned.
pub async fn read_method<M: Method>(codec: &mut RpcCodec) -> Result<M> {
    let header: RequestHeader = match codec.read_value().await {
        Ok(header) => header,
        Err(err) => {
            report(codec, MALFORMED_REQUEST).await;
            return Err(Error::MalformedRequest(err.to_string()));
        }
    };

    match M::from_name(&header.method_name) {
        Some(method) => Ok(method),
        None => {
            let err = Error::UnsupportedMethod(header.method_name);
            report(codec, &err.to_string()).await;
            Err(err)
        }
    }
}

/// Decode a request body, run `handler`, and write its outcome.
///
/// Handler errors are forwarded verbatim in the response header and also
/// returned, so the serving side can log them.
pub async fn handle_service_request<Req, Res, F, Fut>(codec: &mut RpcCodec, handler: F) -> Result<()>
where
    Req: DeserializeOwned,
    Res: Serialize,
    F: FnOnce(Req) -> Fut,
    Fut: Future<Output = Result<Res>>,
{
    let request: Req = match codec.read_value().await {
        Ok(request) => request,
        Err(err) => {
            report(codec, MALFORMED_REQUEST).await;
            return Err(Error::MalformedRequest(err.to_string()));
        }
    };

    match handler(request).await {
        Ok(response) => {
            codec.write_value(&ResponseHeader::ok()).await?;
            codec.write_value(&response).await
        }
        Err(err) => {
            codec
                .write_value(&ResponseHeader::error(err.to_string()))
                .await?;
            Err(err)
        }
    }
}

/// Best-effort error report; the stream may already be unusable.
pub(crate) async fn report(codec: &mut RpcCodec, message: &str) {
    if let Err(e) = codec.write_value(&ResponseHeader::error(message)).await {
        debug!(remote = %codec.info().remote, error = %e, "could not report error to caller");
    }
}
