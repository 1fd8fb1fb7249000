//! Stream-based RPC dispatch.
//!
//! One call uses one service stream. The caller writes a [`RequestHeader`]
//! naming the method, then the request body. The callee answers with a
//! [`ResponseHeader`]; the response body follows only when the header carries
//! no error. Bulk data (frame buffers) rides the binary extension: a
//! [`PayloadHeader`] declaring a size, followed by exactly that many raw bytes.
//!
//! Nothing in this layer retries. Retry policy belongs to callers.

pub mod binary;
pub mod client;
pub mod codec;
pub mod dispatch;
pub mod method;
pub mod pool;

use serde::{Deserialize, Serialize};

pub use binary::{
    handle_client_binary_request, handle_client_upload, handle_service_binary_request,
    handle_service_upload,
};
pub use client::{RpcClient, StreamOpener, DEFAULT_CALL_TIMEOUT};
pub use codec::RpcCodec;
pub use dispatch::{handle_client_request, handle_service_request, read_method, MALFORMED_REQUEST};
pub use method::Method;
pub use pool::{BufferPool, PooledBuffer};

/// First value of every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestHeader {
    /// Method to invoke.
    pub method_name: String,
}

/// First value of every response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Error reported by the callee. Absent or empty means success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseHeader {
    /// Header for a successful response.
    pub fn ok() -> Self {
        Self { error: None }
    }

    /// Header carrying an error message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
        }
    }

    /// The reported error, treating an empty message as success.
    pub fn into_error(self) -> Option<String> {
        self.error.filter(|e| !e.is_empty())
    }
}

/// Declares the number of raw bytes that follow on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadHeader {
    /// Payload length in bytes.
    pub size: u64,
}

/// Body of methods that take or return nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}
