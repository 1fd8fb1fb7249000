//! The contract every locally hosted service implements.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::id::ServiceId;
use crate::stream::ServiceStream;

/// Upper bound on how long one inbound stream may be served.
pub const HANDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// A service reachable over its own protocol id.
///
/// `handle` runs once per inbound stream on its own task. Errors are logged
/// by the caller and never tear down the connection.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Id this service is registered under.
    fn service_id(&self) -> ServiceId;

    /// Serve one stream to completion.
    async fn handle(&self, stream: ServiceStream) -> Result<()>;
}
