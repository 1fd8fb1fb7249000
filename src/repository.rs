//! Local lookup of hosted services.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, Instrument};

use crate::alpn::ProtocolId;
use crate::error::{Error, Result};
use crate::id::{NodeId, ServiceId};
use crate::service::Service;
use crate::stream::{duplex_pair, ServiceStream, StreamInfo};

/// In-flight byte budget of a loopback stream in each direction.
const LOOPBACK_BUFFER: usize = 64 * 1024;

/// Fixed map from service id to the service that handles it.
#[derive(Clone, Default)]
pub struct ServiceRepository {
    services: Arc<RwLock<HashMap<ServiceId, Arc<dyn Service>>>>,
}

impl ServiceRepository {
    /// Build a repository, rejecting two services that share an id.
    pub fn new(services: impl IntoIterator<Item = Arc<dyn Service>>) -> Result<Self> {
        let mut map: HashMap<ServiceId, Arc<dyn Service>> = HashMap::new();
        for service in services {
            let id = service.service_id();
            if map.contains_key(&id) {
                return Err(Error::DuplicateService(id));
            }
            map.insert(id, service);
        }
        Ok(Self {
            services: Arc::new(RwLock::new(map)),
        })
    }

    /// Look up a service by id.
    pub fn get_service_by_id(&self, service_id: &ServiceId) -> Result<Arc<dyn Service>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service_id)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(service_id.clone()))
    }

    /// Every hosted service id, sorted.
    pub fn get_all_service_ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Serve a call to a local service over an in-memory stream.
    ///
    /// The service side runs on its own task bounded by `handle_timeout`; the
    /// caller gets the other end of the pipe. Both ends carry the protocol id
    /// the call would have used over the network.
    pub fn open_local_stream(
        &self,
        application_id: &str,
        service_id: &ServiceId,
        local: &NodeId,
        handle_timeout: Duration,
    ) -> Result<ServiceStream> {
        let service = self.get_service_by_id(service_id)?;
        let protocol = ProtocolId::new(application_id, service_id);
        let (client, server) = duplex_pair(
            LOOPBACK_BUFFER,
            StreamInfo::new(local.clone(), protocol.clone()),
            StreamInfo::new(local.clone(), protocol),
        );

        let span = tracing::debug_span!("loopback", service = %service_id);
        tokio::spawn(
            async move {
                match tokio::time::timeout(handle_timeout, service.handle(server)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(error = %e, "loopback call failed"),
                    Err(_) => debug!("loopback call timed out"),
                }
            }
            .instrument(span),
        );
        Ok(client)
    }
}

impl std::fmt::Debug for ServiceRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRepository")
            .field("services", &self.get_all_service_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::HANDLE_TIMEOUT;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Upper(&'static str);

    #[async_trait]
    impl Service for Upper {
        fn service_id(&self) -> ServiceId {
            ServiceId::new(self.0)
        }

        async fn handle(&self, mut stream: ServiceStream) -> Result<()> {
            let mut text = String::new();
            stream.read_to_string(&mut text).await?;
            stream.write_all(text.to_uppercase().as_bytes()).await?;
            stream.shutdown().await?;
            Ok(())
        }
    }

    fn repo(ids: &[&'static str]) -> Result<ServiceRepository> {
        ServiceRepository::new(
            ids.iter()
                .map(|id| Arc::new(Upper(id)) as Arc<dyn Service>)
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn lookup_and_listing() {
        let repo = repo(&["b", "a"]).unwrap();
        assert_eq!(repo.get_service_by_id(&ServiceId::new("a")).unwrap().service_id(), ServiceId::new("a"));
        assert_eq!(
            repo.get_all_service_ids(),
            vec![ServiceId::new("a"), ServiceId::new("b")]
        );
        assert!(matches!(
            repo.get_service_by_id(&ServiceId::new("c")),
            Err(Error::ServiceNotFound(id)) if id.as_str() == "c"
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        assert!(matches!(
            repo(&["a", "a"]),
            Err(Error::DuplicateService(id)) if id.as_str() == "a"
        ));
    }

    #[tokio::test]
    async fn local_stream_reaches_service() {
        let repo = repo(&["upper"]).unwrap();
        let mut stream = repo
            .open_local_stream("app", &ServiceId::new("upper"), &NodeId::new("me"), HANDLE_TIMEOUT)
            .unwrap();
        assert_eq!(stream.info().protocol.to_string(), "/app/upper");
        stream.write_all(b"hello").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, "HELLO");
    }

    struct Stuck;

    #[async_trait]
    impl Service for Stuck {
        fn service_id(&self) -> ServiceId {
            ServiceId::new("stuck")
        }

        async fn handle(&self, _stream: ServiceStream) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn local_stream_honours_handle_timeout() {
        let repo = ServiceRepository::new([Arc::new(Stuck) as Arc<dyn Service>]).unwrap();
        let mut stream = repo
            .open_local_stream(
                "app",
                &ServiceId::new("stuck"),
                &NodeId::new("me"),
                Duration::from_millis(50),
            )
            .unwrap();

        // The service end is dropped at the deadline, so the caller sees EOF.
        let mut reply = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(1), stream.read_to_end(&mut reply)).await;
        assert_eq!(read.unwrap().unwrap(), 0);
    }
}
