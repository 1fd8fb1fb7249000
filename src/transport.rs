//! The transport: one iroh endpoint and router hosting every local service.
//!
//! Services are registered under their protocol id. Connections on the node
//! protocol double as presence: the first one to a peer triggers
//! identification and attachment to the registrar, the last one closing
//! triggers detachment.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use iroh::endpoint::Connection;
use iroh::protocol::Router;
use iroh::endpoint::RelayMode;
use iroh::{Endpoint, EndpointAddr, EndpointId};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

use crate::alpn::ProtocolId;
use crate::capability::node::{LocalNode, Node, NodeClient, NodeService, NODE_SERVICE};
use crate::client::{dial, ConnectionPool};
use crate::error::{Error, Result};
use crate::id::{NodeId, ServiceId};
use crate::identity::NodeIdentity;
use crate::registrar::NodeRegistrar;
use crate::repository::ServiceRepository;
use crate::rpc::StreamOpener;
use crate::server::{serve_streams, ServiceProtocolHandler};
use crate::service::{Service, HANDLE_TIMEOUT};
use crate::stream::{ServiceStream, StreamInfo};

/// Application id used when none is configured.
pub const DEFAULT_APPLICATION_ID: &str = "kvm";

/// Options for [`Transport::open`].
#[derive(Clone)]
pub struct TransportOptions {
    /// Namespace shared by every node of one fabric; part of each protocol id.
    pub application_id: String,
    /// Node identity. A fresh one is generated when absent.
    pub identity: Option<NodeIdentity>,
    /// Local UDP address to bind. The OS picks when absent.
    pub bind_addr: Option<SocketAddrV4>,
    /// Registrar that receives attached nodes. A new one is created when absent.
    pub registrar: Option<NodeRegistrar>,
    /// Services to host in addition to the built-in node service.
    pub services: Vec<Arc<dyn Service>>,
    /// Host name reported by the node service.
    pub host_name: String,
    /// Span every background task runs in.
    pub span: Span,
    /// Upper bound on serving one inbound stream.
    pub handle_timeout: Duration,
    /// Attach the local node to the registrar on open.
    pub attach_self: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            application_id: DEFAULT_APPLICATION_ID.to_string(),
            identity: None,
            bind_addr: None,
            registrar: None,
            services: Vec::new(),
            host_name: default_host_name(),
            span: Span::none(),
            handle_timeout: HANDLE_TIMEOUT,
            attach_self: true,
        }
    }
}

impl TransportOptions {
    /// Set the application id.
    pub fn application_id(mut self, application_id: impl Into<String>) -> Self {
        self.application_id = application_id.into();
        self
    }

    /// Set the node identity.
    pub fn identity(mut self, identity: NodeIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Bind to a specific local address.
    pub fn bind_addr(mut self, addr: SocketAddrV4) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Share an existing registrar.
    pub fn registrar(mut self, registrar: NodeRegistrar) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Host one more service.
    pub fn service(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Set the reported host name.
    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    /// Run background tasks inside `span`.
    pub fn span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Bound the time spent serving one inbound stream.
    pub fn handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    /// Whether to attach the local node on open.
    pub fn attach_self(mut self, attach: bool) -> Self {
        self.attach_self = attach;
        self
    }
}

impl std::fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptions")
            .field("application_id", &self.application_id)
            .field("identity", &self.identity)
            .field("bind_addr", &self.bind_addr)
            .field("services", &self.services.len())
            .field("host_name", &self.host_name)
            .field("handle_timeout", &self.handle_timeout)
            .field("attach_self", &self.attach_self)
            .finish_non_exhaustive()
    }
}

fn default_host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Debug, Clone, Copy)]
enum PeerEvent {
    Connected(EndpointId),
    Disconnected(EndpointId),
}

/// State shared by the transport, its protocol handlers and its handles.
pub(crate) struct Shared {
    application_id: String,
    local_id: NodeId,
    endpoint: Endpoint,
    registrar: NodeRegistrar,
    repository: ServiceRepository,
    connections: ConnectionPool,
    known_addrs: Mutex<HashMap<EndpointId, EndpointAddr>>,
    presence: Mutex<HashMap<EndpointId, usize>>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    handle_timeout: Duration,
    span: Span,
    closed: AtomicBool,
}

impl Shared {
    fn protocol(&self, service_id: &ServiceId) -> ProtocolId {
        ProtocolId::new(&self.application_id, service_id)
    }

    /// Take ownership of a connection, inbound or outbound.
    ///
    /// The connection is pooled, counted for presence when it carries the
    /// node protocol, and served until it closes: streams the peer opens are
    /// dispatched to the local service for the connection's protocol.
    pub(crate) fn adopt(self: &Arc<Self>, connection: Connection, service_id: ServiceId) {
        let peer = connection.remote_id();
        let protocol = self.protocol(&service_id);
        let presence = service_id.as_str() == NODE_SERVICE;

        self.connections.insert(peer, protocol.clone(), connection.clone());
        if presence {
            self.presence_up(peer);
        }

        let shared = Arc::clone(self);
        let span = self.span.clone();
        tokio::spawn(
            async move {
                match shared.repository.get_service_by_id(&service_id) {
                    Ok(service) => {
                        serve_streams(
                            &connection,
                            service,
                            NodeId::from(peer),
                            protocol.clone(),
                            shared.handle_timeout,
                        )
                        .await
                    }
                    Err(_) => {
                        connection.closed().await;
                    }
                }
                shared.connections.remove_if_same(peer, &protocol, &connection);
                if presence {
                    shared.presence_down(peer);
                }
            }
            .instrument(span),
        );
    }

    fn presence_up(&self, peer: EndpointId) {
        let mut presence = self.presence.lock().unwrap_or_else(|e| e.into_inner());
        let count = presence.entry(peer).or_insert(0);
        *count += 1;
        if *count == 1 {
            let _ = self.peer_events.send(PeerEvent::Connected(peer));
        }
    }

    fn presence_down(&self, peer: EndpointId) {
        let mut presence = self.presence.lock().unwrap_or_else(|e| e.into_inner());
        let Some(count) = presence.get_mut(&peer) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            presence.remove(&peer);
            let _ = self.peer_events.send(PeerEvent::Disconnected(peer));
        }
    }

    fn is_present(&self, peer: EndpointId) -> bool {
        self.presence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&peer)
    }

    /// Best known address of a peer: the last one it was reached at.
    fn addr_of(&self, peer: EndpointId) -> EndpointAddr {
        self.known_addrs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&peer)
            .cloned()
            .unwrap_or_else(|| EndpointAddr::new(peer))
    }

    async fn connection(self: &Arc<Self>, addr: EndpointAddr, service_id: &ServiceId) -> Result<Connection> {
        let peer = addr.id;
        let protocol = self.protocol(service_id);
        if let Some(connection) = self.connections.get(peer, &protocol) {
            return Ok(connection);
        }
        let connection = dial(&self.endpoint, peer, addr.clone(), &protocol).await?;
        if !addr.addrs.is_empty() {
            self.known_addrs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(peer, addr);
        }
        self.adopt(connection.clone(), service_id.clone());
        Ok(connection)
    }

    async fn open_service_stream(
        self: &Arc<Self>,
        service_id: &ServiceId,
        node_id: &NodeId,
    ) -> Result<ServiceStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }
        if node_id == &self.local_id {
            return self.repository.open_local_stream(
                &self.application_id,
                service_id,
                node_id,
                self.handle_timeout,
            );
        }

        let peer = node_id.to_endpoint_id()?;
        let protocol = self.protocol(service_id);
        let connection = self.connection(self.addr_of(peer), service_id).await?;
        let (send, recv) = connection.open_bi().await.map_err(|source| Error::OpenStream {
            node_id: node_id.clone(),
            protocol: protocol.clone(),
            source,
        })?;
        Ok(ServiceStream::new(recv, send, StreamInfo::new(node_id.clone(), protocol)))
    }

    async fn connect(self: &Arc<Self>, addr: EndpointAddr) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }
        self.connection(addr, &ServiceId::new(NODE_SERVICE)).await?;
        Ok(())
    }
}

/// Identify a freshly connected peer and attach it.
async fn identify(shared: Arc<Shared>, peer: EndpointId) {
    let node_id = NodeId::from(peer);
    if shared.registrar.is_attached(&node_id) {
        return;
    }

    let opener: Arc<dyn StreamOpener> = Arc::new(TransportHandle {
        shared: Arc::downgrade(&shared),
    });
    let node = NodeClient::new(opener, node_id.clone());
    match node.node_id().await {
        Ok(reported) if reported == node_id => {}
        Ok(reported) => {
            warn!(peer = %node_id, %reported, "peer reported a different node id");
            return;
        }
        Err(e) => {
            warn!(peer = %node_id, error = %e, "could not identify peer");
            return;
        }
    }

    match shared.registrar.attach_node(Arc::new(node)).await {
        Ok(()) => {
            // The peer may have left while it was being identified.
            if !shared.is_present(peer) && shared.registrar.is_attached(&node_id) {
                let _ = shared.registrar.detach_node(&node_id);
            }
        }
        Err(e) if e.is_registry_race() => debug!(peer = %node_id, "peer already attached"),
        Err(e) => warn!(peer = %node_id, error = %e, "could not attach peer"),
    }
}

async fn watch_peers(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = events.recv() => match event {
                Some(PeerEvent::Connected(peer)) => {
                    debug!(%peer, "peer connected");
                    tokio::spawn(identify(Arc::clone(&shared), peer).instrument(Span::current()));
                }
                Some(PeerEvent::Disconnected(peer)) => {
                    debug!(%peer, "peer disconnected");
                    let node_id = NodeId::from(peer);
                    if shared.registrar.is_attached(&node_id) {
                        if let Err(e) = shared.registrar.detach_node(&node_id) {
                            debug!(peer = %node_id, error = %e, "detach raced");
                        }
                    }
                }
                None => break,
            },
        }
    }
    debug!("peer watcher stopped");
}

/// A running transport.
pub struct Transport {
    shared: Arc<Shared>,
    router: Router,
    shutdown_tx: broadcast::Sender<()>,
    watcher: JoinHandle<()>,
}

impl Transport {
    /// Bind the endpoint and start hosting services.
    pub async fn open(options: TransportOptions) -> Result<Self> {
        let identity = match options.identity {
            Some(identity) => identity,
            None => NodeIdentity::generate(),
        };
        let local_id = identity.node_id().clone();

        let mut service_ids: Vec<ServiceId> =
            options.services.iter().map(|s| s.service_id()).collect();
        service_ids.push(ServiceId::new(NODE_SERVICE));
        service_ids.sort();

        let local_node = Arc::new(LocalNode::new(
            local_id.clone(),
            options.host_name.clone(),
            service_ids,
        ));
        let mut services = options.services;
        services.push(Arc::new(NodeService::new(local_node.clone())));
        let repository = ServiceRepository::new(services)?;

        let mut builder = Endpoint::builder()
            .secret_key(identity.secret_key().clone())
            .relay_mode(RelayMode::Disabled)
            .clear_discovery();
        if let Some(addr) = options.bind_addr {
            builder = builder.bind_addr_v4(addr);
        }
        let endpoint = builder.bind().await.map_err(|e| Error::Bind(e.to_string()))?;

        let registrar = options.registrar.unwrap_or_default();
        if options.attach_self {
            if let Err(e) = registrar.attach_node(local_node).await {
                endpoint.close().await;
                return Err(e);
            }
        }

        let (peer_events, peer_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            application_id: options.application_id,
            local_id: local_id.clone(),
            endpoint: endpoint.clone(),
            registrar: registrar.clone(),
            repository,
            connections: ConnectionPool::default(),
            known_addrs: Mutex::new(HashMap::new()),
            presence: Mutex::new(HashMap::new()),
            peer_events,
            handle_timeout: options.handle_timeout,
            span: options.span,
            closed: AtomicBool::new(false),
        });

        let mut router = Router::builder(endpoint);
        for service_id in shared.repository.get_all_service_ids() {
            let protocol = shared.protocol(&service_id);
            debug!(%protocol, "registering service");
            router = router.accept(
                protocol.as_bytes().to_vec(),
                ServiceProtocolHandler::new(Arc::clone(&shared), service_id),
            );
        }
        let router = router.spawn();

        let (shutdown_tx, _) = broadcast::channel(1);
        let watcher = tokio::spawn(
            watch_peers(Arc::clone(&shared), peer_rx, shutdown_tx.subscribe())
                .instrument(shared.span.clone()),
        );

        info!(node = %local_id, application = %shared.application_id, "transport open");
        Ok(Self {
            shared,
            router,
            shutdown_tx,
            watcher,
        })
    }

    /// Open a stream to a service on a node.
    ///
    /// Streams to the local node are served in-process.
    pub async fn open_service_stream(&self, service_id: &ServiceId, node_id: &NodeId) -> Result<ServiceStream> {
        self.shared.open_service_stream(service_id, node_id).await
    }

    /// Establish the presence connection to a known node.
    pub async fn connect(&self, node_id: &NodeId) -> Result<()> {
        let peer = node_id.to_endpoint_id()?;
        self.shared.connect(self.shared.addr_of(peer)).await
    }

    /// Establish the presence connection to a node at a known address.
    pub async fn connect_addr(&self, addr: EndpointAddr) -> Result<()> {
        self.shared.connect(addr).await
    }

    /// Local node id.
    pub fn node_id(&self) -> &NodeId {
        &self.shared.local_id
    }

    /// Application id this transport serves.
    pub fn application_id(&self) -> &str {
        &self.shared.application_id
    }

    /// The underlying endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// Registrar receiving attached nodes.
    pub fn registrar(&self) -> &NodeRegistrar {
        &self.shared.registrar
    }

    /// Local service repository.
    pub fn repository(&self) -> &ServiceRepository {
        &self.shared.repository
    }

    /// Span background tasks run in.
    pub fn span(&self) -> &Span {
        &self.shared.span
    }

    /// A cheap handle for opening streams and connections.
    ///
    /// It does not keep the transport alive; once the transport is
    /// terminated it fails with [`Error::Terminated`].
    pub fn handle(&self) -> TransportHandle {
        TransportHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Stop the watcher and shut down the router and endpoint.
    pub async fn terminate(self) -> Result<()> {
        info!(node = %self.shared.local_id, "terminating transport");
        self.shared.closed.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.watcher.await {
            warn!("peer watcher failed: {e}");
        }
        if let Err(e) = self.router.shutdown().await {
            warn!("router shutdown error: {e}");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("node_id", &self.shared.local_id)
            .field("application_id", &self.shared.application_id)
            .field("connections", &self.shared.connections.len())
            .finish_non_exhaustive()
    }
}

/// Weak handle to a [`Transport`].
#[derive(Clone)]
pub struct TransportHandle {
    shared: Weak<Shared>,
}

impl TransportHandle {
    fn upgrade(&self) -> Result<Arc<Shared>> {
        match self.shared.upgrade() {
            Some(shared) if !shared.closed.load(Ordering::Acquire) => Ok(shared),
            _ => Err(Error::Terminated),
        }
    }

    /// Local node id.
    pub fn node_id(&self) -> Result<NodeId> {
        Ok(self.upgrade()?.local_id.clone())
    }

    /// Establish the presence connection to a node.
    pub async fn connect(&self, addr: EndpointAddr) -> Result<()> {
        self.upgrade()?.connect(addr).await
    }

    /// Whether a node is attached to the transport's registrar.
    pub fn is_attached(&self, node_id: &NodeId) -> bool {
        self.upgrade()
            .map(|shared| shared.registrar.is_attached(node_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl StreamOpener for TransportHandle {
    async fn open_service_stream(&self, service_id: &ServiceId, node_id: &NodeId) -> Result<ServiceStream> {
        self.upgrade()?.open_service_stream(service_id, node_id).await
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}
