//! Peer discovery and connection initiation.
//!
//! Peers come from two sources: mDNS announcements on the local network and
//! a static bootstrap list. For every pair of nodes only the one with the
//! larger id dials, so each pair ends up with a single presence connection.
//! A periodic sweep re-considers every known peer. A peer whose dial fails is
//! forgotten until it is announced again; nothing retries it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use iroh::discovery::mdns::{DiscoveryEvent, MdnsDiscovery};
use iroh::EndpointAddr;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn, Instrument};

use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::transport::{Transport, TransportHandle};
use crate::user_data::{encode_rendezvous, user_data_has_rendezvous};

/// Options for [`Discoverer::start`].
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// How often every known peer is re-considered. Default: 30 seconds.
    pub sweep_interval: Duration,
    /// Timeout for one dial. Default: 5 seconds.
    pub dial_timeout: Duration,
    /// Maximum simultaneous dials. Default: 8.
    pub max_inflight: usize,
    /// Peers to consider without waiting for an announcement.
    pub static_peers: Vec<EndpointAddr>,
    /// Announce and listen on the local network. Default: on.
    pub mdns: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(5),
            max_inflight: 8,
            static_peers: Vec::new(),
            mdns: true,
        }
    }
}

impl DiscoveryOptions {
    /// Set the sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the per-dial timeout.
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the in-flight dial cap.
    pub fn max_inflight(mut self, n: usize) -> Self {
        self.max_inflight = n;
        self
    }

    /// Add a bootstrap peer.
    pub fn static_peer(mut self, addr: EndpointAddr) -> Self {
        self.static_peers.push(addr);
        self
    }

    /// Enable or disable mDNS.
    pub fn mdns(mut self, enabled: bool) -> Self {
        self.mdns = enabled;
        self
    }
}

/// Whether the local node is the one that dials `remote`.
pub fn should_initiate(local: &NodeId, remote: &NodeId) -> bool {
    local > remote
}

/// What discovery needs from the transport.
#[async_trait]
pub trait PeerDialer: Send + Sync + 'static {
    /// Whether the peer is already attached.
    fn is_attached(&self, node_id: &NodeId) -> bool;

    /// Establish the presence connection to a peer.
    async fn dial(&self, addr: EndpointAddr) -> Result<()>;
}

#[async_trait]
impl PeerDialer for TransportHandle {
    fn is_attached(&self, node_id: &NodeId) -> bool {
        TransportHandle::is_attached(self, node_id)
    }

    async fn dial(&self, addr: EndpointAddr) -> Result<()> {
        self.connect(addr).await
    }
}

/// Candidate bookkeeping and dial decisions.
struct Candidates<D> {
    dialer: Arc<D>,
    local: NodeId,
    known: BTreeMap<NodeId, EndpointAddr>,
    inflight: HashSet<NodeId>,
    dials: JoinSet<(NodeId, bool)>,
    dial_timeout: Duration,
    max_inflight: usize,
}

impl<D: PeerDialer> Candidates<D> {
    fn new(dialer: Arc<D>, local: NodeId, options: &DiscoveryOptions) -> Self {
        Self {
            dialer,
            local,
            known: BTreeMap::new(),
            inflight: HashSet::new(),
            dials: JoinSet::new(),
            dial_timeout: options.dial_timeout,
            max_inflight: options.max_inflight.max(1),
        }
    }

    /// Record a discovered peer and dial it if this side should.
    fn consider(&mut self, addr: EndpointAddr, source: &'static str) {
        let node_id = NodeId::from(addr.id);
        if node_id == self.local {
            return;
        }
        if self.known.insert(node_id.clone(), addr).is_none() {
            debug!(peer = %node_id, source, "discovered peer");
        }
        self.try_dial(&node_id);
    }

    /// Drop a peer until it is announced again.
    fn forget(&mut self, node_id: &NodeId) {
        if self.known.remove(node_id).is_some() {
            debug!(peer = %node_id, "forgot peer");
        }
    }

    /// Re-consider every known peer.
    fn sweep(&mut self) {
        let known: Vec<NodeId> = self.known.keys().cloned().collect();
        trace!(peers = known.len(), "discovery sweep");
        for node_id in known {
            self.try_dial(&node_id);
        }
    }

    fn try_dial(&mut self, node_id: &NodeId) {
        if !should_initiate(&self.local, node_id) {
            trace!(peer = %node_id, "peer initiates");
            return;
        }
        if self.dialer.is_attached(node_id) || self.inflight.contains(node_id) {
            return;
        }
        if self.inflight.len() >= self.max_inflight {
            debug!(peer = %node_id, "dial deferred to next sweep");
            return;
        }
        let Some(addr) = self.known.get(node_id).cloned() else {
            return;
        };

        self.inflight.insert(node_id.clone());
        let dialer = Arc::clone(&self.dialer);
        let timeout = self.dial_timeout;
        let node_id = node_id.clone();
        self.dials.spawn(
            async move {
                let connected = match tokio::time::timeout(timeout, dialer.dial(addr)).await {
                    Ok(Ok(())) => {
                        debug!(peer = %node_id, "dialed peer");
                        true
                    }
                    Ok(Err(e)) => {
                        warn!(peer = %node_id, error = %e, "dial failed");
                        false
                    }
                    Err(_) => {
                        warn!(peer = %node_id, ?timeout, "dial timed out");
                        false
                    }
                };
                (node_id, connected)
            }
            .in_current_span(),
        );
    }

    fn finished(&mut self, node_id: &NodeId, connected: bool) {
        self.inflight.remove(node_id);
        if !connected {
            self.forget(node_id);
        }
    }
}

/// A running discovery loop.
#[derive(Debug)]
pub struct Discoverer {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Discoverer {
    /// Announce the local node and start discovering peers for `transport`.
    pub async fn start(transport: &Transport, options: DiscoveryOptions) -> Result<Self> {
        let endpoint = transport.endpoint();
        let mdns = if options.mdns {
            let mdns = MdnsDiscovery::builder()
                .build(endpoint.id())
                .map_err(|e| Error::Discovery(e.to_string()))?;
            endpoint.discovery().add(mdns.clone());
            endpoint.set_user_data_for_discovery(Some(encode_rendezvous(transport.application_id())?));
            Some(mdns)
        } else {
            None
        };

        let dialer = Arc::new(transport.handle());
        let local = transport.node_id().clone();
        let application_id = transport.application_id().to_string();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        info!(node = %local, mdns = options.mdns, static_peers = options.static_peers.len(), "discovery started");
        let task = tokio::spawn(
            run(dialer, local, application_id, mdns, options, shutdown_rx)
                .instrument(transport.span().clone()),
        );
        Ok(Self { shutdown_tx, task })
    }

    /// Stop the loop and abort in-flight dials.
    pub async fn terminate(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!("discovery task failed: {e}");
        }
    }
}

async fn run<D: PeerDialer>(
    dialer: Arc<D>,
    local: NodeId,
    application_id: String,
    mdns: Option<MdnsDiscovery>,
    options: DiscoveryOptions,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut candidates = Candidates::new(dialer, local, &options);
    for addr in options.static_peers.iter().cloned() {
        candidates.consider(addr, "static");
    }

    let mut mdns_events = match &mdns {
        Some(mdns) => Some(Box::pin(mdns.subscribe().await)),
        None => None,
    };

    let mut sweep = tokio::time::interval(options.sweep_interval);
    // The first tick completes immediately.
    sweep.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = sweep.tick() => candidates.sweep(),
            Some(event) = async { if let Some(ref mut s) = mdns_events { s.next().await } else { None } } => {
                match event {
                    DiscoveryEvent::Discovered { endpoint_info, .. } => {
                        let matches = endpoint_info
                            .data
                            .user_data()
                            .is_some_and(|user_data| user_data_has_rendezvous(user_data, &application_id));
                        if matches {
                            candidates.consider(EndpointAddr::new(endpoint_info.endpoint_id), "mdns");
                        } else {
                            trace!(peer = %endpoint_info.endpoint_id, "mdns: rendezvous mismatch, skipping");
                        }
                    }
                    DiscoveryEvent::Expired { endpoint_id, .. } => {
                        candidates.forget(&NodeId::from(endpoint_id));
                    }
                }
            }
            Some(joined) = candidates.dials.join_next() => match joined {
                Ok((node_id, connected)) => candidates.finished(&node_id, connected),
                Err(e) => warn!("dial task failed: {e}"),
            },
        }
    }

    candidates.dials.shutdown().await;
    debug!("discovery stopped");
}
