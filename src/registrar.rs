//! Registry of attached nodes with lossy event fan-out.
//!
//! Every mutation and the events it produces happen under one write lock,
//! so each subscriber sees the action event immediately followed by the
//! snapshot that includes it. Delivery never blocks: a subscriber whose
//! queue is full loses the event.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, trace};

use crate::capability::node::Node;
use crate::error::{Error, Result};
use crate::id::NodeId;

/// Queue depth of each subscription.
pub const EVENT_BUFFER: usize = 16;

/// Stream of events handed to one watcher.
pub type EventStream = ReceiverStream<RegistrarEvent>;

/// Change notification from the registrar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RegistrarEvent {
    /// A node was attached.
    #[serde(rename_all = "camelCase")]
    NodeAttached {
        /// Node id.
        id: NodeId,
        /// Host name reported by the node.
        host_name: String,
    },
    /// A node was detached.
    NodeDetached {
        /// Node id.
        id: NodeId,
    },
    /// Every attached node after the preceding change.
    RepositorySnapshot {
        /// Attached node ids, ordered.
        nodes: Vec<NodeId>,
    },
}

struct RegistryEntry {
    node: Arc<dyn Node>,
    host_name: String,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<NodeId, RegistryEntry>,
    subscribers: HashMap<u64, mpsc::Sender<RegistrarEvent>>,
    next_subscription: u64,
}

impl State {
    fn snapshot(&self) -> RegistrarEvent {
        RegistrarEvent::RepositorySnapshot {
            nodes: self.nodes.keys().cloned().collect(),
        }
    }

    fn broadcast(&self, event: RegistrarEvent) {
        for (subscription, tx) in &self.subscribers {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    trace!(subscription, "subscriber queue full, event dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(subscription, "subscriber gone");
                }
            }
        }
    }
}

/// Map of attached nodes shared by cheap clones.
#[derive(Clone, Default)]
pub struct NodeRegistrar {
    state: Arc<RwLock<State>>,
}

impl NodeRegistrar {
    /// Create an empty registrar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a node with this id is attached.
    pub fn is_attached(&self, node_id: &NodeId) -> bool {
        self.read().nodes.contains_key(node_id)
    }

    /// Attach a node.
    ///
    /// The node's id and host name are fetched before the lock is taken;
    /// for a remote node these are network calls.
    pub async fn attach_node(&self, node: Arc<dyn Node>) -> Result<()> {
        let id = node.node_id().await?;
        let host_name = node.host_name().await?;

        let mut state = self.write();
        if state.nodes.contains_key(&id) {
            return Err(Error::NodeIdAlreadyExists(id));
        }
        state.nodes.insert(
            id.clone(),
            RegistryEntry {
                node,
                host_name: host_name.clone(),
            },
        );
        info!(node = %id, host = %host_name, "node attached");
        state.broadcast(RegistrarEvent::NodeAttached { id, host_name });
        let snapshot = state.snapshot();
        state.broadcast(snapshot);
        Ok(())
    }

    /// Detach a node.
    pub fn detach_node(&self, node_id: &NodeId) -> Result<()> {
        let mut state = self.write();
        if state.nodes.remove(node_id).is_none() {
            return Err(Error::NodeIdNotFound(node_id.clone()));
        }
        info!(node = %node_id, "node detached");
        state.broadcast(RegistrarEvent::NodeDetached {
            id: node_id.clone(),
        });
        let snapshot = state.snapshot();
        state.broadcast(snapshot);
        Ok(())
    }

    /// Subscribe to registrar events until `cancelled` resolves.
    ///
    /// Only events emitted after this call are delivered. The subscription
    /// is removed, and the stream ends, once `cancelled` completes.
    pub fn watch_events<C>(&self, cancelled: C) -> EventStream
    where
        C: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let subscription = {
            let mut state = self.write();
            let subscription = state.next_subscription;
            state.next_subscription += 1;
            state.subscribers.insert(subscription, tx);
            subscription
        };
        debug!(subscription, "watcher subscribed");

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            cancelled.await;
            state
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .subscribers
                .remove(&subscription);
            debug!(subscription, "watcher unsubscribed");
        });

        ReceiverStream::new(rx)
    }

    /// Handle of an attached node.
    pub fn node(&self, node_id: &NodeId) -> Option<Arc<dyn Node>> {
        self.read()
            .nodes
            .get(node_id)
            .map(|entry| Arc::clone(&entry.node))
    }

    /// Host name recorded for an attached node.
    pub fn host_name(&self, node_id: &NodeId) -> Option<String> {
        self.read()
            .nodes
            .get(node_id)
            .map(|entry| entry.host_name.clone())
    }

    /// Ids of every attached node, ordered.
    pub fn attached_nodes(&self) -> Vec<NodeId> {
        self.read().nodes.keys().cloned().collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for NodeRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("NodeRegistrar")
            .field("nodes", &state.nodes.keys().collect::<Vec<_>>())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::node::LocalNode;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn node(id: &str) -> Arc<dyn Node> {
        Arc::new(LocalNode::new(NodeId::new(id), format!("host-{id}"), Vec::new()))
    }

    fn attached(id: &str) -> RegistrarEvent {
        RegistrarEvent::NodeAttached {
            id: NodeId::new(id),
            host_name: format!("host-{id}"),
        }
    }

    fn snapshot(ids: &[&str]) -> RegistrarEvent {
        RegistrarEvent::RepositorySnapshot {
            nodes: ids.iter().map(|id| NodeId::new(*id)).collect(),
        }
    }

    /// Drain everything currently queued without waiting for more.
    async fn drain(events: &mut EventStream) -> Vec<RegistrarEvent> {
        let mut out = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(20), events.next()).await
        {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn attach_detach_tracks_membership() {
        let registrar = NodeRegistrar::new();
        registrar.attach_node(node("a")).await.unwrap();
        registrar.attach_node(node("b")).await.unwrap();
        registrar.detach_node(&NodeId::new("a")).unwrap();

        assert!(!registrar.is_attached(&NodeId::new("a")));
        assert!(registrar.is_attached(&NodeId::new("b")));
        assert_eq!(registrar.attached_nodes(), vec![NodeId::new("b")]);
        assert_eq!(registrar.host_name(&NodeId::new("b")).as_deref(), Some("host-b"));
        assert!(registrar.node(&NodeId::new("a")).is_none());
    }

    #[tokio::test]
    async fn double_attach_is_rejected() {
        let registrar = NodeRegistrar::new();
        registrar.attach_node(node("a")).await.unwrap();
        let err = registrar.attach_node(node("a")).await.unwrap_err();
        assert!(matches!(err, Error::NodeIdAlreadyExists(ref id) if id.as_str() == "a"));
        assert!(err.is_registry_race());
        assert_eq!(registrar.attached_nodes(), vec![NodeId::new("a")]);
    }

    #[tokio::test]
    async fn detach_of_absent_node_emits_nothing() {
        let registrar = NodeRegistrar::new();
        let (_cancel, cancelled) = oneshot::channel::<()>();
        let mut events = registrar.watch_events(async move {
            let _ = cancelled.await;
        });

        let err = registrar.detach_node(&NodeId::new("ghost")).unwrap_err();
        assert!(matches!(err, Error::NodeIdNotFound(_)));
        assert!(drain(&mut events).await.is_empty());
    }

    #[tokio::test]
    async fn each_change_emits_action_then_snapshot() {
        let registrar = NodeRegistrar::new();
        let (_cancel, cancelled) = oneshot::channel::<()>();
        let mut events = registrar.watch_events(async move {
            let _ = cancelled.await;
        });

        registrar.attach_node(node("a")).await.unwrap();
        registrar.attach_node(node("b")).await.unwrap();
        registrar.detach_node(&NodeId::new("a")).unwrap();

        assert_eq!(
            drain(&mut events).await,
            vec![
                attached("a"),
                snapshot(&["a"]),
                attached("b"),
                snapshot(&["a", "b"]),
                RegistrarEvent::NodeDetached { id: NodeId::new("a") },
                snapshot(&["b"]),
            ]
        );
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_later_events() {
        let registrar = NodeRegistrar::new();
        registrar.attach_node(node("a")).await.unwrap();

        let (cancel, cancelled) = oneshot::channel::<()>();
        let mut events = registrar.watch_events(async move {
            let _ = cancelled.await;
        });
        registrar.attach_node(node("b")).await.unwrap();
        assert_eq!(
            drain(&mut events).await,
            vec![attached("b"), snapshot(&["a", "b"])]
        );

        cancel.send(()).unwrap();
        // The stream ends once the subscription is torn down.
        let end = tokio::time::timeout(Duration::from_secs(1), events.next()).await;
        assert_eq!(end.unwrap(), None);
    }

    #[tokio::test]
    async fn full_subscriber_loses_events_without_blocking() {
        let registrar = NodeRegistrar::new();
        let (_cancel, cancelled) = oneshot::channel::<()>();
        let mut events = registrar.watch_events(async move {
            let _ = cancelled.await;
        });

        // Each attach emits two events; ten attaches overflow the 16 slots.
        for i in 0..10 {
            registrar.attach_node(node(&format!("n{i}"))).await.unwrap();
        }
        let received = drain(&mut events).await;
        assert_eq!(received.len(), EVENT_BUFFER);
        assert_eq!(received[0], attached("n0"));
        assert_eq!(registrar.attached_nodes().len(), 10);
    }

    #[test]
    fn event_wire_shape() {
        let json = serde_json::to_value(attached("a")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "nodeAttached", "id": "a", "hostName": "host-a"})
        );
        let json = serde_json::to_value(snapshot(&["a"])).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "repositorySnapshot",
                "nodes": ["a"]
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_attaches_of_one_id_admit_exactly_one() {
        let registrar = NodeRegistrar::new();
        let (_cancel, cancelled) = oneshot::channel::<()>();
        let mut events = registrar.watch_events(async move {
            let _ = cancelled.await;
        });

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let registrar = registrar.clone();
            tasks.spawn(async move { registrar.attach_node(node("a")).await });
        }
        let mut admitted = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined.unwrap() {
                Ok(()) => admitted += 1,
                Err(e) => assert!(matches!(e, Error::NodeIdAlreadyExists(_)), "{e}"),
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(
            drain(&mut events).await,
            vec![attached("a"), snapshot(&["a"])]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_changes_keep_action_and_snapshot_adjacent() {
        let registrar = NodeRegistrar::new();
        let (_cancel, cancelled) = oneshot::channel::<()>();
        let mut events = registrar.watch_events(async move {
            let _ = cancelled.await;
        });
        let ids = ["a", "b", "c", "d"];

        // Four attaches and four detaches: 16 events, exactly one queue.
        let mut tasks = tokio::task::JoinSet::new();
        for id in ids {
            let registrar = registrar.clone();
            tasks.spawn(async move { registrar.attach_node(node(id)).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }
        for id in ids {
            let registrar = registrar.clone();
            tasks.spawn(async move { registrar.detach_node(&NodeId::new(id)) });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        let received = drain(&mut events).await;
        assert_eq!(received.len(), 16);
        let mut members = std::collections::BTreeSet::new();
        for pair in received.chunks(2) {
            match &pair[0] {
                RegistrarEvent::NodeAttached { id, .. } => assert!(members.insert(id.clone())),
                RegistrarEvent::NodeDetached { id } => assert!(members.remove(id)),
                other => panic!("expected an action event, got {other:?}"),
            }
            assert_eq!(
                pair[1],
                RegistrarEvent::RepositorySnapshot {
                    nodes: members.iter().cloned().collect()
                }
            );
        }
        assert!(members.is_empty());
        assert!(registrar.attached_nodes().is_empty());
    }
}
