use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bfr_types::{BfrError, NodeId, NodeState};

use crate::listener::{LifecycleListener, ListenerId, ListenerRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    pub state: NodeState,
    /// Fresh for every process start; tells a restart from a repeated hello.
    pub incarnation: Uuid,
}

impl NodeInfo {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        NodeInfo {
            id: id.into(),
            address: address.into(),
            state: NodeState::Joining,
            incarnation: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveReason {
    /// The node said goodbye.
    Graceful,
    /// The node stopped answering heartbeats.
    Failure,
}

/// Registry of known nodes and their lifecycle state.
pub struct MembershipManager {
    local: NodeId,
    nodes: RwLock<BTreeMap<NodeId, NodeInfo>>,
    listeners: Arc<ListenerRegistry>,
}

impl MembershipManager {
    pub fn new(local: NodeId, listeners: Arc<ListenerRegistry>) -> Self {
        MembershipManager {
            local,
            nodes: RwLock::new(BTreeMap::new()),
            listeners,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    /// Record the local node as ONLINE without notifying listeners.
    pub fn register_local(&self, info: NodeInfo) {
        let id = info.id.clone();
        let online = NodeInfo {
            state: NodeState::Online,
            ..info
        };
        self.nodes.write().insert(id, online);
    }

    pub fn register_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) -> ListenerId {
        self.listeners.register(listener)
    }

    pub fn unregister_lifecycle_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    /// Admit a node.
    ///
    /// The node is JOINING while listeners vote and `handshake` runs, then
    /// ONLINE. A refusal restores the previous state; a failed handshake
    /// leaves the node OFFLINE.
    pub async fn join<F>(&self, node: NodeInfo, handshake: F) -> Result<(), BfrError>
    where
        F: Future<Output = Result<(), BfrError>> + Send,
    {
        let id = node.id.clone();
        let previous = {
            let mut nodes = self.nodes.write();
            let previous = nodes.get(&id).cloned();
            if matches!(
                previous.as_ref().map(|n| n.state),
                Some(NodeState::Online | NodeState::Joining)
            ) {
                return Err(BfrError::NodeAlreadyOnline(id));
            }
            let joining = NodeInfo {
                state: NodeState::Joining,
                ..node
            };
            nodes.insert(id.clone(), joining);
            previous
        };

        if !self.listeners.node_joining(&id).await {
            tracing::info!(node = %id, "join refused by lifecycle listener");
            let mut nodes = self.nodes.write();
            match previous {
                Some(prev) => {
                    nodes.insert(id.clone(), prev);
                }
                None => {
                    nodes.remove(&id);
                }
            }
            return Err(BfrError::JoinRefused(id));
        }

        if let Err(e) = handshake.await {
            tracing::warn!(node = %id, error = %e, "join handshake failed");
            self.set_state(&id, NodeState::Offline);
            return Err(e);
        }

        self.set_state(&id, NodeState::Online);
        tracing::info!(node = %id, members = self.online_nodes().len(), "node joined");
        self.listeners.node_joined(&id).await;
        Ok(())
    }

    /// Record a departure. Returns `false` when the node was not present, or
    /// had already left; listeners are only told once.
    pub async fn leave(&self, node: &str, reason: LeaveReason) -> bool {
        let next = match reason {
            LeaveReason::Graceful => NodeState::Left,
            LeaveReason::Failure => NodeState::Offline,
        };
        {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(node) {
                Some(info) if matches!(info.state, NodeState::Online | NodeState::Joining) => {
                    info.state = next;
                }
                _ => return false,
            }
        }
        tracing::info!(node, ?reason, state = %next, "node left");
        self.listeners.node_left(node).await;
        true
    }

    fn set_state(&self, node: &str, state: NodeState) {
        if let Some(info) = self.nodes.write().get_mut(node) {
            info.state = state;
        }
    }

    pub fn get(&self, node: &str) -> Option<NodeInfo> {
        self.nodes.read().get(node).cloned()
    }

    pub fn state(&self, node: &str) -> Option<NodeState> {
        self.nodes.read().get(node).map(|n| n.state)
    }

    pub fn is_online(&self, node: &str) -> bool {
        self.state(node) == Some(NodeState::Online)
    }

    pub fn online_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.state == NodeState::Online)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Online nodes other than the local one.
    pub fn online_peers(&self) -> Vec<NodeId> {
        self.online_nodes().into_iter().filter(|n| *n != self.local).collect()
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Counter {
        calls: Mutex<Vec<String>>,
        refuse: bool,
    }

    impl LifecycleListener for Counter {
        fn on_node_joining(&self, node: &str) -> bool {
            self.calls.lock().push(format!("joining:{node}"));
            !self.refuse
        }

        fn on_node_joined(&self, node: &str) {
            self.calls.lock().push(format!("joined:{node}"));
        }

        fn on_node_left(&self, node: &str) {
            self.calls.lock().push(format!("left:{node}"));
        }
    }

    fn manager() -> MembershipManager {
        MembershipManager::new("n1".into(), Arc::new(ListenerRegistry::new(Duration::from_secs(1))))
    }

    #[tokio::test]
    async fn join_then_leave_notifies_once() {
        let m = manager();
        let counter = Arc::new(Counter::default());
        m.register_lifecycle_listener(counter.clone());

        m.join(NodeInfo::new("n2", "127.0.0.1:2425"), async { Ok(()) }).await.unwrap();
        assert_eq!(m.state("n2"), Some(NodeState::Online));

        // Second join of an online node is rejected without callbacks.
        let err = m
            .join(NodeInfo::new("n2", "127.0.0.1:2425"), async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, BfrError::NodeAlreadyOnline(_)));

        assert!(m.leave("n2", LeaveReason::Graceful).await);
        assert!(!m.leave("n2", LeaveReason::Graceful).await);
        assert_eq!(m.state("n2"), Some(NodeState::Left));

        assert_eq!(
            *counter.calls.lock(),
            vec!["joining:n2".to_string(), "joined:n2".to_string(), "left:n2".to_string()]
        );
    }

    #[tokio::test]
    async fn refused_join_restores_previous_state() {
        let m = manager();
        m.join(NodeInfo::new("n2", "addr"), async { Ok(()) }).await.unwrap();
        m.leave("n2", LeaveReason::Failure).await;
        assert_eq!(m.state("n2"), Some(NodeState::Offline));

        m.register_lifecycle_listener(Arc::new(Counter { refuse: true, ..Default::default() }));
        let err = m.join(NodeInfo::new("n2", "addr"), async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, BfrError::JoinRefused(_)));
        assert_eq!(m.state("n2"), Some(NodeState::Offline));

        let err = m.join(NodeInfo::new("n3", "addr"), async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, BfrError::JoinRefused(_)));
        assert_eq!(m.state("n3"), None);
    }

    #[tokio::test]
    async fn failed_handshake_leaves_node_offline() {
        let m = manager();
        let err = m
            .join(NodeInfo::new("n2", "addr"), async {
                Err(BfrError::NodeUnavailable("n2".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BfrError::NodeUnavailable(_)));
        assert_eq!(m.state("n2"), Some(NodeState::Offline));
        assert!(m.online_peers().is_empty());
    }
}
