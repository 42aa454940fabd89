use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use bfr_types::{DatabaseName, DbStatus, NodeId};

/// Subscriber to node lifecycle and database status changes.
///
/// Callbacks run on the blocking pool and are bounded by the listener
/// timeout. A callback that panics or overruns is logged and skipped.
pub trait LifecycleListener: Send + Sync + 'static {
    /// Called before a node is admitted. Returning `false` refuses the join.
    fn on_node_joining(&self, _node: &str) -> bool {
        true
    }

    fn on_node_joined(&self, _node: &str) {}

    fn on_node_left(&self, _node: &str) {}

    fn on_database_change_status(&self, _node: &str, _database: &str, _status: DbStatus) {}
}

/// The same notifications as [`LifecycleListener`], as a value for the event
/// stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    NodeJoined(NodeId),
    NodeLeft(NodeId),
    DatabaseStatusChanged {
        node: NodeId,
        database: DatabaseName,
        status: DbStatus,
    },
}

pub type ListenerId = u64;

/// Ordered set of listeners. Dispatch follows registration order.
pub struct ListenerRegistry {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn LifecycleListener>)>>,
    next_id: AtomicU64,
    timeout: Duration,
    events: broadcast::Sender<ClusterEvent>,
}

impl ListenerRegistry {
    pub fn new(timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(1024);
        ListenerRegistry {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            timeout,
            events,
        }
    }

    pub fn register(&self, listener: Arc<dyn LifecycleListener>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        id
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    fn snapshot(&self) -> Vec<Arc<dyn LifecycleListener>> {
        self.listeners.read().iter().map(|(_, l)| l.clone()).collect()
    }

    fn emit(&self, event: ClusterEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run one callback on the blocking pool, bounded by the timeout.
    /// `None` means the callback panicked or overran.
    async fn call<R, F>(
        &self,
        hook: &'static str,
        listener: Arc<dyn LifecycleListener>,
        f: F,
    ) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&dyn LifecycleListener) -> R + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(move || f(listener.as_ref()));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(r)) => Some(r),
            Ok(Err(e)) => {
                tracing::error!(hook, error = %e, "lifecycle listener failed");
                None
            }
            Err(_) => {
                tracing::warn!(
                    hook,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "lifecycle listener timed out"
                );
                None
            }
        }
    }

    /// Ask every listener whether `node` may join. Stops at the first refusal.
    pub async fn node_joining(&self, node: &str) -> bool {
        for listener in self.snapshot() {
            let n = node.to_string();
            let admitted = self
                .call("on_node_joining", listener, move |l| l.on_node_joining(&n))
                .await
                .unwrap_or(true);
            if !admitted {
                return false;
            }
        }
        true
    }

    pub async fn node_joined(&self, node: &str) {
        for listener in self.snapshot() {
            let n = node.to_string();
            self.call("on_node_joined", listener, move |l| l.on_node_joined(&n)).await;
        }
        self.emit(ClusterEvent::NodeJoined(node.to_string()));
    }

    pub async fn node_left(&self, node: &str) {
        for listener in self.snapshot() {
            let n = node.to_string();
            self.call("on_node_left", listener, move |l| l.on_node_left(&n)).await;
        }
        self.emit(ClusterEvent::NodeLeft(node.to_string()));
    }

    pub async fn database_status_changed(&self, node: &str, database: &str, status: DbStatus) {
        for listener in self.snapshot() {
            let (n, d) = (node.to_string(), database.to_string());
            self.call("on_database_change_status", listener, move |l| {
                l.on_database_change_status(&n, &d, status)
            })
            .await;
        }
        self.emit(ClusterEvent::DatabaseStatusChanged {
            node: node.to_string(),
            database: database.to_string(),
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl LifecycleListener for Recorder {
        fn on_node_joined(&self, node: &str) {
            self.log.lock().push(format!("{}:{node}", self.name));
        }
    }

    struct Panicky;

    impl LifecycleListener for Panicky {
        fn on_node_joined(&self, _node: &str) {
            panic!("listener bug");
        }
    }

    struct Slow;

    impl LifecycleListener for Slow {
        fn on_node_joined(&self, _node: &str) {
            std::thread::sleep(Duration::from_millis(500));
        }
    }

    struct Deny;

    impl LifecycleListener for Deny {
        fn on_node_joining(&self, _node: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn dispatch_in_registration_order() {
        let registry = ListenerRegistry::new(Duration::from_secs(1));
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(Arc::new(Recorder { name: "first", log: log.clone() }));
        registry.register(Arc::new(Recorder { name: "second", log: log.clone() }));

        registry.node_joined("n2").await;
        assert_eq!(*log.lock(), vec!["first:n2".to_string(), "second:n2".to_string()]);
    }

    #[tokio::test]
    async fn panicking_and_slow_listeners_do_not_block_others() {
        let registry = ListenerRegistry::new(Duration::from_millis(50));
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(Arc::new(Panicky));
        registry.register(Arc::new(Slow));
        registry.register(Arc::new(Recorder { name: "last", log: log.clone() }));

        let started = std::time::Instant::now();
        registry.node_joined("n2").await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(*log.lock(), vec!["last:n2".to_string()]);
    }

    #[tokio::test]
    async fn refusal_and_unregister() {
        let registry = ListenerRegistry::new(Duration::from_secs(1));
        assert!(registry.node_joining("n2").await);

        let id = registry.register(Arc::new(Deny));
        assert!(!registry.node_joining("n2").await);

        assert!(registry.unregister(id));
        assert!(registry.is_empty());
        assert!(registry.node_joining("n2").await);
    }

    #[tokio::test]
    async fn events_are_streamed() {
        let registry = ListenerRegistry::new(Duration::from_secs(1));
        let mut rx = registry.subscribe();
        registry.database_status_changed("n1", "db", DbStatus::Online).await;
        registry.node_left("n1").await;
        assert_eq!(
            rx.recv().await.unwrap(),
            ClusterEvent::DatabaseStatusChanged {
                node: "n1".into(),
                database: "db".into(),
                status: DbStatus::Online
            }
        );
        assert_eq!(rx.recv().await.unwrap(), ClusterEvent::NodeLeft("n1".into()));
    }
}
