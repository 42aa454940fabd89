use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use bfr_types::{BfrError, DatabaseName, DbStatus, NodeId};

use crate::listener::ListenerRegistry;

/// One row of the status table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub node: NodeId,
    pub database: DatabaseName,
    pub status: DbStatus,
}

/// Per-(node, database) status table as seen by this node.
///
/// The local node validates its own transitions with [`set_status`]; status
/// changes announced by peers are applied with [`observe`].
///
/// [`set_status`]: DatabaseStatusTracker::set_status
/// [`observe`]: DatabaseStatusTracker::observe
pub struct DatabaseStatusTracker {
    table: RwLock<HashMap<(NodeId, DatabaseName), DbStatus>>,
    listeners: Arc<ListenerRegistry>,
    changed: watch::Sender<u64>,
    poll_interval: Duration,
}

impl DatabaseStatusTracker {
    pub fn new(listeners: Arc<ListenerRegistry>, poll_interval: Duration) -> Self {
        let (changed, _) = watch::channel(0);
        DatabaseStatusTracker {
            table: RwLock::new(HashMap::new()),
            listeners,
            changed,
            poll_interval,
        }
    }

    /// `None` means the database is not available on that node.
    pub fn get_status(&self, node: &str, database: &str) -> Option<DbStatus> {
        self.table.read().get(&(node.to_string(), database.to_string())).copied()
    }

    pub fn is_online(&self, node: &str, database: &str) -> bool {
        self.get_status(node, database) == Some(DbStatus::Online)
    }

    /// Validated transition. Returns `false` when the status was already
    /// `status` (no notification in that case).
    pub async fn set_status(
        &self,
        node: &str,
        database: &str,
        status: DbStatus,
    ) -> Result<bool, BfrError> {
        self.update(node, database, status, true).await
    }

    /// Apply a transition announced by the node that owns it.
    pub async fn observe(&self, node: &str, database: &str, status: DbStatus) -> bool {
        // Unvalidated updates cannot fail.
        self.update(node, database, status, false).await.unwrap_or(false)
    }

    async fn update(
        &self,
        node: &str,
        database: &str,
        status: DbStatus,
        validate: bool,
    ) -> Result<bool, BfrError> {
        {
            let mut table = self.table.write();
            let key = (node.to_string(), database.to_string());
            match table.get(&key) {
                Some(current) if *current == status => return Ok(false),
                Some(current) if validate && !current.can_transition_to(status) => {
                    return Err(BfrError::IllegalTransition {
                        node: node.to_string(),
                        database: database.to_string(),
                        from: *current,
                        to: status,
                    });
                }
                _ => {}
            }
            table.insert(key, status);
        }
        tracing::info!(node, database, %status, "database status changed");
        self.changed.send_modify(|generation| *generation += 1);
        self.listeners.database_status_changed(node, database, status).await;
        Ok(true)
    }

    /// Block until `node` reports `target` for `database`, or the timeout
    /// elapses.
    pub async fn wait_until(
        &self,
        node: &str,
        database: &str,
        target: DbStatus,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.changed.subscribe();
        loop {
            if self.get_status(node, database) == Some(target) {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let wake = (now + self.poll_interval).min(deadline);
            // Either a change notification or the poll tick; both re-check.
            let _ = tokio::time::timeout_at(wake, rx.changed()).await;
        }
    }

    /// Every database of `node` becomes OFFLINE. Returns the databases that
    /// changed.
    pub async fn mark_node_offline(&self, node: &str) -> Vec<DatabaseName> {
        let databases: Vec<DatabaseName> = self
            .table
            .read()
            .iter()
            .filter(|((n, _), s)| n == node && **s != DbStatus::Offline)
            .map(|((_, d), _)| d.clone())
            .collect();
        let mut changed = Vec::new();
        for database in databases {
            if self.observe(node, &database, DbStatus::Offline).await {
                changed.push(database);
            }
        }
        changed
    }

    /// Forget every entry of a dropped database.
    pub fn remove_database(&self, database: &str) {
        self.table.write().retain(|(_, d), _| d != database);
        self.changed.send_modify(|generation| *generation += 1);
    }

    /// Nodes reporting ONLINE for `database`, sorted.
    pub fn online_nodes(&self, database: &str) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .table
            .read()
            .iter()
            .filter(|((_, d), s)| d == database && **s == DbStatus::Online)
            .map(|((n, _), _)| n.clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub fn entries(&self) -> Vec<StatusEntry> {
        let mut entries: Vec<StatusEntry> = self
            .table
            .read()
            .iter()
            .map(|((node, database), status)| StatusEntry {
                node: node.clone(),
                database: database.clone(),
                status: *status,
            })
            .collect();
        entries.sort_by(|a, b| (&a.database, &a.node).cmp(&(&b.database, &b.node)));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::LifecycleListener;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct StatusLog(Mutex<Vec<(String, String, DbStatus)>>);

    impl LifecycleListener for StatusLog {
        fn on_database_change_status(&self, node: &str, database: &str, status: DbStatus) {
            self.0.lock().push((node.to_string(), database.to_string(), status));
        }
    }

    fn tracker() -> (DatabaseStatusTracker, Arc<StatusLog>) {
        let listeners = Arc::new(ListenerRegistry::new(Duration::from_secs(1)));
        let log = Arc::new(StatusLog::default());
        listeners.register(log.clone());
        (DatabaseStatusTracker::new(listeners, Duration::from_millis(20)), log)
    }

    #[tokio::test]
    async fn legal_path_notifies_each_change() {
        let (t, log) = tracker();
        assert!(t.set_status("n1", "db", DbStatus::Offline).await.unwrap());
        assert!(t.set_status("n1", "db", DbStatus::Synchronizing).await.unwrap());
        assert!(t.set_status("n1", "db", DbStatus::Online).await.unwrap());
        assert!(t.set_status("n1", "db", DbStatus::Backup).await.unwrap());
        assert!(t.set_status("n1", "db", DbStatus::Online).await.unwrap());
        // Same status again: no-op.
        assert!(!t.set_status("n1", "db", DbStatus::Online).await.unwrap());
        assert_eq!(log.0.lock().len(), 5);
        assert_eq!(t.get_status("n1", "db"), Some(DbStatus::Online));
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let (t, log) = tracker();
        t.set_status("n1", "db", DbStatus::Offline).await.unwrap();
        let err = t.set_status("n1", "db", DbStatus::Online).await.unwrap_err();
        assert!(matches!(
            err,
            BfrError::IllegalTransition { from: DbStatus::Offline, to: DbStatus::Online, .. }
        ));
        assert_eq!(t.get_status("n1", "db"), Some(DbStatus::Offline));
        assert_eq!(log.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn wait_until_wakes_on_change() {
        let (t, _) = tracker();
        let t = Arc::new(t);
        t.set_status("n1", "db", DbStatus::Offline).await.unwrap();

        let waiter = {
            let t = t.clone();
            tokio::spawn(async move {
                t.wait_until("n1", "db", DbStatus::Online, Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        t.set_status("n1", "db", DbStatus::Synchronizing).await.unwrap();
        t.set_status("n1", "db", DbStatus::Online).await.unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_until_times_out() {
        let (t, _) = tracker();
        let started = std::time::Instant::now();
        assert!(!t.wait_until("n1", "db", DbStatus::Online, Duration::from_millis(100)).await);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn node_offline_and_queries() {
        let (t, _) = tracker();
        t.set_status("n1", "a", DbStatus::Online).await.unwrap();
        t.set_status("n1", "b", DbStatus::Online).await.unwrap();
        t.set_status("n2", "a", DbStatus::Online).await.unwrap();
        assert_eq!(t.online_nodes("a"), vec!["n1".to_string(), "n2".to_string()]);

        let mut changed = t.mark_node_offline("n1").await;
        changed.sort();
        assert_eq!(changed, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(t.online_nodes("a"), vec!["n2".to_string()]);

        t.remove_database("a");
        assert_eq!(t.get_status("n2", "a"), None);
        assert_eq!(t.entries().len(), 1);
    }
}
