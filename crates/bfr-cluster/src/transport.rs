use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use bfr_types::{
    BfrError, ClusterName, DatabaseName, DbStatus, NodeId, OpResponse, Operation, Record, RecordId,
};
use bfr_storage::{InstallStats, Snapshot};

use crate::config::DistributedConfig;
use crate::membership::NodeInfo;
use crate::resync::SyncMode;
use crate::status::StatusEntry;

/// Messages exchanged between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Join handshake. Carries the sender's configurations so that both sides
    /// of a healed partition learn what the other changed.
    Hello {
        node: NodeInfo,
        configs: Vec<DistributedConfig>,
    },
    Goodbye { node: NodeId },
    Ping,
    /// Run a client write with the receiver as coordinator.
    Coordinate {
        database: DatabaseName,
        op: Operation,
    },
    Replicate {
        database: DatabaseName,
        op: Operation,
    },
    Read {
        database: DatabaseName,
        record: RecordId,
    },
    Count {
        database: DatabaseName,
        class: String,
    },
    Snapshot {
        database: DatabaseName,
        cluster: Option<ClusterName>,
    },
    StatusChanged {
        node: NodeId,
        database: DatabaseName,
        status: DbStatus,
    },
    /// `created` is set when the database did not exist before this document.
    ConfigChanged {
        config: DistributedConfig,
        created: bool,
    },
    FetchConfigs,
    Resync {
        database: DatabaseName,
        mode: SyncMode,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Welcome {
        members: Vec<NodeInfo>,
        statuses: Vec<StatusEntry>,
        configs: Vec<DistributedConfig>,
    },
    Pong,
    Ack(OpResponse),
    Record(Option<Record>),
    Count(u64),
    Snapshot(Snapshot),
    Synced(InstallStats),
    Configs(Vec<DistributedConfig>),
    Done,
    Error(BfrError),
}

impl Response {
    /// Flatten a remote error into `Err`.
    pub fn into_result(self) -> Result<Response, BfrError> {
        match self {
            Response::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

/// Reliable point-to-point request/response addressed by node id.
///
/// `Err` means the message could not be delivered or answered
/// (`NodeUnavailable`); errors raised by the remote handler come back as
/// [`Response::Error`].
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        from: &str,
        to: &str,
        request: Request,
    ) -> impl Future<Output = Result<Response, BfrError>> + Send;
}

/// A request delivered to a node's inbox.
pub struct Envelope {
    pub from: NodeId,
    pub request: Request,
    pub reply: oneshot::Sender<Response>,
}

struct LocalInner {
    inboxes: HashMap<NodeId, mpsc::Sender<Envelope>>,
    isolated: HashSet<NodeId>,
    latency: HashMap<NodeId, Duration>,
}

/// In-process transport: every node of the process registers an inbox.
///
/// Supports fault injection: an isolated node can neither send nor receive,
/// and per-node latency delays delivery to that node.
pub struct LocalNetwork {
    inner: RwLock<LocalInner>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalNetwork {
            inner: RwLock::new(LocalInner {
                inboxes: HashMap::new(),
                isolated: HashSet::new(),
                latency: HashMap::new(),
            }),
        })
    }

    /// Register (or re-register after a restart) a node's inbox.
    pub fn register(&self, node: &str) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(1024);
        let mut g = self.inner.write();
        g.inboxes.insert(node.to_string(), tx);
        g.isolated.remove(node);
        rx
    }

    pub fn unregister(&self, node: &str) {
        self.inner.write().inboxes.remove(node);
    }

    /// Cut a node off from everybody, as in a network partition or crash.
    pub fn isolate(&self, node: &str) {
        self.inner.write().isolated.insert(node.to_string());
    }

    pub fn heal(&self, node: &str) {
        self.inner.write().isolated.remove(node);
    }

    pub fn set_latency(&self, node: &str, latency: Duration) {
        self.inner.write().latency.insert(node.to_string(), latency);
    }

    pub fn clear_latency(&self, node: &str) {
        self.inner.write().latency.remove(node);
    }
}

impl Transport for LocalNetwork {
    async fn send(&self, from: &str, to: &str, request: Request) -> Result<Response, BfrError> {
        let (inbox, latency) = {
            let g = self.inner.read();
            if g.isolated.contains(from) || g.isolated.contains(to) {
                return Err(BfrError::NodeUnavailable(to.to_string()));
            }
            let inbox = g
                .inboxes
                .get(to)
                .cloned()
                .ok_or_else(|| BfrError::NodeUnavailable(to.to_string()))?;
            (inbox, g.latency.get(to).copied())
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let (reply, rx) = oneshot::channel();
        let envelope = Envelope {
            from: from.to_string(),
            request,
            reply,
        };
        inbox
            .send(envelope)
            .await
            .map_err(|_| BfrError::NodeUnavailable(to.to_string()))?;
        rx.await.map_err(|_| BfrError::NodeUnavailable(to.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(mut rx: mpsc::Receiver<Envelope>) {
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                let _ = env.reply.send(Response::Pong);
            }
        });
    }

    #[tokio::test]
    async fn delivers_and_injects_faults() {
        let net = LocalNetwork::new();
        echo(net.register("b"));

        assert!(matches!(net.send("a", "b", Request::Ping).await.unwrap(), Response::Pong));
        assert!(matches!(
            net.send("a", "missing", Request::Ping).await.unwrap_err(),
            BfrError::NodeUnavailable(_)
        ));

        net.isolate("a");
        assert!(net.send("a", "b", Request::Ping).await.is_err());
        net.heal("a");
        assert!(net.send("a", "b", Request::Ping).await.is_ok());

        net.set_latency("b", Duration::from_millis(50));
        let ping = net.send("a", "b", Request::Ping);
        let slow = tokio::time::timeout(Duration::from_millis(10), ping).await;
        assert!(slow.is_err());
        net.clear_latency("b");

        net.unregister("b");
        assert!(net.send("a", "b", Request::Ping).await.is_err());
    }

    #[test]
    fn remote_errors_flatten() {
        let err = Response::Error(BfrError::Timeout).into_result().unwrap_err();
        assert_eq!(err, BfrError::Timeout);
        assert!(Response::Done.into_result().is_ok());
    }
}
