use std::sync::Arc;

use tokio::task::JoinSet;

use bfr_storage::RecordStore;
use bfr_types::{
    BfrError, DatabaseName, DbStatus, NodeId, OpResponse, Operation, Record, RecordId,
};

use crate::config::{ClusterSettings, ConfigRegistry, DistributedConfig};
use crate::conflict::ConflictDetector;
use crate::listener::ListenerRegistry;
use crate::membership::{MembershipManager, NodeInfo};
use crate::placement::Placement;
use crate::quorum::{QuorumCoordinator, WriteTarget};
use crate::resync::{Resynchronizer, SyncMode};
use crate::status::DatabaseStatusTracker;
use crate::transport::{Request, Response, Transport};

/// Everything one node owns, shared by the request loop, the heartbeat
/// monitor and the public API.
pub struct NodeContext<S, T> {
    pub info: NodeInfo,
    pub settings: ClusterSettings,
    pub store: Arc<S>,
    pub transport: Arc<T>,
    pub listeners: Arc<ListenerRegistry>,
    pub membership: MembershipManager,
    pub status: DatabaseStatusTracker,
    pub configs: ConfigRegistry,
    pub placement: Placement,
    pub conflicts: ConflictDetector<S>,
    pub quorum: QuorumCoordinator<T>,
    pub resync: Resynchronizer,
}

impl<S: RecordStore, T: Transport> NodeContext<S, T> {
    pub fn new(
        info: NodeInfo,
        settings: ClusterSettings,
        store: Arc<S>,
        transport: Arc<T>,
    ) -> Self {
        let listeners = Arc::new(ListenerRegistry::new(settings.listener_timeout()));
        let membership = MembershipManager::new(info.id.clone(), listeners.clone());
        membership.register_local(info.clone());
        NodeContext {
            status: DatabaseStatusTracker::new(
                listeners.clone(),
                settings.status_poll_interval(),
            ),
            conflicts: ConflictDetector::new(store.clone()),
            quorum: QuorumCoordinator::new(
                info.id.clone(),
                transport.clone(),
                settings.request_timeout(),
                settings.max_auto_retry,
                settings.retry_backoff(),
            ),
            resync: Resynchronizer::new(settings.resync_timeout()),
            configs: ConfigRegistry::new(),
            placement: Placement::new(),
            membership,
            listeners,
            info,
            settings,
            store,
            transport,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.info.id
    }

    /// `node` is reachable and reports `database` ONLINE.
    pub fn serves(&self, node: &str, database: &str) -> bool {
        self.membership.is_online(node) && self.status.is_online(node, database)
    }

    /// Online replicas of a cluster, local node first.
    pub fn replicas(&self, config: &DistributedConfig, cluster: &str) -> Vec<NodeId> {
        let mut replicas: Vec<NodeId> = config
            .servers(cluster)
            .iter()
            .filter(|node| self.serves(node.as_str(), &config.database))
            .cloned()
            .collect();
        if let Some(pos) = replicas.iter().position(|n| n == self.local_id()) {
            let local = replicas.remove(pos);
            replicas.insert(0, local);
        }
        replicas
    }

    /// Online replicas of a cluster paired with their role, local node first.
    pub fn write_targets(&self, config: &DistributedConfig, cluster: &str) -> Vec<WriteTarget> {
        self.replicas(config, cluster)
            .into_iter()
            .map(|node| {
                let role = config.role(&node);
                (node, role)
            })
            .collect()
    }

    pub fn config(&self, database: &str) -> Result<Arc<DistributedConfig>, BfrError> {
        self.configs
            .get_online(database)
            .ok_or_else(|| BfrError::DatabaseNotFound(database.to_string()))
    }

    /// Reject requests for a database this node does not hold ONLINE.
    pub fn require_online(&self, database: &str) -> Result<(), BfrError> {
        if self.status.is_online(self.local_id(), database) {
            Ok(())
        } else {
            Err(BfrError::DatabaseNotOnline {
                database: database.to_string(),
                node: Some(self.info.id.clone()),
            })
        }
    }

    /// Request/response with a peer, bounded by the request timeout. Remote
    /// errors come back as `Err`.
    pub async fn send(&self, to: &str, request: Request) -> Result<Response, BfrError> {
        tokio::time::timeout(
            self.settings.request_timeout(),
            self.transport.send(self.local_id(), to, request),
        )
        .await
        .map_err(|_| BfrError::Timeout)??
        .into_result()
    }

    /// Send `request` to every online peer concurrently.
    pub async fn broadcast(
        &self,
        request: Request,
    ) -> Vec<(NodeId, Result<Response, BfrError>)> {
        let mut set = JoinSet::new();
        for peer in self.membership.online_peers() {
            let transport = self.transport.clone();
            let from = self.info.id.clone();
            let request = request.clone();
            let timeout = self.settings.request_timeout();
            set.spawn(async move {
                let reply = tokio::time::timeout(timeout, transport.send(&from, &peer, request))
                    .await
                    .unwrap_or(Err(BfrError::Timeout))
                    .and_then(Response::into_result);
                (peer, reply)
            });
        }
        let mut replies = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(reply) => replies.push(reply),
                Err(e) => tracing::error!(error = %e, "broadcast task failed"),
            }
        }
        replies
    }

    /// Change the local status of `database` and tell the peers.
    pub async fn publish_status(
        &self,
        database: &str,
        status: DbStatus,
    ) -> Result<bool, BfrError> {
        let changed = self
            .status
            .set_status(self.local_id(), database, status)
            .await?;
        if changed {
            self.announce_status(database, status).await;
        }
        Ok(changed)
    }

    /// Mark a freshly created database ONLINE locally, whatever an older
    /// incarnation left in the table, and tell the peers.
    pub async fn publish_created(&self, database: &str) -> Result<(), BfrError> {
        self.store.drop_database(database).await?;
        self.store.create_database(database).await?;
        self.status.observe(self.local_id(), database, DbStatus::Online).await;
        self.announce_status(database, DbStatus::Online).await;
        Ok(())
    }

    async fn announce_status(&self, database: &str, status: DbStatus) {
        let request = Request::StatusChanged {
            node: self.info.id.clone(),
            database: database.to_string(),
            status,
        };
        for (peer, reply) in self.broadcast(request).await {
            if let Err(e) = reply {
                tracing::debug!(
                    peer = %peer,
                    database,
                    error = %e,
                    "status broadcast not delivered"
                );
            }
        }
    }

    /// Announce a configuration document to every online peer.
    pub async fn publish_config(&self, config: &DistributedConfig, created: bool) {
        let request = Request::ConfigChanged {
            config: config.clone(),
            created,
        };
        for (peer, reply) in self.broadcast(request).await {
            if let Err(e) = reply {
                tracing::warn!(
                    peer = %peer,
                    database = %config.database,
                    version = config.version,
                    error = %e,
                    "configuration broadcast not delivered"
                );
            }
        }
    }

    /// Apply a configuration document received from a peer. Returns `true`
    /// when it was newer than the known one.
    pub async fn apply_config(
        self: &Arc<Self>,
        config: DistributedConfig,
        created: bool,
    ) -> Result<bool, BfrError> {
        let database = config.database.clone();
        if !self.configs.observe(config.clone()) {
            return Ok(false);
        }
        if config.dropped {
            self.store.drop_database(&database).await?;
            self.status.remove_database(&database);
            tracing::info!(
                database = %database,
                version = config.version,
                "database dropped"
            );
            return Ok(true);
        }
        if !config.hosts(self.local_id()) {
            return Ok(true);
        }
        if created {
            self.publish_created(&database).await?;
            tracing::info!(
                database = %database,
                version = config.version,
                "database created"
            );
        } else if !self.store.has_database(&database).await? {
            self.schedule_resync(database);
        }
        Ok(true)
    }

    /// Run a full resync of `database` in the background.
    pub fn schedule_resync(self: &Arc<Self>, database: DatabaseName) {
        let ctx = self.clone();
        tokio::spawn(async move {
            let local = ctx.info.id.clone();
            let resync = ctx.resync.resync(&ctx, &local, &database, SyncMode::Full);
            if let Err(e) = resync.await {
                tracing::warn!(database = %database, error = %e, "automatic resync failed");
            }
        });
    }

    /// After `peer` comes back from a partition, merge its copy of every
    /// database both nodes serve.
    pub fn schedule_reconcile(self: &Arc<Self>, peer: NodeId) {
        let ctx = self.clone();
        tokio::spawn(async move {
            for config in ctx.configs.live() {
                if !config.hosts(ctx.local_id()) || !config.hosts(&peer) {
                    continue;
                }
                if let Err(e) = ctx.resync.reconcile(&ctx, &peer, &config.database).await {
                    tracing::debug!(
                        peer = %peer,
                        database = %config.database,
                        error = %e,
                        "reconcile skipped"
                    );
                }
            }
        });
    }

    /// Coordinate a write: fan it out to the online replicas of the record's
    /// cluster under the database's write quorum.
    pub async fn write(&self, database: &str, op: Operation) -> Result<OpResponse, BfrError> {
        let cluster = op.record().cluster.clone();
        self.config(database)?;
        self.quorum
            .propose_with_retry(database, op, || {
                let config = self.config(database)?;
                Ok((self.write_targets(&config, &cluster), config.write_quorum))
            })
            .await
    }

    /// Read through the database's read quorum. Tombstones are returned;
    /// callers decide how to present them.
    pub async fn read(
        &self,
        database: &str,
        record: &RecordId,
    ) -> Result<Option<Record>, BfrError> {
        let config = self.config(database)?;
        let targets = self.replicas(&config, &record.cluster);
        self.quorum
            .read(database, record, targets, config.read_quorum)
            .await
    }

    /// Count live records of a class, locally when possible, otherwise on the
    /// first online server.
    pub async fn count_class(&self, database: &str, class: &str) -> Result<u64, BfrError> {
        self.config(database)?;
        if self.require_online(database).is_ok() {
            return self.store.count_class(database, class).await;
        }
        let mut last = BfrError::DatabaseNotOnline {
            database: database.to_string(),
            node: None,
        };
        for node in self.status.online_nodes(database) {
            if !self.membership.is_online(&node) {
                continue;
            }
            let request = Request::Count {
                database: database.to_string(),
                class: class.to_string(),
            };
            match self.send(&node, request).await {
                Ok(Response::Count(n)) => return Ok(n),
                Ok(other) => {
                    last = BfrError::Storage(format!("unexpected reply to count: {other:?}"))
                }
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}
