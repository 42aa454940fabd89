use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;

use bfr_storage::{InstallStats, RecordStore};
use bfr_types::{BfrError, DbStatus, NodeId, Quorum};

use crate::config::{DistributedConfig, IndexDef, ServerRole};
use crate::listener::{ClusterEvent, LifecycleListener, ListenerId};
use crate::membership::NodeInfo;
use crate::node::Node;
use crate::placement::{PlacementStrategy, StrategyKind};
use crate::resync::SyncMode;
use crate::status::StatusEntry;
use crate::transport::{Request, Response, Transport};

/// Overrides applied when creating a database. `None` keeps the node-wide
/// default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseOptions {
    pub read_quorum: Option<Quorum>,
    pub write_quorum: Option<Quorum>,
    pub strategy: Option<StrategyKind>,
}

/// Snapshot of what this node knows about the cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub local: NodeId,
    pub members: Vec<NodeInfo>,
    pub statuses: Vec<StatusEntry>,
    pub databases: Vec<DistributedConfig>,
}

impl<S: RecordStore, T: Transport> Node<S, T> {
    /// Create a database served by this node and every online peer.
    ///
    /// Fails with `DuplicateDatabase` when this node, or any online peer,
    /// knows a live configuration with that name that is not superseded by a
    /// drop.
    pub async fn create_database(
        &self,
        name: &str,
        options: DatabaseOptions,
    ) -> Result<Arc<DistributedConfig>, BfrError> {
        if name.is_empty() {
            return Err(BfrError::InvalidArgument(
                "database name must not be empty".into(),
            ));
        }
        let ctx = &self.ctx;
        if ctx.configs.get_online(name).is_some() {
            return Err(BfrError::DuplicateDatabase(name.to_string()));
        }

        let mut version = ctx.configs.version_of(name);
        for (peer, reply) in ctx.broadcast(Request::FetchConfigs).await {
            match reply {
                Ok(Response::Configs(configs)) => {
                    for config in configs.into_iter().filter(|c| c.database == name) {
                        if !config.dropped && config.version > version {
                            ctx.configs.observe(config);
                            return Err(BfrError::DuplicateDatabase(name.to_string()));
                        }
                        version = version.max(config.version);
                    }
                }
                Ok(other) => tracing::debug!(
                    peer = %peer,
                    reply = ?other,
                    "unexpected reply to configuration fetch"
                ),
                Err(e) => tracing::debug!(peer = %peer, error = %e, "configuration fetch failed"),
            }
        }

        let mut servers = vec![ctx.info.id.clone()];
        servers.extend(ctx.membership.online_peers());
        let mut config = DistributedConfig::new(name, servers, &ctx.settings);
        config.version = version + 1;
        if let Some(q) = options.read_quorum {
            config.read_quorum = q;
        }
        if let Some(q) = options.write_quorum {
            config.write_quorum = q;
        }
        if let Some(s) = options.strategy {
            config.strategy = s;
        }

        ctx.configs.observe(config.clone());
        ctx.publish_created(name).await?;
        ctx.publish_config(&config, true).await;
        tracing::info!(
            database = name,
            version = config.version,
            servers = config.all_servers().len(),
            read_quorum = %config.read_quorum,
            write_quorum = %config.write_quorum,
            "database created"
        );
        Ok(Arc::new(config))
    }

    /// Drop a database cluster-wide by publishing a tombstone configuration.
    pub async fn drop_database(&self, name: &str) -> Result<(), BfrError> {
        let ctx = &self.ctx;
        let tombstone = ctx.config(name)?.tombstone();
        ctx.configs.observe(tombstone.clone());
        ctx.store.drop_database(name).await?;
        ctx.status.remove_database(name);
        ctx.publish_config(&tombstone, false).await;
        tracing::info!(database = name, version = tombstone.version, "database dropped");
        Ok(())
    }

    /// Copy-on-write change of a database configuration, broadcast to peers.
    pub async fn update_configuration(
        &self,
        name: &str,
        change: impl FnOnce(&mut DistributedConfig),
    ) -> Result<Arc<DistributedConfig>, BfrError> {
        let next = self.ctx.config(name)?.bumped(change);
        self.ctx.configs.observe(next.clone());
        self.ctx.publish_config(&next, false).await;
        tracing::info!(database = name, version = next.version, "configuration updated");
        Ok(Arc::new(next))
    }

    /// Pull every configuration known to online peers. Returns how many
    /// documents were newer than the local ones.
    pub async fn sync_configuration(&self) -> Result<usize, BfrError> {
        let mut updated = 0;
        for (peer, reply) in self.ctx.broadcast(Request::FetchConfigs).await {
            match reply {
                Ok(Response::Configs(configs)) => {
                    for config in configs {
                        if self.ctx.apply_config(config, false).await? {
                            updated += 1;
                        }
                    }
                }
                Ok(other) => tracing::debug!(
                    peer = %peer,
                    reply = ?other,
                    "unexpected reply to configuration fetch"
                ),
                Err(e) => tracing::warn!(peer = %peer, error = %e, "configuration fetch failed"),
            }
        }
        Ok(updated)
    }

    /// Mark `node` as a MASTER or REPLICA of `database`. Only masters count
    /// toward the write quorum; replicas still receive every write.
    pub async fn set_server_role(
        &self,
        database: &str,
        node: &str,
        role: ServerRole,
    ) -> Result<Arc<DistributedConfig>, BfrError> {
        let config = self.ctx.config(database)?;
        if !config.hosts(node) {
            return Err(BfrError::InvalidArgument(format!(
                "node '{node}' is not a server of database '{database}'"
            )));
        }
        if config.role(node) == role {
            return Ok(config);
        }
        tracing::info!(database, node, %role, "changing server role");
        self.update_configuration(database, |c| c.set_role(node, role))
            .await
    }

    /// Add an index definition. A unique index is refused while duplicate
    /// values exist locally.
    pub async fn create_index(
        &self,
        database: &str,
        index: IndexDef,
    ) -> Result<Arc<DistributedConfig>, BfrError> {
        let config = self.ctx.config(database)?;
        if config.indexes.iter().any(|i| i.name == index.name) {
            return Err(BfrError::InvalidArgument(format!(
                "index '{}' already exists",
                index.name
            )));
        }
        if index.unique {
            self.ctx.require_online(database)?;
            if let Some(record) = self.ctx.store.find_duplicate(database, &index.class).await? {
                return Err(BfrError::DuplicateKey { index: index.name, record });
            }
        }
        self.update_configuration(database, |c| c.indexes.push(index)).await
    }

    pub async fn sync_database(&self, database: &str) -> Result<InstallStats, BfrError> {
        self.resync(self.id(), database, SyncMode::Full).await
    }

    pub async fn sync_cluster(
        &self,
        database: &str,
        cluster: &str,
    ) -> Result<InstallStats, BfrError> {
        let mode = SyncMode::Partial(cluster.to_string());
        self.resync(self.id(), database, mode).await
    }

    /// Resynchronize `database` on `node`; another node is asked to do it
    /// itself.
    pub async fn resync(
        &self,
        node: &str,
        database: &str,
        mode: SyncMode,
    ) -> Result<InstallStats, BfrError> {
        self.ctx.resync.resync(&self.ctx, node, database, mode).await
    }

    pub async fn begin_backup(&self, database: &str) -> Result<(), BfrError> {
        self.ctx.publish_status(database, DbStatus::Backup).await.map(|_| ())
    }

    pub async fn end_backup(&self, database: &str) -> Result<(), BfrError> {
        self.ctx.publish_status(database, DbStatus::Online).await.map(|_| ())
    }

    pub fn get_online_database_configuration(
        &self,
        database: &str,
    ) -> Option<Arc<DistributedConfig>> {
        self.ctx.configs.get_online(database)
    }

    pub fn get_database_status(&self, node: &str, database: &str) -> Option<DbStatus> {
        self.ctx.status.get_status(node, database)
    }

    pub async fn wait_until(
        &self,
        node: &str,
        database: &str,
        status: DbStatus,
        timeout: Duration,
    ) -> bool {
        self.ctx.status.wait_until(node, database, status, timeout).await
    }

    pub fn register_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) -> ListenerId {
        self.ctx.membership.register_lifecycle_listener(listener)
    }

    pub fn unregister_lifecycle_listener(&self, id: ListenerId) -> bool {
        self.ctx.membership.unregister_lifecycle_listener(id)
    }

    pub fn register_placement_strategy(&self, name: &str, strategy: Arc<dyn PlacementStrategy>) {
        self.ctx.placement.register(name, strategy);
    }

    /// Lifecycle notifications as a stream. Slow consumers see lagged errors
    /// rather than blocking dispatch.
    pub fn events(&self) -> BroadcastStream<ClusterEvent> {
        BroadcastStream::new(self.ctx.listeners.subscribe())
    }

    pub fn members(&self) -> Vec<NodeInfo> {
        self.ctx.membership.nodes()
    }

    pub fn cluster_status(&self) -> ClusterStatus {
        ClusterStatus {
            local: self.ctx.info.id.clone(),
            members: self.ctx.membership.nodes(),
            statuses: self.ctx.status.entries(),
            databases: self.ctx.configs.live().iter().map(|c| (**c).clone()).collect(),
        }
    }
}
