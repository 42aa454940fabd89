use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use bfr_storage::{InstallStats, RecordStore};
use bfr_types::{BfrError, ClusterName, DbStatus, NodeId, RecordId};

use crate::config::DistributedConfig;
use crate::context::NodeContext;
use crate::transport::{Request, Response, Transport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Whole database; the node goes through SYNCHRONIZING.
    Full,
    /// One cluster; the node stays ONLINE.
    Partial(ClusterName),
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => write!(f, "full"),
            SyncMode::Partial(cluster) => write!(f, "partial({cluster})"),
        }
    }
}

/// Brings a node's copy of a database back in line with its ONLINE peers.
///
/// Runs for the same (node, database) are serialized; a run that cannot
/// start within the resync timeout fails with `ResyncInProgress`.
pub struct Resynchronizer {
    running: parking_lot::Mutex<HashMap<(NodeId, String), Arc<Mutex<()>>>>,
    timeout: Duration,
}

impl Resynchronizer {
    pub fn new(timeout: Duration) -> Self {
        Resynchronizer {
            running: parking_lot::Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn slot(&self, node: &str, database: &str) -> Arc<Mutex<()>> {
        self.running
            .lock()
            .entry((node.to_string(), database.to_string()))
            .or_default()
            .clone()
    }

    async fn acquire(
        &self,
        node: &str,
        database: &str,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, BfrError> {
        let slot = self.slot(node, database);
        tokio::time::timeout(self.timeout, slot.lock_owned())
            .await
            .map_err(|_| BfrError::ResyncInProgress {
                node: node.to_string(),
                database: database.to_string(),
            })
    }

    /// Resynchronize `database` on `node`. A remote node is asked to run the
    /// resync itself.
    pub async fn resync<S: RecordStore, T: Transport>(
        &self,
        ctx: &NodeContext<S, T>,
        node: &str,
        database: &str,
        mode: SyncMode,
    ) -> Result<InstallStats, BfrError> {
        if node != ctx.local_id() {
            tracing::info!(node, database, %mode, "forwarding resync");
            let request = Request::Resync {
                database: database.to_string(),
                mode,
            };
            return match ctx.send(node, request).await? {
                Response::Synced(stats) => Ok(stats),
                other => Err(BfrError::Storage(format!(
                    "unexpected reply to resync: {other:?}"
                ))),
            };
        }

        let _running = self.acquire(node, database).await?;
        let config = ctx.config(database)?;
        let stats = match &mode {
            SyncMode::Full => self.full(ctx, &config).await?,
            SyncMode::Partial(cluster) => self.partial(ctx, &config, cluster).await?,
        };
        tracing::info!(
            database,
            %mode,
            applied = stats.applied,
            skipped = stats.skipped,
            "resync finished"
        );
        Ok(stats)
    }

    /// Merge `peer`'s copy of `database` into the local one without leaving
    /// ONLINE. Used when a peer reconnects after a partition.
    pub async fn reconcile<S: RecordStore, T: Transport>(
        &self,
        ctx: &NodeContext<S, T>,
        peer: &str,
        database: &str,
    ) -> Result<InstallStats, BfrError> {
        let local = ctx.local_id();
        let _running = self.acquire(local, database).await?;
        ctx.require_online(database)?;
        let config = ctx.config(database)?;
        let accept = |id: &RecordId| config.is_server(&id.cluster, local);
        let stats = pull(ctx, peer, database, None, &accept).await?;
        tracing::info!(
            database,
            peer,
            applied = stats.applied,
            "reconciled with reconnected peer"
        );
        Ok(stats)
    }

    async fn full<S: RecordStore, T: Transport>(
        &self,
        ctx: &NodeContext<S, T>,
        config: &DistributedConfig,
    ) -> Result<InstallStats, BfrError> {
        let database = config.database.as_str();
        let local = ctx.local_id().to_string();

        if ctx.status.get_status(&local, database) != Some(DbStatus::Offline) {
            ctx.publish_status(database, DbStatus::Offline).await?;
        }
        ctx.publish_status(database, DbStatus::Synchronizing).await?;

        let accept = |id: &RecordId| config.is_server(&id.cluster, &local);
        let (mut stats, source) = match self.transfer(ctx, config, &accept).await {
            Ok(transferred) => transferred,
            Err(e) => {
                ctx.publish_status(database, DbStatus::Offline).await?;
                return Err(e);
            }
        };
        ctx.publish_status(database, DbStatus::Online).await?;

        // Writes that raced the transfer skipped this node while it was
        // SYNCHRONIZING.
        if let Some(peer) = source {
            match pull(ctx, &peer, database, None, &accept).await {
                Ok(catch_up) => {
                    stats.applied += catch_up.applied;
                    stats.skipped += catch_up.skipped;
                }
                Err(e) => tracing::warn!(
                    database,
                    peer = %peer,
                    error = %e,
                    "catch-up transfer failed"
                ),
            }
        }
        Ok(stats)
    }

    /// Snapshot transfer of a FULL resync. Returns the peer that served it,
    /// or `None` when no peer is online and the local copy is promoted.
    async fn transfer<S: RecordStore, T: Transport>(
        &self,
        ctx: &NodeContext<S, T>,
        config: &DistributedConfig,
        accept: &(dyn Fn(&RecordId) -> bool + Send + Sync),
    ) -> Result<(InstallStats, Option<NodeId>), BfrError> {
        let database = config.database.as_str();
        let local = ctx.local_id();
        ctx.store.create_database(database).await?;

        let peers: Vec<NodeId> = ctx
            .status
            .online_nodes(database)
            .into_iter()
            .filter(|n| n != local && ctx.membership.is_online(n) && config.hosts(n))
            .collect();
        if peers.is_empty() {
            tracing::info!(database, "no online peer, promoting local copy");
            return Ok((InstallStats::default(), None));
        }

        let mut last = BfrError::DatabaseNotOnline {
            database: database.to_string(),
            node: None,
        };
        for peer in peers {
            match pull(ctx, &peer, database, None, accept).await {
                Ok(stats) => return Ok((stats, Some(peer))),
                Err(e) => {
                    tracing::warn!(database, peer = %peer, error = %e, "snapshot transfer failed");
                    last = e;
                }
            }
        }
        Err(last)
    }

    async fn partial<S: RecordStore, T: Transport>(
        &self,
        ctx: &NodeContext<S, T>,
        config: &DistributedConfig,
        cluster: &str,
    ) -> Result<InstallStats, BfrError> {
        let database = config.database.as_str();
        let local = ctx.local_id();
        if !config.is_server(cluster, local) {
            return Err(BfrError::InvalidArgument(format!(
                "node '{local}' does not serve cluster '{cluster}'"
            )));
        }
        let peer = config
            .servers(cluster)
            .iter()
            .find(|n| n.as_str() != local && ctx.serves(n.as_str(), database))
            .cloned()
            .ok_or_else(|| BfrError::DatabaseNotOnline {
                database: database.to_string(),
                node: None,
            })?;
        let accept = |id: &RecordId| id.cluster == cluster;
        pull(ctx, &peer, database, Some(cluster), &accept).await
    }
}

async fn pull<S: RecordStore, T: Transport>(
    ctx: &NodeContext<S, T>,
    peer: &str,
    database: &str,
    cluster: Option<&str>,
    accept: &(dyn Fn(&RecordId) -> bool + Send + Sync),
) -> Result<InstallStats, BfrError> {
    let request = Request::Snapshot {
        database: database.to_string(),
        cluster: cluster.map(str::to_string),
    };
    let snapshot = match ctx.send(peer, request).await? {
        Response::Snapshot(s) => s,
        other => {
            return Err(BfrError::Storage(format!(
                "unexpected reply to snapshot: {other:?}"
            )))
        }
    };
    tracing::debug!(
        database,
        peer,
        snapshot = %snapshot.meta.snapshot_id,
        records = snapshot.meta.record_count,
        "installing snapshot"
    );
    ctx.store.install_snapshot(database, snapshot, accept).await
}
