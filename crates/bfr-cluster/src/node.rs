use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use bfr_storage::RecordStore;
use bfr_types::{BfrError, DbStatus, NodeId, NodeState};

use crate::config::{ClusterSettings, DistributedConfig};
use crate::context::NodeContext;
use crate::membership::{LeaveReason, NodeInfo};
use crate::transport::{Envelope, Request, Response, Transport};

/// A running cluster member.
///
/// Cheap to clone; every clone drives the same node. The request loop and the
/// heartbeat monitor stop on [`shutdown`](Node::shutdown), on
/// [`halt`](Node::halt), or when the last clone is dropped.
pub struct Node<S, T> {
    pub(crate) ctx: Arc<NodeContext<S, T>>,
    stop: Arc<watch::Sender<bool>>,
}

impl<S, T> Clone for Node<S, T> {
    fn clone(&self) -> Self {
        Node {
            ctx: self.ctx.clone(),
            stop: self.stop.clone(),
        }
    }
}

impl<S: RecordStore, T: Transport> Node<S, T> {
    /// Start serving `inbox`, handshake with `seeds` and every member they
    /// report, then schedule a resync of each database this node serves.
    ///
    /// Unreachable seeds are skipped. A seed whose listeners refuse the join
    /// fails the start with `JoinRefused`.
    pub async fn start(
        info: NodeInfo,
        settings: ClusterSettings,
        store: Arc<S>,
        transport: Arc<T>,
        inbox: mpsc::Receiver<Envelope>,
        seeds: &[NodeId],
    ) -> Result<Self, BfrError> {
        let ctx = Arc::new(NodeContext::new(info, settings, store, transport));
        let (stop, _) = watch::channel(false);
        let node = Node {
            ctx,
            stop: Arc::new(stop),
        };
        let local = node.ctx.info.id.clone();
        tracing::info!(
            node = %local,
            address = %node.ctx.info.address,
            seeds = seeds.len(),
            "node starting"
        );

        tokio::spawn(serve(node.ctx.clone(), inbox, node.stop.subscribe()));

        let mut queue: VecDeque<NodeId> = seeds.iter().cloned().collect();
        let mut seen: HashSet<NodeId> = HashSet::from([local.clone()]);
        while let Some(peer) = queue.pop_front() {
            if !seen.insert(peer.clone()) {
                continue;
            }
            match handshake(&node.ctx, &peer, true).await {
                Ok(members) => queue.extend(
                    members
                        .into_iter()
                        .filter(|m| m.state == NodeState::Online)
                        .map(|m| m.id),
                ),
                Err(e @ BfrError::JoinRefused(_)) => {
                    node.halt();
                    return Err(e);
                }
                Err(e) => tracing::warn!(
                    node = %local,
                    peer = %peer,
                    error = %e,
                    "peer unreachable during start"
                ),
            }
        }

        for config in node.ctx.configs.all() {
            if config.dropped {
                if node.ctx.store.drop_database(&config.database).await? {
                    tracing::info!(
                        database = %config.database,
                        "removed local copy of dropped database"
                    );
                }
                continue;
            }
            let config = if config.auto_deploy && !config.hosts(&local) {
                Arc::new(node.deploy(&config).await)
            } else {
                config
            };
            if config.hosts(&local) {
                node.ctx.schedule_resync(config.database.clone());
            }
        }

        tokio::spawn(heartbeat(node.ctx.clone(), node.stop.subscribe()));
        tracing::info!(
            node = %local,
            members = node.ctx.membership.online_nodes().len(),
            "node started"
        );
        Ok(node)
    }

    /// Add this node to the servers of an auto-deploy database.
    async fn deploy(&self, config: &DistributedConfig) -> DistributedConfig {
        let local = self.ctx.local_id();
        let next = config.bumped(|c| {
            c.add_server(local);
        });
        self.ctx.configs.observe(next.clone());
        self.ctx.publish_config(&next, false).await;
        tracing::info!(
            database = %next.database,
            version = next.version,
            "joined database servers"
        );
        next
    }

    pub fn id(&self) -> &str {
        self.ctx.local_id()
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.ctx.settings
    }

    pub fn is_running(&self) -> bool {
        !*self.stop.borrow()
    }

    /// Leave the cluster: peers record this node as LEFT and its databases
    /// as OFFLINE.
    pub async fn shutdown(&self) {
        let goodbye = Request::Goodbye {
            node: self.ctx.info.id.clone(),
        };
        for (peer, reply) in self.ctx.broadcast(goodbye).await {
            if let Err(e) = reply {
                tracing::debug!(peer = %peer, error = %e, "goodbye not delivered");
            }
        }
        self.halt();
        tracing::info!(node = %self.ctx.info.id, "node stopped");
    }

    /// Stop serving without telling anybody, as a crashed process would.
    pub fn halt(&self) {
        self.stop.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// Join handshake
// ---------------------------------------------------------------------------

/// Introduce this node to `peer` and merge what it knows. Returns the members
/// the peer reported.
///
/// At start configurations are only recorded; the caller reconciles local
/// storage once every seed has answered. On a reconnect they are applied as
/// they arrive.
async fn handshake<S: RecordStore, T: Transport>(
    ctx: &Arc<NodeContext<S, T>>,
    peer: &str,
    at_start: bool,
) -> Result<Vec<NodeInfo>, BfrError> {
    let hello = Request::Hello {
        node: ctx.info.clone(),
        configs: ctx.configs.documents(),
    };
    let (members, statuses, configs) = match ctx.send(peer, hello).await? {
        Response::Welcome {
            members,
            statuses,
            configs,
        } => (members, statuses, configs),
        other => {
            return Err(BfrError::Storage(format!(
                "unexpected reply to hello: {other:?}"
            )))
        }
    };

    let info = members
        .iter()
        .find(|m| m.id == peer)
        .cloned()
        .unwrap_or_else(|| NodeInfo::new(peer, ""));
    match ctx.membership.join(info, async { Ok(()) }).await {
        Ok(()) | Err(BfrError::NodeAlreadyOnline(_)) => {}
        Err(e) => return Err(e),
    }

    for config in configs {
        if at_start {
            ctx.configs.observe(config);
        } else {
            ctx.apply_config(config, false).await?;
        }
    }
    // The peer is authoritative for its own statuses only.
    for entry in statuses.into_iter().filter(|e| e.node == peer) {
        ctx.status
            .observe(&entry.node, &entry.database, entry.status)
            .await;
    }
    let own = ctx
        .status
        .entries()
        .into_iter()
        .filter(|e| e.node == ctx.info.id);
    for entry in own {
        let request = Request::StatusChanged {
            node: entry.node,
            database: entry.database,
            status: entry.status,
        };
        if let Err(e) = ctx.send(peer, request).await {
            tracing::debug!(peer, error = %e, "status not delivered during handshake");
        }
    }
    Ok(members)
}

// ---------------------------------------------------------------------------
// Request loop
// ---------------------------------------------------------------------------

async fn serve<S: RecordStore, T: Transport>(
    ctx: Arc<NodeContext<S, T>>,
    mut inbox: mpsc::Receiver<Envelope>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            envelope = inbox.recv() => {
                let Some(Envelope { from, request, reply }) = envelope else { break };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let response = match handle(&ctx, &from, request).await {
                        Ok(response) => response,
                        Err(e) => Response::Error(e),
                    };
                    // The sender may have given up waiting.
                    let _ = reply.send(response);
                });
            }
        }
    }
    tracing::debug!(node = %ctx.info.id, "request loop stopped");
}

async fn handle<S: RecordStore, T: Transport>(
    ctx: &Arc<NodeContext<S, T>>,
    from: &str,
    request: Request,
) -> Result<Response, BfrError> {
    match request {
        Request::Hello { node, configs } => {
            let id = node.id.clone();
            let known = ctx.membership.get(&id);
            let mut reconnected = false;
            match known.map(|k| (k.state, k.incarnation == node.incarnation)) {
                // Both sides reconnected at once.
                Some((NodeState::Online, true)) => {}
                Some((NodeState::Online, false)) => {
                    // Restarted before we noticed it was gone.
                    ctx.membership.leave(&id, LeaveReason::Failure).await;
                    ctx.status.mark_node_offline(&id).await;
                    ctx.membership.join(node, async { Ok(()) }).await?;
                }
                Some((NodeState::Offline, same)) => {
                    ctx.membership.join(node, async { Ok(()) }).await?;
                    reconnected = same;
                }
                _ => ctx.membership.join(node, async { Ok(()) }).await?,
            }
            for config in configs {
                ctx.apply_config(config, false).await?;
            }
            if reconnected {
                ctx.schedule_reconcile(id);
            }
            Ok(Response::Welcome {
                members: ctx.membership.nodes(),
                statuses: ctx.status.entries(),
                configs: ctx.configs.documents(),
            })
        }
        Request::Goodbye { node } => {
            if ctx.membership.leave(&node, LeaveReason::Graceful).await {
                ctx.status.mark_node_offline(&node).await;
            }
            Ok(Response::Done)
        }
        Request::Ping => Ok(Response::Pong),
        Request::Coordinate { database, op } => {
            tracing::debug!(
                from,
                database = %database,
                op = %op.id,
                "coordinating forwarded write"
            );
            ctx.write(&database, op).await.map(Response::Ack)
        }
        Request::Replicate { database, op } => {
            ctx.require_online(&database)?;
            let config = ctx.config(&database)?;
            ctx.conflicts
                .check_and_bump(&database, &op, &config.indexes)
                .await
                .map(Response::Ack)
        }
        Request::Read { database, record } => {
            ctx.require_online(&database)?;
            ctx.store
                .get(&database, &record)
                .await
                .map(Response::Record)
        }
        Request::Count { database, class } => {
            ctx.require_online(&database)?;
            ctx.store
                .count_class(&database, &class)
                .await
                .map(Response::Count)
        }
        Request::Snapshot { database, cluster } => {
            match ctx.status.get_status(ctx.local_id(), &database) {
                Some(DbStatus::Online | DbStatus::Backup) => {}
                _ => {
                    return Err(BfrError::DatabaseNotOnline {
                        database,
                        node: Some(ctx.info.id.clone()),
                    });
                }
            }
            ctx.store
                .build_snapshot(&database, cluster.as_deref())
                .await
                .map(Response::Snapshot)
        }
        Request::StatusChanged {
            node,
            database,
            status,
        } => {
            if node != ctx.info.id {
                ctx.status.observe(&node, &database, status).await;
            }
            Ok(Response::Done)
        }
        Request::ConfigChanged { config, created } => {
            ctx.apply_config(config, created).await?;
            Ok(Response::Done)
        }
        Request::FetchConfigs => Ok(Response::Configs(ctx.configs.documents())),
        Request::Resync { database, mode } => {
            let local = ctx.info.id.clone();
            ctx.resync
                .resync(ctx, &local, &database, mode)
                .await
                .map(Response::Synced)
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat monitor
// ---------------------------------------------------------------------------

async fn heartbeat<S: RecordStore, T: Transport>(
    ctx: Arc<NodeContext<S, T>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut missed: HashMap<NodeId, u32> = HashMap::new();
    let mut ticker = tokio::time::interval(ctx.settings.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }

        for peer in ctx.membership.online_peers() {
            match ctx.send(&peer, Request::Ping).await {
                Ok(_) => {
                    missed.remove(&peer);
                }
                Err(e) => {
                    let count = missed.entry(peer.clone()).or_insert(0);
                    *count += 1;
                    tracing::debug!(peer = %peer, missed = *count, error = %e, "heartbeat missed");
                    if *count >= ctx.settings.max_missed_heartbeats {
                        missed.remove(&peer);
                        evict(&ctx, &peer).await;
                    }
                }
            }
        }

        // Evicted peers come back once the partition heals.
        let offline = ctx
            .membership
            .nodes()
            .into_iter()
            .filter(|n| n.state == NodeState::Offline);
        for node in offline {
            if ctx.membership.state(&node.id) != Some(NodeState::Offline) {
                continue;
            }
            if handshake(&ctx, &node.id, false).await.is_ok() {
                tracing::info!(peer = %node.id, "peer reconnected");
                ctx.schedule_reconcile(node.id);
            }
        }
    }
}

async fn evict<S: RecordStore, T: Transport>(ctx: &NodeContext<S, T>, peer: &str) {
    if ctx.membership.leave(peer, LeaveReason::Failure).await {
        let databases = ctx.status.mark_node_offline(peer).await;
        tracing::warn!(
            peer,
            databases = databases.len(),
            "peer evicted after missed heartbeats"
        );
    }
}
