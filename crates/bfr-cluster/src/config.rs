use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bfr_types::{BfrError, ClusterName, DatabaseName, NodeId, Quorum, ALL_CLUSTERS};

use crate::placement::{RoutingMode, StrategyKind};

/// Node-wide coordination settings, loaded from the `[cluster]` section of
/// the node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Bound on a quorum wait and on each request sent to a peer.
    pub request_timeout_ms: u64,
    /// Re-proposals after a transient conflict. Zero disables auto-retry.
    pub max_auto_retry: u32,
    /// Upper bound of the randomized pause between retries.
    pub retry_backoff_ms: u64,
    pub listener_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_missed_heartbeats: u32,
    pub resync_timeout_ms: u64,
    /// Fallback re-check interval for `wait_until`.
    pub status_poll_interval_ms: u64,
    pub default_read_quorum: Quorum,
    pub default_write_quorum: Quorum,
    pub default_strategy: StrategyKind,
    pub routing: RoutingMode,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        ClusterSettings {
            request_timeout_ms: 5_000,
            max_auto_retry: 3,
            retry_backoff_ms: 50,
            listener_timeout_ms: 2_000,
            heartbeat_interval_ms: 1_000,
            max_missed_heartbeats: 3,
            resync_timeout_ms: 30_000,
            status_poll_interval_ms: 250,
            default_read_quorum: Quorum::Count(1),
            default_write_quorum: Quorum::Majority,
            default_strategy: StrategyKind::RoundRobin,
            routing: RoutingMode::PerRequest,
        }
    }
}

impl ClusterSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn listener_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn resync_timeout(&self) -> Duration {
        Duration::from_millis(self.resync_timeout_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub class: String,
    pub unique: bool,
}

/// Unique indexes defined on `class`.
pub fn unique_indexes<'a>(
    indexes: &'a [IndexDef],
    class: &'a str,
) -> impl Iterator<Item = &'a IndexDef> + 'a {
    indexes.iter().filter(move |i| i.unique && i.class == class)
}

/// Part a server plays for a database.
///
/// Only masters count toward the write quorum. Replicas receive every write
/// but the coordinator does not wait for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    #[default]
    Master,
    Replica,
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerRole::Master => write!(f, "master"),
            ServerRole::Replica => write!(f, "replica"),
        }
    }
}

impl FromStr for ServerRole {
    type Err = BfrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(ServerRole::Master),
            "replica" => Ok(ServerRole::Replica),
            _ => Err(BfrError::Config(format!("unknown server role '{s}'"))),
        }
    }
}

/// Distributed configuration of one database. Every change produces a new
/// document with a higher `version`; nodes keep the highest they have seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedConfig {
    pub database: DatabaseName,
    pub version: u64,
    /// Fresh for every document. Orders documents that share a version.
    pub revision: Uuid,
    pub read_quorum: Quorum,
    pub write_quorum: Quorum,
    pub strategy: StrategyKind,
    /// Joining nodes add themselves to the `*` server list.
    pub auto_deploy: bool,
    /// Cluster -> ordered server list. The first server is the owner.
    pub clusters: BTreeMap<ClusterName, Vec<NodeId>>,
    /// Class -> clusters holding its records.
    pub classes: BTreeMap<String, Vec<ClusterName>>,
    /// Servers absent from this map are masters.
    #[serde(default)]
    pub roles: BTreeMap<NodeId, ServerRole>,
    pub indexes: Vec<IndexDef>,
    /// Tombstone left by `drop database`.
    pub dropped: bool,
}

impl DistributedConfig {
    pub fn new(
        database: impl Into<DatabaseName>,
        servers: Vec<NodeId>,
        settings: &ClusterSettings,
    ) -> Self {
        let mut clusters = BTreeMap::new();
        clusters.insert(ALL_CLUSTERS.to_string(), servers);
        DistributedConfig {
            database: database.into(),
            version: 1,
            revision: Uuid::new_v4(),
            read_quorum: settings.default_read_quorum,
            write_quorum: settings.default_write_quorum,
            strategy: settings.default_strategy.clone(),
            auto_deploy: true,
            clusters,
            classes: BTreeMap::new(),
            roles: BTreeMap::new(),
            indexes: Vec::new(),
            dropped: false,
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<ClusterName>, servers: Vec<NodeId>) -> Self {
        self.clusters.insert(cluster.into(), servers);
        self
    }

    pub fn with_class(mut self, class: impl Into<String>, clusters: Vec<ClusterName>) -> Self {
        self.classes.insert(class.into(), clusters);
        self
    }

    pub fn with_role(mut self, node: impl Into<NodeId>, role: ServerRole) -> Self {
        self.set_role(node, role);
        self
    }

    pub fn set_role(&mut self, node: impl Into<NodeId>, role: ServerRole) {
        let node = node.into();
        match role {
            ServerRole::Master => self.roles.remove(&node),
            ServerRole::Replica => self.roles.insert(node, role),
        };
    }

    pub fn role(&self, node: &str) -> ServerRole {
        self.roles.get(node).copied().unwrap_or_default()
    }

    /// `true` when this document replaces `other`: higher version, or the
    /// same version with a higher revision.
    pub fn supersedes(&self, other: &DistributedConfig) -> bool {
        (self.version, self.revision) > (other.version, other.revision)
    }

    /// Servers of a cluster, falling back to the `*` entry.
    pub fn servers(&self, cluster: &str) -> &[NodeId] {
        self.clusters
            .get(cluster)
            .or_else(|| self.clusters.get(ALL_CLUSTERS))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn owner(&self, cluster: &str) -> Option<&NodeId> {
        self.servers(cluster).first()
    }

    pub fn is_server(&self, cluster: &str, node: &str) -> bool {
        self.servers(cluster).iter().any(|s| s == node)
    }

    /// `true` when `node` replicates at least one cluster of this database.
    pub fn hosts(&self, node: &str) -> bool {
        self.clusters
            .values()
            .any(|servers| servers.iter().any(|s| s == node))
    }

    pub fn all_servers(&self) -> Vec<NodeId> {
        let mut all: Vec<NodeId> = self.clusters.values().flatten().cloned().collect();
        all.sort();
        all.dedup();
        all
    }

    /// Clusters of a class. An unconfigured class maps to a single cluster
    /// named after the class.
    pub fn clusters_of_class(&self, class: &str) -> Vec<ClusterName> {
        self.classes
            .get(class)
            .cloned()
            .unwrap_or_else(|| vec![class.to_lowercase()])
    }

    /// Add a node to the `*` server list. Returns `false` if already there.
    pub fn add_server(&mut self, node: &str) -> bool {
        let servers = self.clusters.entry(ALL_CLUSTERS.to_string()).or_default();
        if servers.iter().any(|s| s == node) {
            return false;
        }
        servers.push(node.to_string());
        true
    }

    /// Remove a node from every server list. Returns `false` if absent.
    pub fn remove_server(&mut self, node: &str) -> bool {
        let mut found = false;
        for servers in self.clusters.values_mut() {
            let before = servers.len();
            servers.retain(|s| s != node);
            found |= servers.len() != before;
        }
        self.roles.remove(node);
        found
    }

    /// Copy-on-write update: clone, apply `f`, bump the version.
    pub fn bumped(&self, f: impl FnOnce(&mut DistributedConfig)) -> DistributedConfig {
        let mut next = self.clone();
        f(&mut next);
        next.version = self.version + 1;
        next.revision = Uuid::new_v4();
        next
    }

    pub fn tombstone(&self) -> DistributedConfig {
        self.bumped(|c| c.dropped = true)
    }
}

/// This node's view of every database configuration.
///
/// Documents are immutable `Arc`s replaced wholesale. Convergence is
/// last-writer-wins by `(version, revision)`, so every node settles on the
/// same document whatever order they arrive in.
#[derive(Default)]
pub struct ConfigRegistry {
    docs: RwLock<HashMap<DatabaseName, Arc<DistributedConfig>>>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `config` if it supersedes the known one. Returns `true` when
    /// the registry changed.
    pub fn observe(&self, config: DistributedConfig) -> bool {
        let mut docs = self.docs.write();
        match docs.get(&config.database) {
            Some(current) if !config.supersedes(current) => false,
            _ => {
                tracing::debug!(
                    database = %config.database,
                    version = config.version,
                    dropped = config.dropped,
                    "configuration updated"
                );
                docs.insert(config.database.clone(), Arc::new(config));
                true
            }
        }
    }

    /// Latest known document, tombstones included.
    pub fn get(&self, database: &str) -> Option<Arc<DistributedConfig>> {
        self.docs.read().get(database).cloned()
    }

    /// Latest known document of a database that has not been dropped.
    pub fn get_online(&self, database: &str) -> Option<Arc<DistributedConfig>> {
        self.get(database).filter(|c| !c.dropped)
    }

    pub fn version_of(&self, database: &str) -> u64 {
        self.get(database).map(|c| c.version).unwrap_or(0)
    }

    pub fn all(&self) -> Vec<Arc<DistributedConfig>> {
        let mut all: Vec<_> = self.docs.read().values().cloned().collect();
        all.sort_by(|a, b| a.database.cmp(&b.database));
        all
    }

    /// Owned copies of every document, as sent to peers.
    pub fn documents(&self) -> Vec<DistributedConfig> {
        self.all().iter().map(|c| (**c).clone()).collect()
    }

    pub fn live(&self) -> Vec<Arc<DistributedConfig>> {
        self.all().into_iter().filter(|c| !c.dropped).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn config(servers: &[&str]) -> DistributedConfig {
        DistributedConfig::new("db", nodes(servers), &ClusterSettings::default())
    }

    #[test]
    fn wildcard_and_explicit_clusters() {
        let cfg = config(&["a", "b", "c"]).with_cluster("person_b", nodes(&["b", "c"]));
        assert_eq!(cfg.servers("anything"), nodes(&["a", "b", "c"]).as_slice());
        assert_eq!(cfg.owner("person_b").map(String::as_str), Some("b"));
        assert!(!cfg.is_server("person_b", "a"));
        assert!(cfg.hosts("c"));
        assert_eq!(cfg.all_servers(), nodes(&["a", "b", "c"]));
        assert_eq!(cfg.clusters_of_class("Person"), vec!["person".to_string()]);
    }

    #[test]
    fn add_and_remove_servers() {
        let mut cfg = config(&["a"]).with_role("a", ServerRole::Replica);
        assert!(cfg.add_server("b"));
        assert!(!cfg.add_server("b"));
        assert!(cfg.remove_server("a"));
        assert!(!cfg.remove_server("a"));
        assert_eq!(cfg.servers("x"), nodes(&["b"]).as_slice());
        assert!(cfg.roles.is_empty());
    }

    #[test]
    fn servers_are_masters_unless_marked() {
        let mut cfg = config(&["a", "b"]).with_role("b", ServerRole::Replica);
        assert_eq!(cfg.role("a"), ServerRole::Master);
        assert_eq!(cfg.role("b"), ServerRole::Replica);
        cfg.set_role("b", ServerRole::Master);
        assert!(cfg.roles.is_empty());
        assert_eq!("REPLICA".parse::<ServerRole>().unwrap(), ServerRole::Replica);
        assert!("observer".parse::<ServerRole>().is_err());
    }

    #[test]
    fn unique_indexes_of_a_class() {
        let index = |name: &str, class: &str, unique| IndexDef {
            name: name.into(),
            class: class.into(),
            unique,
        };
        let indexes = vec![
            index("Person.email", "Person", true),
            index("Person.name", "Person", false),
            index("City.zip", "City", true),
        ];
        let names: Vec<&str> = unique_indexes(&indexes, "Person")
            .map(|i| i.name.as_str())
            .collect();
        assert_eq!(names, vec!["Person.email"]);
    }

    #[test]
    fn registry_is_last_writer_wins_by_version() {
        let registry = ConfigRegistry::new();
        let v1 = config(&["a"]);
        let v2 = v1.bumped(|c| c.write_quorum = Quorum::All);
        assert!(registry.observe(v2.clone()));
        assert!(!registry.observe(v1));
        assert!(!registry.observe(v2.clone()));
        assert_eq!(registry.get_online("db").unwrap().write_quorum, Quorum::All);

        assert!(registry.observe(v2.tombstone()));
        assert!(registry.get_online("db").is_none());
        assert_eq!(registry.version_of("db"), 3);
        assert!(registry.live().is_empty());
    }

    #[test]
    fn concurrent_updates_of_one_version_converge() {
        let base = config(&["a", "b"]);
        let all = base.bumped(|c| c.write_quorum = Quorum::All);
        let one = base.bumped(|c| c.write_quorum = Quorum::Count(1));
        assert_eq!(all.version, one.version);

        let left = ConfigRegistry::new();
        left.observe(all.clone());
        left.observe(one.clone());
        let right = ConfigRegistry::new();
        right.observe(one);
        right.observe(all);

        let (left, right) = (left.get("db").unwrap(), right.get("db").unwrap());
        assert_eq!(left.revision, right.revision);
        assert_eq!(left.write_quorum, right.write_quorum);
    }
}
