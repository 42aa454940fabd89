use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use bfr_types::{BfrError, ClusterName, NodeId, ALL_CLUSTERS};

use crate::config::DistributedConfig;

/// Placement strategy named in a database configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StrategyKind {
    RoundRobin,
    /// Prefer a cluster served by the local node.
    Local,
    /// A strategy registered with [`Placement::register`].
    Custom(String),
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::RoundRobin => write!(f, "round-robin"),
            StrategyKind::Local => write!(f, "local"),
            StrategyKind::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = BfrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "round-robin" | "round_robin" | "roundrobin" => Ok(StrategyKind::RoundRobin),
            "local" => Ok(StrategyKind::Local),
            _ => match s.split_once(':') {
                Some((prefix, name))
                    if prefix.eq_ignore_ascii_case("custom") && !name.is_empty() =>
                {
                    Ok(StrategyKind::Custom(name.to_string()))
                }
                _ => Err(BfrError::Config(format!("unknown placement strategy '{s}'"))),
            },
        }
    }
}

impl TryFrom<String> for StrategyKind {
    type Error = BfrError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<StrategyKind> for String {
    fn from(kind: StrategyKind) -> Self {
        kind.to_string()
    }
}

/// When a session picks its target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    /// Choose a target for every operation.
    #[default]
    PerRequest,
    /// Choose once per session; reselect only when the target goes offline.
    PerConnection,
}

/// Where an operation on a new record should go.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub cluster: ClusterName,
    pub node: NodeId,
}

/// Input handed to a strategy.
pub struct PlacementRequest<'a> {
    pub database: &'a str,
    pub class: &'a str,
    pub local: &'a str,
    pub config: &'a DistributedConfig,
}

/// Picks one of the candidate targets. Candidates are never empty.
pub trait PlacementStrategy: Send + Sync + 'static {
    fn choose(&self, request: &PlacementRequest<'_>, candidates: &[Target]) -> Target;
}

/// Deterministic cursor per (database, class).
#[derive(Default)]
pub struct RoundRobin {
    cursors: Mutex<HashMap<(String, String), usize>>,
}

impl PlacementStrategy for RoundRobin {
    fn choose(&self, request: &PlacementRequest<'_>, candidates: &[Target]) -> Target {
        let mut cursors = self.cursors.lock();
        let cursor = cursors
            .entry((request.database.to_string(), request.class.to_string()))
            .or_insert(0);
        let target = candidates[*cursor % candidates.len()].clone();
        *cursor = cursor.wrapping_add(1);
        target
    }
}

/// Prefers a candidate on the local node, round-robin otherwise.
#[derive(Default)]
pub struct LocalAffinity {
    fallback: RoundRobin,
}

impl PlacementStrategy for LocalAffinity {
    fn choose(&self, request: &PlacementRequest<'_>, candidates: &[Target]) -> Target {
        match candidates.iter().find(|t| t.node == request.local) {
            Some(local) => local.clone(),
            None => self.fallback.choose(request, candidates),
        }
    }
}

/// Strategy registry and candidate computation.
#[derive(Default)]
pub struct Placement {
    round_robin: RoundRobin,
    local: LocalAffinity,
    custom: RwLock<HashMap<String, Arc<dyn PlacementStrategy>>>,
}

impl Placement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, strategy: Arc<dyn PlacementStrategy>) {
        self.custom.write().insert(name.into(), strategy);
    }

    /// Targets a record of `class` may be placed on.
    ///
    /// With a single cluster every online server of it is a candidate;
    /// otherwise each cluster contributes its first online server.
    pub fn candidates(
        config: &DistributedConfig,
        class: &str,
        online: impl Fn(&str) -> bool,
    ) -> Vec<Target> {
        let clusters = config.clusters_of_class(class);
        if let [cluster] = clusters.as_slice() {
            return config
                .servers(cluster)
                .iter()
                .filter(|node| online(node.as_str()))
                .map(|node| Target {
                    cluster: cluster.clone(),
                    node: node.clone(),
                })
                .collect();
        }
        clusters
            .iter()
            .filter_map(|cluster| {
                config
                    .servers(cluster)
                    .iter()
                    .find(|node| online(node.as_str()))
                    .map(|node| Target {
                        cluster: cluster.clone(),
                        node: node.clone(),
                    })
            })
            .collect()
    }

    pub fn choose_target(
        &self,
        config: &DistributedConfig,
        class: &str,
        local: &str,
        online: impl Fn(&str) -> bool,
    ) -> Result<Target, BfrError> {
        let candidates = Self::candidates(config, class, online);
        self.pick(config, class, local, &candidates)
    }

    /// Coordinator node for a session: any online server of the database,
    /// chosen with the database's strategy.
    pub fn choose_node(
        &self,
        config: &DistributedConfig,
        local: &str,
        online: impl Fn(&str) -> bool,
    ) -> Result<NodeId, BfrError> {
        let candidates: Vec<Target> = config
            .all_servers()
            .into_iter()
            .filter(|node| online(node.as_str()))
            .map(|node| Target {
                cluster: ALL_CLUSTERS.to_string(),
                node,
            })
            .collect();
        self.pick(config, ALL_CLUSTERS, local, &candidates).map(|t| t.node)
    }

    fn pick(
        &self,
        config: &DistributedConfig,
        class: &str,
        local: &str,
        candidates: &[Target],
    ) -> Result<Target, BfrError> {
        if candidates.is_empty() {
            return Err(BfrError::DatabaseNotOnline {
                database: config.database.clone(),
                node: None,
            });
        }
        let request = PlacementRequest {
            database: &config.database,
            class,
            local,
            config,
        };
        let target = match &config.strategy {
            StrategyKind::RoundRobin => self.round_robin.choose(&request, candidates),
            StrategyKind::Local => self.local.choose(&request, candidates),
            StrategyKind::Custom(name) => {
                let strategy = self
                    .custom
                    .read()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| {
                        BfrError::Config(format!("placement strategy '{name}' is not registered"))
                    })?;
                strategy.choose(&request, candidates)
            }
        };
        tracing::trace!(
            database = %config.database,
            class,
            cluster = %target.cluster,
            node = %target.node,
            "placement"
        );
        Ok(target)
    }
}
