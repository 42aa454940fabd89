use std::fmt;

use serde::{Deserialize, Serialize};

pub type NodeId = String;
pub type DatabaseName = String;
pub type ClusterName = String;
pub type OpId = uuid::Uuid;

/// Wildcard cluster entry in a distributed configuration.
pub const ALL_CLUSTERS: &str = "*";

/// Identity of a record: the cluster (partition) it lives in plus its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub cluster: ClusterName,
    pub key: String,
}

impl RecordId {
    pub fn new(cluster: impl Into<ClusterName>, key: impl Into<String>) -> Self {
        RecordId {
            cluster: cluster.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.key)
    }
}

/// A committed version of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordVersion {
    pub record: RecordId,
    pub version: u64,
}

/// Stored per record. Deleted records stay behind as tombstones so that the
/// version keeps increasing and deletions travel with snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub class: String,
    pub value: Vec<u8>,
    pub version: u64,
    pub deleted: bool,
    /// Operation that produced this version.
    pub last_op: Option<OpId>,
}

impl Record {
    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Joining,
    Online,
    Offline,
    Left,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Joining => write!(f, "JOINING"),
            NodeState::Online => write!(f, "ONLINE"),
            NodeState::Offline => write!(f, "OFFLINE"),
            NodeState::Left => write!(f, "LEFT"),
        }
    }
}

/// Status of one database on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DbStatus {
    Offline,
    Synchronizing,
    Backup,
    Online,
}

impl DbStatus {
    /// Legal moves: OFFLINE -> SYNCHRONIZING -> ONLINE, ONLINE <-> BACKUP,
    /// anything -> OFFLINE.
    pub fn can_transition_to(self, next: DbStatus) -> bool {
        use DbStatus::*;
        matches!(
            (self, next),
            (_, Offline)
                | (Offline, Synchronizing)
                | (Synchronizing, Online)
                | (Online, Backup)
                | (Backup, Online)
        )
    }
}

impl fmt::Display for DbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbStatus::Offline => write!(f, "OFFLINE"),
            DbStatus::Synchronizing => write!(f, "SYNCHRONIZING"),
            DbStatus::Backup => write!(f, "BACKUP"),
            DbStatus::Online => write!(f, "ONLINE"),
        }
    }
}

/// Write operation replicated to every replica of the record's cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub kind: OpKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert {
        record: RecordId,
        class: String,
        value: Vec<u8>,
    },
    Update {
        record: RecordId,
        value: Vec<u8>,
        expected_version: u64,
    },
    Delete { record: RecordId, expected_version: u64 },
}

impl Operation {
    pub fn new(kind: OpKind) -> Self {
        Operation { id: uuid::Uuid::new_v4(), kind }
    }

    pub fn insert(record: RecordId, class: impl Into<String>, value: Vec<u8>) -> Self {
        Self::new(OpKind::Insert {
            record,
            class: class.into(),
            value,
        })
    }

    pub fn update(record: RecordId, value: Vec<u8>, expected_version: u64) -> Self {
        Self::new(OpKind::Update {
            record,
            value,
            expected_version,
        })
    }

    pub fn delete(record: RecordId, expected_version: u64) -> Self {
        Self::new(OpKind::Delete { record, expected_version })
    }

    pub fn record(&self) -> &RecordId {
        match &self.kind {
            OpKind::Insert { record, .. }
            | OpKind::Update { record, .. }
            | OpKind::Delete { record, .. } => record,
        }
    }

    /// Inserts expect the record to be absent, i.e. version 0.
    pub fn expected_version(&self) -> u64 {
        match &self.kind {
            OpKind::Insert { .. } => 0,
            OpKind::Update { expected_version, .. } | OpKind::Delete { expected_version, .. } => {
                *expected_version
            }
        }
    }
}

/// Replica acknowledgment of an applied operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpResponse {
    Written(RecordVersion),
    Deleted(RecordVersion),
}

impl OpResponse {
    pub fn version(&self) -> &RecordVersion {
        match self {
            OpResponse::Written(v) | OpResponse::Deleted(v) => v,
        }
    }
}

/// Read or write quorum setting: a fixed count, or resolved against the
/// number of reachable replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QuorumRepr", into = "QuorumRepr")]
pub enum Quorum {
    Count(usize),
    Majority,
    All,
}

impl Quorum {
    pub fn resolve(self, replicas: usize) -> usize {
        match self {
            Quorum::Count(n) => n,
            Quorum::Majority => replicas / 2 + 1,
            Quorum::All => replicas,
        }
    }
}

impl fmt::Display for Quorum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quorum::Count(n) => write!(f, "{n}"),
            Quorum::Majority => write!(f, "majority"),
            Quorum::All => write!(f, "all"),
        }
    }
}

impl std::str::FromStr for Quorum {
    type Err = BfrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("majority") {
            Ok(Quorum::Majority)
        } else if s.eq_ignore_ascii_case("all") {
            Ok(Quorum::All)
        } else {
            s.parse::<usize>()
                .map(Quorum::Count)
                .map_err(|_| BfrError::Config(format!("unsupported quorum value '{s}'")))
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum QuorumRepr {
    Count(usize),
    Named(String),
}

impl TryFrom<QuorumRepr> for Quorum {
    type Error = BfrError;

    fn try_from(repr: QuorumRepr) -> Result<Self, Self::Error> {
        match repr {
            QuorumRepr::Count(n) => Ok(Quorum::Count(n)),
            QuorumRepr::Named(s) => s.parse(),
        }
    }
}

impl From<Quorum> for QuorumRepr {
    fn from(q: Quorum) -> Self {
        match q {
            Quorum::Count(n) => QuorumRepr::Count(n),
            other => QuorumRepr::Named(other.to_string()),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BfrError {
    #[error("version conflict on {record}: expected {expected}, stored {actual}")]
    Conflict { record: RecordId, expected: u64, actual: u64 },
    #[error("replica behind on {record}: expected {expected}, stored {actual}")]
    ReplicaBehind { record: RecordId, expected: u64, actual: u64 },
    #[error("quorum not reached: required {required}, received {received}")]
    QuorumNotReached { required: usize, received: usize },
    #[error("database '{database}' is not online on {}", .node.as_deref().unwrap_or("any node"))]
    DatabaseNotOnline {
        database: DatabaseName,
        node: Option<NodeId>,
    },
    #[error("database '{0}' already exists")]
    DuplicateDatabase(DatabaseName),
    #[error("database '{0}' not found")]
    DatabaseNotFound(DatabaseName),
    #[error("node '{0}' is unavailable")]
    NodeUnavailable(NodeId),
    #[error("node '{0}' is already online")]
    NodeAlreadyOnline(NodeId),
    #[error("node '{0}' was refused by a lifecycle listener")]
    JoinRefused(NodeId),
    #[error("illegal status transition for '{database}' on '{node}': {from} -> {to}")]
    IllegalTransition {
        node: NodeId,
        database: DatabaseName,
        from: DbStatus,
        to: DbStatus,
    },
    #[error("resync of '{database}' on '{node}' already in progress")]
    ResyncInProgress { node: NodeId, database: DatabaseName },
    #[error("unique index '{index}' violated by {record}")]
    DuplicateKey { index: String, record: RecordId },
    #[error("record {0} not found")]
    NotFound(RecordId),
    #[error("operation timed out")]
    Timeout,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BfrError {
    /// `true` when repeating the operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BfrError::ReplicaBehind { .. }
                | BfrError::QuorumNotReached { .. }
                | BfrError::DatabaseNotOnline { .. }
                | BfrError::NodeUnavailable(_)
                | BfrError::ResyncInProgress { .. }
                | BfrError::Timeout
        )
    }
}
