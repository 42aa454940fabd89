//! Coordination layer of a bifrost cluster: membership, database status,
//! quorum replication, conflict detection, placement and resynchronization.
//!
//! A [`Node`] ties the components together around a [`RecordStore`] and a
//! [`Transport`]; [`LocalNetwork`] runs several nodes inside one process.
//!
//! [`RecordStore`]: bfr_storage::RecordStore

mod admin;
pub mod config;
pub mod conflict;
pub mod context;
pub mod listener;
pub mod membership;
mod node;
pub mod placement;
pub mod quorum;
pub mod resync;
mod session;
pub mod status;
pub mod transport;

pub use admin::{ClusterStatus, DatabaseOptions};
pub use config::{
    unique_indexes, ClusterSettings, ConfigRegistry, DistributedConfig, IndexDef, ServerRole,
};
pub use conflict::{check_version, ConflictDetector};
pub use context::NodeContext;
pub use listener::{ClusterEvent, LifecycleListener, ListenerId, ListenerRegistry};
pub use membership::{LeaveReason, MembershipManager, NodeInfo};
pub use node::Node;
pub use placement::{
    Placement, PlacementRequest, PlacementStrategy, RoutingMode, StrategyKind, Target,
};
pub use quorum::{PendingOperation, QuorumCoordinator, WriteTarget};
pub use resync::{Resynchronizer, SyncMode};
pub use session::Session;
pub use status::{DatabaseStatusTracker, StatusEntry};
pub use transport::{Envelope, LocalNetwork, Request, Response, Transport};
