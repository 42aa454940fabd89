use bfr_types::{ClusterName, DatabaseName, Record};

/// Metadata identifying a snapshot.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMeta {
    pub database: DatabaseName,
    /// `None` for a whole-database snapshot, `Some` for a single cluster.
    pub cluster: Option<ClusterName>,
    /// Number of records (tombstones included) captured.
    pub record_count: u64,
    /// UUID v4 string identifying this snapshot.
    pub snapshot_id: String,
}

/// Internal serialized format stored in [`Snapshot::data`].
#[derive(serde::Serialize, serde::Deserialize)]
pub(crate) struct SnapshotContents {
    pub records: Vec<Record>,
}

/// A consistent copy of a database (or one of its clusters) taken on a peer.
///
/// `data` is a `bincode`-serialized [`SnapshotContents`]. Tombstones are
/// included so that deletions reach the node installing the snapshot.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// Outcome of merging a snapshot into local storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InstallStats {
    /// Records written because the snapshot copy won.
    pub applied: u64,
    /// Records already up to date, or outside the accepted clusters.
    pub skipped: u64,
}
