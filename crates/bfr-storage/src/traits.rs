use std::future::Future;

use bfr_types::{BfrError, Record, RecordId};

use crate::types::{InstallStats, Snapshot};

/// Local record storage of one node, seen by the coordination layer as an
/// opaque service.
///
/// Methods use RPITIT (`-> impl Future + Send`) so generic callers can
/// `.await` across threads without an `async-trait` dependency.
///
/// The store does not validate versions. Version checks belong to the
/// conflict detector, which serializes writers per partition before calling
/// [`RecordStore::put`].
pub trait RecordStore: Send + Sync + 'static {
    /// Create an empty database. Creating an existing database is a no-op.
    fn create_database(&self, database: &str)
        -> impl Future<Output = Result<(), BfrError>> + Send;

    /// Remove a database and all of its records. Returns `false` when the
    /// database did not exist.
    fn drop_database(&self, database: &str)
        -> impl Future<Output = Result<bool, BfrError>> + Send;

    fn has_database(&self, database: &str)
        -> impl Future<Output = Result<bool, BfrError>> + Send;

    /// Return the stored record, tombstones included.
    fn get(&self, database: &str, id: &RecordId)
        -> impl Future<Output = Result<Option<Record>, BfrError>> + Send;

    /// Insert or overwrite a record.
    fn put(&self, database: &str, record: Record)
        -> impl Future<Output = Result<(), BfrError>> + Send;

    /// Count live records of a class.
    fn count_class(&self, database: &str, class: &str)
        -> impl Future<Output = Result<u64, BfrError>> + Send;

    /// Find a live record of `class` holding exactly `value`.
    fn find_by_value(&self, database: &str, class: &str, value: &[u8])
        -> impl Future<Output = Result<Option<RecordId>, BfrError>> + Send;

    /// Return a live record of `class` whose value is shared with another
    /// live record of the same class, if any.
    fn find_duplicate(&self, database: &str, class: &str)
        -> impl Future<Output = Result<Option<RecordId>, BfrError>> + Send;

    /// Serialize the database, or a single cluster of it, into a `Snapshot`.
    fn build_snapshot(&self, database: &str, cluster: Option<&str>)
        -> impl Future<Output = Result<Snapshot, BfrError>> + Send;

    /// Merge a snapshot received from a peer.
    ///
    /// For each record accepted by `accept`: the snapshot copy wins when its
    /// version is higher, or equal with a larger `last_op`. Local records
    /// missing from the snapshot are kept. Creates the database if needed.
    fn install_snapshot(
        &self,
        database: &str,
        snapshot: Snapshot,
        accept: &(dyn Fn(&RecordId) -> bool + Send + Sync),
    ) -> impl Future<Output = Result<InstallStats, BfrError>> + Send;
}
