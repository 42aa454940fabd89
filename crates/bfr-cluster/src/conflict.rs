use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use bfr_storage::RecordStore;
use bfr_types::{BfrError, OpKind, OpResponse, Operation, Record, RecordId, RecordVersion};

use crate::config::{unique_indexes, IndexDef};

type Sections = parking_lot::Mutex<HashMap<(String, String), Arc<Mutex<()>>>>;

/// Optimistic version check: accept only `expected == current`, returning
/// the version to commit.
///
/// Values are never compared, so a stale write fails even when it would
/// store identical bytes.
pub fn check_version(record: &RecordId, expected: u64, current: u64) -> Result<u64, BfrError> {
    if expected < current {
        Err(BfrError::Conflict {
            record: record.clone(),
            expected,
            actual: current,
        })
    } else if expected > current {
        Err(BfrError::ReplicaBehind {
            record: record.clone(),
            expected,
            actual: current,
        })
    } else {
        Ok(current + 1)
    }
}

/// Replica-side validation and commit of replicated operations.
///
/// Check and write happen inside one exclusive section per
/// `(database, cluster)` partition. Writes to a class with a unique index
/// also hold the `(database, class)` section, taken first.
pub struct ConflictDetector<S> {
    store: Arc<S>,
    partitions: Sections,
    classes: Sections,
}

async fn enter(sections: &Sections, database: &str, name: &str) -> OwnedMutexGuard<()> {
    let section = sections
        .lock()
        .entry((database.to_string(), name.to_string()))
        .or_default()
        .clone();
    section.lock_owned().await
}

impl<S: RecordStore> ConflictDetector<S> {
    pub fn new(store: Arc<S>) -> Self {
        ConflictDetector {
            store,
            partitions: parking_lot::Mutex::new(HashMap::new()),
            classes: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Class whose unique indexes `op` must be checked against, if any.
    async fn unique_class(
        &self,
        database: &str,
        op: &Operation,
        indexes: &[IndexDef],
    ) -> Result<Option<String>, BfrError> {
        let class = match &op.kind {
            OpKind::Insert { class, .. } => Some(class.clone()),
            OpKind::Update { record, .. } => {
                self.store.get(database, record).await?.map(|r| r.class)
            }
            OpKind::Delete { .. } => None,
        };
        Ok(class.filter(|c| unique_indexes(indexes, c).next().is_some()))
    }

    /// Validate `op` against the stored version and commit it.
    pub async fn check_and_bump(
        &self,
        database: &str,
        op: &Operation,
        indexes: &[IndexDef],
    ) -> Result<OpResponse, BfrError> {
        let id = op.record();
        loop {
            let class = self.unique_class(database, op, indexes).await?;
            let _class = match &class {
                Some(class) => Some(enter(&self.classes, database, class).await),
                None => None,
            };
            let _partition = enter(&self.partitions, database, &id.cluster).await;

            let stored = self.store.get(database, id).await?;
            if matches!(op.kind, OpKind::Update { .. }) {
                let locked = stored
                    .as_ref()
                    .map(|r| r.class.as_str())
                    .filter(|c| unique_indexes(indexes, c).next().is_some());
                // The record appeared after the class was looked up.
                if locked != class.as_deref() {
                    continue;
                }
            }
            return self.commit(database, op, indexes, stored).await;
        }
    }

    async fn commit(
        &self,
        database: &str,
        op: &Operation,
        indexes: &[IndexDef],
        stored: Option<Record>,
    ) -> Result<OpResponse, BfrError> {
        let id = op.record();
        if let Some(r) = stored.as_ref().filter(|r| r.last_op == Some(op.id)) {
            tracing::debug!(
                database,
                record = %id,
                version = r.version,
                "duplicate delivery acknowledged"
            );
            return Ok(ack(r));
        }
        let current = stored.as_ref().map_or(0, |r| r.version);

        let record = match &op.kind {
            OpKind::Insert {
                record,
                class,
                value,
            } => {
                if stored.as_ref().is_some_and(Record::is_live) {
                    return Err(BfrError::Conflict {
                        record: record.clone(),
                        expected: 0,
                        actual: current,
                    });
                }
                self.check_unique(database, record, class, value, indexes)
                    .await?;
                Record {
                    id: record.clone(),
                    class: class.clone(),
                    value: value.clone(),
                    version: current + 1,
                    deleted: false,
                    last_op: Some(op.id),
                }
            }
            OpKind::Update {
                record,
                value,
                expected_version,
            } => {
                let version = check_version(record, *expected_version, current)?;
                let prev = live(stored, record)?;
                self.check_unique(database, record, &prev.class, value, indexes)
                    .await?;
                Record {
                    value: value.clone(),
                    version,
                    last_op: Some(op.id),
                    ..prev
                }
            }
            OpKind::Delete {
                record,
                expected_version,
            } => {
                let version = check_version(record, *expected_version, current)?;
                let prev = live(stored, record)?;
                Record {
                    value: Vec::new(),
                    version,
                    deleted: true,
                    last_op: Some(op.id),
                    ..prev
                }
            }
        };

        let response = ack(&record);
        self.store.put(database, record).await?;
        tracing::trace!(
            database,
            record = %id,
            version = response.version().version,
            "committed"
        );
        Ok(response)
    }

    async fn check_unique(
        &self,
        database: &str,
        record: &RecordId,
        class: &str,
        value: &[u8],
        indexes: &[IndexDef],
    ) -> Result<(), BfrError> {
        for index in unique_indexes(indexes, class) {
            if let Some(other) = self.store.find_by_value(database, class, value).await? {
                if other != *record {
                    return Err(BfrError::DuplicateKey {
                        index: index.name.clone(),
                        record: record.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn live(stored: Option<Record>, id: &RecordId) -> Result<Record, BfrError> {
    stored
        .filter(Record::is_live)
        .ok_or_else(|| BfrError::NotFound(id.clone()))
}

fn ack(record: &Record) -> OpResponse {
    let version = RecordVersion {
        record: record.id.clone(),
        version: record.version,
    };
    if record.deleted {
        OpResponse::Deleted(version)
    } else {
        OpResponse::Written(version)
    }
}
