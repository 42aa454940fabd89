use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use bfr_types::{BfrError, Record, RecordId};

use crate::traits::RecordStore;
use crate::types::{InstallStats, Snapshot, SnapshotContents, SnapshotMeta};

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, BfrError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| BfrError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, BfrError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| BfrError::Storage(e.to_string()))
}

type Records = BTreeMap<RecordId, Record>;

/// In-memory `RecordStore`: one `BTreeMap` per database.
///
/// Not persisted across process restarts, but a node restarted with the same
/// `Arc<MemRecordStore>` keeps its data, which is how tests model a restart.
pub struct MemRecordStore {
    inner: Arc<RwLock<HashMap<String, Records>>>,
}

impl MemRecordStore {
    pub fn new() -> Self {
        MemRecordStore {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(database: &str) -> BfrError {
    BfrError::DatabaseNotFound(database.to_string())
}

impl RecordStore for MemRecordStore {
    async fn create_database(&self, database: &str) -> Result<(), BfrError> {
        self.inner.write().await.entry(database.to_string()).or_default();
        Ok(())
    }

    async fn drop_database(&self, database: &str) -> Result<bool, BfrError> {
        Ok(self.inner.write().await.remove(database).is_some())
    }

    async fn has_database(&self, database: &str) -> Result<bool, BfrError> {
        Ok(self.inner.read().await.contains_key(database))
    }

    async fn get(&self, database: &str, id: &RecordId) -> Result<Option<Record>, BfrError> {
        let g = self.inner.read().await;
        let records = g.get(database).ok_or_else(|| missing(database))?;
        Ok(records.get(id).cloned())
    }

    async fn put(&self, database: &str, record: Record) -> Result<(), BfrError> {
        let mut g = self.inner.write().await;
        let records = g.get_mut(database).ok_or_else(|| missing(database))?;
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn count_class(&self, database: &str, class: &str) -> Result<u64, BfrError> {
        let g = self.inner.read().await;
        let records = g.get(database).ok_or_else(|| missing(database))?;
        Ok(records.values().filter(|r| r.is_live() && r.class == class).count() as u64)
    }

    async fn find_by_value(
        &self,
        database: &str,
        class: &str,
        value: &[u8],
    ) -> Result<Option<RecordId>, BfrError> {
        let g = self.inner.read().await;
        let records = g.get(database).ok_or_else(|| missing(database))?;
        Ok(records
            .values()
            .find(|r| r.is_live() && r.class == class && r.value == value)
            .map(|r| r.id.clone()))
    }

    async fn find_duplicate(
        &self,
        database: &str,
        class: &str,
    ) -> Result<Option<RecordId>, BfrError> {
        let g = self.inner.read().await;
        let records = g.get(database).ok_or_else(|| missing(database))?;
        let mut seen: HashMap<&[u8], &RecordId> = HashMap::new();
        for r in records.values().filter(|r| r.is_live() && r.class == class) {
            if seen.insert(r.value.as_slice(), &r.id).is_some() {
                return Ok(Some(r.id.clone()));
            }
        }
        Ok(None)
    }

    async fn build_snapshot(
        &self,
        database: &str,
        cluster: Option<&str>,
    ) -> Result<Snapshot, BfrError> {
        let g = self.inner.read().await;
        let records = g.get(database).ok_or_else(|| missing(database))?;
        let contents = SnapshotContents {
            records: records
                .values()
                .filter(|r| cluster.map_or(true, |c| r.id.cluster == c))
                .cloned()
                .collect(),
        };
        Ok(Snapshot {
            meta: SnapshotMeta {
                database: database.to_string(),
                cluster: cluster.map(str::to_string),
                record_count: contents.records.len() as u64,
                snapshot_id: uuid::Uuid::new_v4().to_string(),
            },
            data: encode(&contents)?,
        })
    }

    async fn install_snapshot(
        &self,
        database: &str,
        snapshot: Snapshot,
        accept: &(dyn Fn(&RecordId) -> bool + Send + Sync),
    ) -> Result<InstallStats, BfrError> {
        let contents: SnapshotContents = decode(&snapshot.data)?;
        let mut g = self.inner.write().await;
        let records = g.entry(database.to_string()).or_default();
        let mut stats = InstallStats::default();
        for incoming in contents.records {
            if !accept(&incoming.id) {
                stats.skipped += 1;
                continue;
            }
            // Equal versions with different writers resolve to the larger
            // `last_op` on both sides.
            let wins = match records.get(&incoming.id) {
                None => true,
                Some(local) => {
                    (incoming.version, incoming.last_op) > (local.version, local.last_op)
                }
            };
            if wins {
                records.insert(incoming.id.clone(), incoming);
                stats.applied += 1;
            } else {
                stats.skipped += 1;
            }
        }
        Ok(stats)
    }
}
