pub mod mem;
pub mod traits;
pub mod types;

pub use mem::MemRecordStore;
pub use traits::RecordStore;
pub use types::{InstallStats, Snapshot, SnapshotMeta};
