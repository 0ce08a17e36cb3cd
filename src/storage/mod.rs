//! Durable state: the segmented log, the snapshot store, and persisted
//! server metadata.

pub mod entry;
pub mod log;
pub mod meta;
pub mod segment;
pub mod snapshot;

pub use entry::{EntryKind, Indexed, LogEntry};
pub use log::{LogReader, RaftLog, ReadMode};
pub use meta::{MetaStore, ServerMetadata};
pub use snapshot::{Snapshot, SnapshotReader, SnapshotStore, SnapshotWriter};
