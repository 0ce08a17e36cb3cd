//! Configuration for quoraft servers and their storage.

use std::path::PathBuf;
use std::time::Duration;

/// Where log segments and snapshots live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageLevel {
    /// Durable files under the configured directory.
    Disk,
    /// Everything held in memory; lost on restart. Used by tests and
    /// ephemeral members.
    Memory,
}

/// Storage settings shared by the log and snapshot stores.
#[derive(Clone, Debug)]
pub struct Storage {
    /// Backing medium.
    pub level: StorageLevel,

    /// Directory for segment, snapshot, and metadata files.
    pub directory: PathBuf,

    /// Maximum bytes per log segment before rolling.
    pub max_segment_size: u64,

    /// Maximum entries per log segment before rolling.
    pub max_segment_entries: u32,

    /// Take a snapshot and compact once this many entries have been
    /// applied since the last snapshot.
    pub compaction_threshold: u64,
}

impl Storage {
    pub fn disk(directory: impl Into<PathBuf>) -> Self {
        Self {
            level: StorageLevel::Disk,
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn memory() -> Self {
        Self {
            level: StorageLevel::Memory,
            ..Self::default()
        }
    }

    pub fn with_max_segment_size(mut self, bytes: u64) -> Self {
        self.max_segment_size = bytes;
        self
    }

    pub fn with_max_segment_entries(mut self, entries: u32) -> Self {
        self.max_segment_entries = entries;
        self
    }

    pub fn with_compaction_threshold(mut self, entries: u64) -> Self {
        self.compaction_threshold = entries;
        self
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            level: StorageLevel::Memory,
            directory: PathBuf::from("."),
            max_segment_size: 32 * 1024 * 1024,
            max_segment_entries: 1024 * 1024,
            compaction_threshold: 1000,
        }
    }
}

/// Configuration for a single server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Randomized election timeout window.
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,

    /// Interval between leader heartbeats.
    pub heartbeat_interval: Duration,

    /// Deadline applied to every outgoing RPC.
    pub rpc_timeout: Duration,

    /// Maximum entries shipped per AppendRequest.
    pub max_entries_per_append: usize,

    /// Chunk size for the snapshot install protocol.
    pub install_chunk_size: usize,

    /// Storage settings.
    pub storage: Storage,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = storage;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_millis(500),
            max_entries_per_append: 64,
            install_chunk_size: 32 * 1024,
            storage: Storage::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.election_timeout_min, Duration::from_millis(150));
        assert_eq!(config.election_timeout_max, Duration::from_millis(300));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(50));
        assert_eq!(config.storage.level, StorageLevel::Memory);
    }

    #[test]
    fn test_builder_setters() {
        let config = ServerConfig::new()
            .with_election_timeout(Duration::from_millis(20), Duration::from_millis(40))
            .with_heartbeat_interval(Duration::from_millis(5))
            .with_storage(Storage::disk("/tmp/raft").with_max_segment_entries(8));
        assert_eq!(config.election_timeout_max, Duration::from_millis(40));
        assert_eq!(config.storage.level, StorageLevel::Disk);
        assert_eq!(config.storage.max_segment_entries, 8);
    }
}
