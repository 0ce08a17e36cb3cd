//! Snapshot store: sealed byte images of applied state.
//!
//! A snapshot starts pending, is filled through its exclusive writer,
//! and becomes immutable and discoverable once `complete()` locks the
//! descriptor. File layout: 64-byte descriptor, `length: u32`, payload.
//! File-backed and memory-backed stores share the same contract.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::{Storage, StorageLevel};
use crate::error::{RaftError, Result};
use crate::LogIndex;

pub(crate) const SNAPSHOT_MAGIC: &[u8; 4] = b"SNP\0";
pub(crate) const SNAPSHOT_VERSION: u32 = 1;
const DESCRIPTOR_LEN: u64 = 64;

/// Snapshot descriptor, stored in the first 64 bytes of the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotDescriptor {
    pub id: u64,
    /// Last applied log index captured by this snapshot.
    pub index: LogIndex,
    pub timestamp: u64,
    pub locked: bool,
}

impl SnapshotDescriptor {
    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN as usize] {
        let mut buf = [0u8; DESCRIPTOR_LEN as usize];
        buf[0..4].copy_from_slice(SNAPSHOT_MAGIC);
        buf[4..8].copy_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.index.to_le_bytes());
        buf[24..32].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[32] = self.locked as u8;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DESCRIPTOR_LEN as usize {
            return Err(RaftError::Storage("snapshot descriptor truncated".into()));
        }
        if &buf[0..4] != SNAPSHOT_MAGIC {
            return Err(RaftError::Storage("bad snapshot magic".into()));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != SNAPSHOT_VERSION {
            return Err(RaftError::Storage(format!(
                "unsupported snapshot version {}",
                version
            )));
        }
        Ok(Self {
            id: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            index: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            locked: buf[32] != 0,
        })
    }
}

enum SnapshotBacking {
    Disk(PathBuf),
    Memory(Vec<u8>),
}

struct SnapshotInner {
    descriptor: SnapshotDescriptor,
    backing: SnapshotBacking,
    writer_open: bool,
    written: u32,
}

/// Handle to a single snapshot. Clones share state.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<Mutex<SnapshotInner>>,
    store: SnapshotStore,
}

impl Snapshot {
    pub fn id(&self) -> u64 {
        self.inner.lock().unwrap().descriptor.id
    }

    pub fn index(&self) -> LogIndex {
        self.inner.lock().unwrap().descriptor.index
    }

    pub fn timestamp(&self) -> u64 {
        self.inner.lock().unwrap().descriptor.timestamp
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().unwrap().descriptor.locked
    }

    /// Opens the exclusive writer. Fails if the snapshot is already
    /// locked or a writer is outstanding.
    pub fn writer(&self) -> Result<SnapshotWriter> {
        let mut inner = self.inner.lock().unwrap();
        if inner.descriptor.locked {
            return Err(RaftError::Storage("snapshot is locked".into()));
        }
        if inner.writer_open {
            return Err(RaftError::Storage("snapshot writer already open".into()));
        }
        inner.writer_open = true;

        let file = match &inner.backing {
            SnapshotBacking::Disk(path) => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .open(path)?;
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&inner.descriptor.encode())?;
                // Length placeholder, stamped on close.
                file.write_all(&0u32.to_le_bytes())?;
                Some(file)
            }
            SnapshotBacking::Memory(_) => None,
        };
        Ok(SnapshotWriter {
            snapshot: self.clone(),
            file,
            buffer: Vec::new(),
            written: 0,
            closed: false,
        })
    }

    /// Opens a reader. The snapshot must be complete.
    pub fn reader(&self) -> Result<SnapshotReader> {
        let inner = self.inner.lock().unwrap();
        if !inner.descriptor.locked {
            return Err(RaftError::Storage(
                "cannot read an incomplete snapshot".into(),
            ));
        }
        let data = match &inner.backing {
            SnapshotBacking::Disk(path) => {
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(DESCRIPTOR_LEN))?;
                let mut len_buf = [0u8; 4];
                file.read_exact(&mut len_buf)?;
                let length = u32::from_le_bytes(len_buf) as usize;
                let mut data = vec![0u8; length];
                file.read_exact(&mut data)?;
                data
            }
            SnapshotBacking::Memory(data) => data.clone(),
        };
        Ok(SnapshotReader { data, position: 0 })
    }

    /// Seals the snapshot: locks the descriptor and registers it as
    /// discoverable in the store.
    pub fn complete(&self) -> Result<Snapshot> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.descriptor.locked {
                return Err(RaftError::Storage(
                    "cannot complete a locked snapshot".into(),
                ));
            }
            if inner.writer_open {
                return Err(RaftError::Storage(
                    "cannot complete with an open writer".into(),
                ));
            }
            inner.descriptor.locked = true;
            if let SnapshotBacking::Disk(path) = &inner.backing {
                let mut file = OpenOptions::new().write(true).open(path)?;
                file.write_all(&inner.descriptor.encode())?;
                file.sync_all()?;
            }
        }
        self.store.register(self.clone());
        Ok(self.clone())
    }

    /// Bytes of snapshot data written so far.
    pub fn size(&self) -> u32 {
        self.inner.lock().unwrap().written
    }

    fn delete_backing(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        if let SnapshotBacking::Disk(path) = &inner.backing {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

/// Exclusive writer for a pending snapshot. `close()` stamps the length
/// prefix; dropping without closing leaves the snapshot incomplete.
pub struct SnapshotWriter {
    snapshot: Snapshot,
    file: Option<File>,
    buffer: Vec<u8>,
    written: u32,
    closed: bool,
}

impl SnapshotWriter {
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(RaftError::Storage("snapshot writer closed".into()));
        }
        match &mut self.file {
            Some(file) => file.write_all(bytes)?,
            None => self.buffer.extend_from_slice(bytes),
        }
        self.written += bytes.len() as u32;
        Ok(())
    }

    /// Bytes written so far; the next expected install offset.
    pub fn offset(&self) -> u32 {
        self.written
    }

    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        if let Some(file) = &mut self.file {
            file.seek(SeekFrom::Start(DESCRIPTOR_LEN))?;
            file.write_all(&self.written.to_le_bytes())?;
            file.sync_all()?;
        }
        let mut inner = self.snapshot.inner.lock().unwrap();
        if self.file.is_none() {
            if let SnapshotBacking::Memory(data) = &mut inner.backing {
                *data = std::mem::take(&mut self.buffer);
            }
        }
        inner.written = self.written;
        inner.writer_open = false;
        Ok(())
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        if !self.closed {
            self.snapshot.inner.lock().unwrap().writer_open = false;
        }
    }
}

/// Reader over a completed snapshot.
pub struct SnapshotReader {
    data: Vec<u8>,
    position: usize,
}

impl SnapshotReader {
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reads the next chunk of at most `max` bytes; empty at the end.
    pub fn chunk(&mut self, max: usize) -> &[u8] {
        let start = self.position;
        let end = (start + max).min(self.data.len());
        self.position = end;
        &self.data[start..end]
    }
}

struct StoreInner {
    level: StorageLevel,
    directory: PathBuf,
    completed: BTreeMap<LogIndex, Snapshot>,
    pending: Vec<Snapshot>,
    next_id: u64,
}

/// Store managing all snapshots of one server.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl SnapshotStore {
    /// Opens the store, loading completed snapshots and deleting
    /// incomplete leftovers from a crashed writer.
    pub fn open(storage: &Storage) -> Result<Self> {
        let store = Self {
            inner: Arc::new(Mutex::new(StoreInner {
                level: storage.level,
                directory: storage.directory.clone(),
                completed: BTreeMap::new(),
                pending: Vec::new(),
                next_id: 1,
            })),
        };

        if storage.level == StorageLevel::Disk {
            std::fs::create_dir_all(&storage.directory)?;
            let mut found = Vec::new();
            for entry in std::fs::read_dir(&storage.directory)? {
                let path = entry?.path();
                if path.extension().map(|e| e == "snapshot").unwrap_or(false) {
                    let mut file = File::open(&path)?;
                    let mut header = [0u8; DESCRIPTOR_LEN as usize];
                    if file.read_exact(&mut header).is_err() {
                        std::fs::remove_file(&path)?;
                        continue;
                    }
                    match SnapshotDescriptor::decode(&header) {
                        Ok(descriptor) if descriptor.locked => {
                            found.push((descriptor, path));
                        }
                        _ => {
                            std::fs::remove_file(&path)?;
                        }
                    }
                }
            }
            let mut inner = store.inner.lock().unwrap();
            for (descriptor, path) in found {
                inner.next_id = inner.next_id.max(descriptor.id + 1);
                let written = std::fs::metadata(&path)?
                    .len()
                    .saturating_sub(DESCRIPTOR_LEN + 4) as u32;
                let snapshot = Snapshot {
                    inner: Arc::new(Mutex::new(SnapshotInner {
                        descriptor,
                        backing: SnapshotBacking::Disk(path),
                        writer_open: false,
                        written,
                    })),
                    store: store.clone(),
                };
                inner.completed.insert(descriptor.index, snapshot);
            }
        }
        Ok(store)
    }

    /// Creates a pending snapshot at `index`. Fails if a snapshot
    /// already exists at that index.
    pub fn new_snapshot(&self, index: LogIndex, timestamp: u64) -> Result<Snapshot> {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            id
        };
        self.new_snapshot_with_id(id, index, timestamp)
    }

    /// Creates a pending snapshot with an id assigned elsewhere (the
    /// install protocol carries the leader's id).
    pub fn new_snapshot_with_id(
        &self,
        id: u64,
        index: LogIndex,
        timestamp: u64,
    ) -> Result<Snapshot> {
        let mut inner = self.inner.lock().unwrap();
        if inner.completed.contains_key(&index) {
            return Err(RaftError::Storage(format!(
                "snapshot already exists at index {}",
                index
            )));
        }
        inner.next_id = inner.next_id.max(id + 1);

        let descriptor = SnapshotDescriptor {
            id,
            index,
            timestamp,
            locked: false,
        };
        let backing = match inner.level {
            StorageLevel::Disk => SnapshotBacking::Disk(
                inner.directory.join(format!("{}-{}.snapshot", id, index)),
            ),
            StorageLevel::Memory => SnapshotBacking::Memory(Vec::new()),
        };
        let snapshot = Snapshot {
            inner: Arc::new(Mutex::new(SnapshotInner {
                descriptor,
                backing,
                writer_open: false,
                written: 0,
            })),
            store: self.clone(),
        };
        inner.pending.push(snapshot.clone());
        Ok(snapshot)
    }

    /// The highest-index completed snapshot.
    pub fn current_snapshot(&self) -> Option<Snapshot> {
        let inner = self.inner.lock().unwrap();
        inner.completed.values().next_back().cloned()
    }

    /// Looks up a completed snapshot by index.
    pub fn snapshot_at(&self, index: LogIndex) -> Option<Snapshot> {
        self.inner.lock().unwrap().completed.get(&index).cloned()
    }

    /// Deletes a snapshot and its backing file. Idempotent.
    pub fn delete(&self, snapshot: &Snapshot) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            let index = snapshot.index();
            inner.completed.remove(&index);
            inner
                .pending
                .retain(|p| !Arc::ptr_eq(&p.inner, &snapshot.inner));
        }
        snapshot.delete_backing()
    }

    /// Drops completed snapshots older than the current one.
    pub fn prune(&self) -> Result<()> {
        let stale: Vec<Snapshot> = {
            let inner = self.inner.lock().unwrap();
            let count = inner.completed.len();
            inner
                .completed
                .values()
                .take(count.saturating_sub(1))
                .cloned()
                .collect()
        };
        for snapshot in stale {
            self.delete(&snapshot)?;
        }
        Ok(())
    }

    fn register(&self, snapshot: Snapshot) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .pending
            .retain(|p| !Arc::ptr_eq(&p.inner, &snapshot.inner));
        inner.completed.insert(snapshot.index(), snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory_store() -> SnapshotStore {
        SnapshotStore::open(&Storage::memory()).unwrap()
    }

    #[test]
    fn test_write_complete_read_round_trip() {
        let store = memory_store();
        let snapshot = store.new_snapshot(10, 1000).unwrap();

        let mut writer = snapshot.writer().unwrap();
        writer.write(b"hello ").unwrap();
        writer.write(b"snapshot").unwrap();
        writer.close().unwrap();

        // Not discoverable until complete.
        assert!(store.current_snapshot().is_none());
        assert!(snapshot.reader().is_err());

        snapshot.complete().unwrap();
        let current = store.current_snapshot().unwrap();
        assert_eq!(current.index(), 10);
        assert_eq!(current.reader().unwrap().bytes(), b"hello snapshot");
    }

    #[test]
    fn test_single_writer_exclusive() {
        let store = memory_store();
        let snapshot = store.new_snapshot(5, 0).unwrap();
        let writer = snapshot.writer().unwrap();
        assert!(snapshot.writer().is_err());
        drop(writer);
        // Aborted writers release exclusivity.
        assert!(snapshot.writer().is_ok());
    }

    #[test]
    fn test_duplicate_index_rejected() {
        let store = memory_store();
        let snapshot = store.new_snapshot(5, 0).unwrap();
        let mut writer = snapshot.writer().unwrap();
        writer.write(b"x").unwrap();
        writer.close().unwrap();
        snapshot.complete().unwrap();

        assert!(store.new_snapshot(5, 0).is_err());
    }

    #[test]
    fn test_complete_is_single_shot() {
        let store = memory_store();
        let snapshot = store.new_snapshot(5, 0).unwrap();
        let writer = snapshot.writer().unwrap();
        writer.close().unwrap();
        snapshot.complete().unwrap();
        assert!(snapshot.complete().is_err());
    }

    #[test]
    fn test_current_is_highest_index() {
        let store = memory_store();
        for index in [3u64, 9, 6] {
            let snapshot = store.new_snapshot(index, 0).unwrap();
            let writer = snapshot.writer().unwrap();
            writer.close().unwrap();
            snapshot.complete().unwrap();
        }
        assert_eq!(store.current_snapshot().unwrap().index(), 9);

        store.prune().unwrap();
        assert_eq!(store.current_snapshot().unwrap().index(), 9);
        assert!(store.snapshot_at(3).is_none());
    }

    #[test]
    fn test_disk_store_reload_drops_incomplete() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::disk(dir.path());
        {
            let store = SnapshotStore::open(&storage).unwrap();

            let done = store.new_snapshot(4, 77).unwrap();
            let mut writer = done.writer().unwrap();
            writer.write(b"state-at-4").unwrap();
            writer.close().unwrap();
            done.complete().unwrap();

            // A snapshot that never completed.
            let pending = store.new_snapshot(8, 78).unwrap();
            let mut writer = pending.writer().unwrap();
            writer.write(b"partial").unwrap();
            writer.close().unwrap();
        }

        let store = SnapshotStore::open(&storage).unwrap();
        let current = store.current_snapshot().unwrap();
        assert_eq!(current.index(), 4);
        assert_eq!(current.timestamp(), 77);
        assert_eq!(current.reader().unwrap().bytes(), b"state-at-4");
        assert!(store.snapshot_at(8).is_none());
    }

    #[test]
    fn test_reader_chunking() {
        let store = memory_store();
        let snapshot = store.new_snapshot(2, 0).unwrap();
        let mut writer = snapshot.writer().unwrap();
        writer.write(&[1, 2, 3, 4, 5, 6, 7]).unwrap();
        writer.close().unwrap();
        snapshot.complete().unwrap();

        let mut reader = snapshot.reader().unwrap();
        assert_eq!(reader.chunk(3), &[1, 2, 3]);
        assert_eq!(reader.chunk(3), &[4, 5, 6]);
        assert_eq!(reader.chunk(3), &[7]);
        assert!(reader.chunk(3).is_empty());
    }
}
