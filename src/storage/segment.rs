//! Log segments: bounded append-only files with a fixed descriptor
//! header and crc32c-framed entries.
//!
//! Disk layout: a 64-byte descriptor followed by repeated frames of
//! `{length: u32, checksum: u32, payload}`. The checksum covers the
//! length prefix and the payload so a torn write is detected no matter
//! which half survived. Recovery truncates at the first bad frame.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32c::crc32c;

use crate::config::StorageLevel;
use crate::error::{RaftError, Result};
use crate::storage::entry::Indexed;
use crate::LogIndex;

pub(crate) const SEGMENT_MAGIC: &[u8; 4] = b"LOG\0";
pub(crate) const SEGMENT_VERSION: u32 = 1;
/// Fixed size of the descriptor header.
pub(crate) const DESCRIPTOR_LEN: u64 = 64;
const FRAME_HEADER_LEN: u64 = 8;

/// Segment descriptor, stored in the first 64 bytes of every segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub id: u64,
    /// First log index covered by this segment.
    pub index: LogIndex,
    pub max_segment_size: u64,
    pub max_entries: u32,
    /// Creation time, unix milliseconds.
    pub created: u64,
    /// Set when the segment is sealed and becomes read-only.
    pub locked: bool,
}

impl SegmentDescriptor {
    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN as usize] {
        let mut buf = [0u8; DESCRIPTOR_LEN as usize];
        buf[0..4].copy_from_slice(SEGMENT_MAGIC);
        buf[4..8].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.index.to_le_bytes());
        buf[24..32].copy_from_slice(&self.max_segment_size.to_le_bytes());
        buf[32..36].copy_from_slice(&self.max_entries.to_le_bytes());
        buf[36..44].copy_from_slice(&self.created.to_le_bytes());
        buf[44] = self.locked as u8;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DESCRIPTOR_LEN as usize {
            return Err(RaftError::Storage("segment descriptor truncated".into()));
        }
        if &buf[0..4] != SEGMENT_MAGIC {
            return Err(RaftError::Storage("bad segment magic".into()));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != SEGMENT_VERSION {
            return Err(RaftError::Storage(format!(
                "unsupported segment version {}",
                version
            )));
        }
        Ok(Self {
            id: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            index: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            max_segment_size: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            max_entries: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            created: u64::from_le_bytes(buf[36..44].try_into().unwrap()),
            locked: buf[44] != 0,
        })
    }
}

/// File or memory region backing a segment.
enum Backing {
    Disk(File),
    Memory(Vec<u8>),
}

impl Backing {
    fn read_exact_at(&self, buf: &mut [u8], pos: u64) -> Result<()> {
        match self {
            #[cfg(unix)]
            Backing::Disk(file) => {
                use std::os::unix::fs::FileExt;
                file.read_exact_at(buf, pos)?;
                Ok(())
            }
            #[cfg(not(unix))]
            Backing::Disk(_) => Err(RaftError::Storage(
                "disk storage requires a unix platform".into(),
            )),
            Backing::Memory(bytes) => {
                let start = pos as usize;
                let end = start + buf.len();
                if end > bytes.len() {
                    return Err(RaftError::Storage("read past end of segment".into()));
                }
                buf.copy_from_slice(&bytes[start..end]);
                Ok(())
            }
        }
    }

    fn write_all_at(&mut self, buf: &[u8], pos: u64) -> Result<()> {
        match self {
            Backing::Disk(file) => {
                file.seek(SeekFrom::Start(pos))?;
                file.write_all(buf)?;
                Ok(())
            }
            Backing::Memory(bytes) => {
                let start = pos as usize;
                if bytes.len() < start {
                    bytes.resize(start, 0);
                }
                bytes.truncate(start);
                bytes.extend_from_slice(buf);
                Ok(())
            }
        }
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        match self {
            Backing::Disk(file) => {
                file.set_len(len)?;
                Ok(())
            }
            Backing::Memory(bytes) => {
                bytes.truncate(len as usize);
                Ok(())
            }
        }
    }

    fn len(&self) -> Result<u64> {
        match self {
            Backing::Disk(file) => Ok(file.metadata()?.len()),
            Backing::Memory(bytes) => Ok(bytes.len() as u64),
        }
    }

    fn sync(&self) -> Result<()> {
        if let Backing::Disk(file) = self {
            file.sync_data()?;
        }
        Ok(())
    }
}

/// A single segment plus its in-memory offset index.
pub struct Segment {
    descriptor: SegmentDescriptor,
    backing: Backing,
    path: Option<PathBuf>,
    /// Position of frame `i`; entry index = descriptor.index + i.
    offsets: Vec<u64>,
    /// Current append position.
    size: u64,
}

impl Segment {
    /// Creates a fresh segment under `directory` (or in memory).
    pub fn create(
        level: StorageLevel,
        directory: &Path,
        descriptor: SegmentDescriptor,
    ) -> Result<Self> {
        let (backing, path) = match level {
            StorageLevel::Disk => {
                let path = directory.join(segment_file_name(&descriptor));
                let file = OpenOptions::new()
                    .create_new(true)
                    .read(true)
                    .write(true)
                    .open(&path)?;
                (Backing::Disk(file), Some(path))
            }
            StorageLevel::Memory => (Backing::Memory(Vec::new()), None),
        };

        let mut segment = Self {
            descriptor,
            backing,
            path,
            offsets: Vec::new(),
            size: DESCRIPTOR_LEN,
        };
        segment.write_descriptor()?;
        Ok(segment)
    }

    /// Opens an existing segment file, rebuilding the offset index and
    /// truncating at the first corrupt frame.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut header = [0u8; DESCRIPTOR_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let descriptor = SegmentDescriptor::decode(&header)?;

        let mut segment = Self {
            descriptor,
            backing: Backing::Disk(file),
            path: Some(path.to_path_buf()),
            offsets: Vec::new(),
            size: DESCRIPTOR_LEN,
        };
        segment.rebuild_index()?;
        Ok(segment)
    }

    fn rebuild_index(&mut self) -> Result<()> {
        let file_len = self.backing.len()?;
        let mut pos = DESCRIPTOR_LEN;
        loop {
            if pos + FRAME_HEADER_LEN > file_len {
                break;
            }
            let mut header = [0u8; FRAME_HEADER_LEN as usize];
            self.backing.read_exact_at(&mut header, pos)?;
            let length = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let checksum = u32::from_le_bytes(header[4..8].try_into().unwrap());
            if length == 0 || u64::from(length) > self.descriptor.max_segment_size {
                break;
            }
            if pos + FRAME_HEADER_LEN + u64::from(length) > file_len {
                break;
            }
            let mut payload = vec![0u8; length as usize];
            self.backing.read_exact_at(&mut payload, pos + FRAME_HEADER_LEN)?;
            if frame_checksum(length, &payload) != checksum {
                break;
            }
            self.offsets.push(pos);
            pos += FRAME_HEADER_LEN + u64::from(length);
        }
        // Drop any torn tail.
        if pos < file_len {
            self.backing.set_len(pos)?;
        }
        self.size = pos;
        Ok(())
    }

    fn write_descriptor(&mut self) -> Result<()> {
        let encoded = self.descriptor.encode();
        self.backing.write_all_at(&encoded, 0)
    }

    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.descriptor
    }

    pub fn first_index(&self) -> LogIndex {
        self.descriptor.index
    }

    /// Last index held, or `first_index - 1` when empty.
    pub fn last_index(&self) -> LogIndex {
        self.descriptor.index + self.offsets.len() as u64 - 1
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether another entry of `payload_len` bytes would overflow the
    /// segment's limits.
    pub fn is_full(&self, payload_len: usize) -> bool {
        self.offsets.len() as u32 >= self.descriptor.max_entries
            || self.size + FRAME_HEADER_LEN + payload_len as u64
                > self.descriptor.max_segment_size
    }

    /// Appends an entry. The caller guarantees `indexed.index` is the
    /// next dense index.
    pub fn append(&mut self, indexed: &Indexed) -> Result<()> {
        let payload = serde_json::to_vec(indexed)?;
        self.append_encoded(indexed.index, &payload)
    }

    /// Appends a pre-encoded entry frame.
    pub fn append_encoded(&mut self, index: LogIndex, payload: &[u8]) -> Result<()> {
        debug_assert_eq!(index, self.descriptor.index + self.offsets.len() as u64);
        if self.descriptor.locked {
            return Err(RaftError::Storage("append to sealed segment".into()));
        }

        let length = payload.len() as u32;
        let checksum = frame_checksum(length, payload);

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(&checksum.to_le_bytes());
        frame.extend_from_slice(payload);

        self.backing.write_all_at(&frame, self.size)?;
        self.offsets.push(self.size);
        self.size += frame.len() as u64;
        Ok(())
    }

    /// Reads the entry at `index`, if this segment holds it.
    pub fn read(&self, index: LogIndex) -> Result<Option<Indexed>> {
        if index < self.descriptor.index {
            return Ok(None);
        }
        let slot = (index - self.descriptor.index) as usize;
        let Some(&pos) = self.offsets.get(slot) else {
            return Ok(None);
        };

        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        self.backing.read_exact_at(&mut header, pos)?;
        let length = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let checksum = u32::from_le_bytes(header[4..8].try_into().unwrap());

        let mut payload = vec![0u8; length as usize];
        self.backing.read_exact_at(&mut payload, pos + FRAME_HEADER_LEN)?;
        if frame_checksum(length, &payload) != checksum {
            return Err(RaftError::Storage(format!(
                "checksum mismatch at index {}",
                index
            )));
        }
        let indexed: Indexed = serde_json::from_slice(&payload)?;
        Ok(Some(indexed))
    }

    /// Removes all entries with index greater than `index`.
    pub fn truncate(&mut self, index: LogIndex) -> Result<()> {
        if index >= self.last_index() || self.is_empty() {
            return Ok(());
        }
        let keep = if index < self.descriptor.index {
            0
        } else {
            (index - self.descriptor.index + 1) as usize
        };
        let new_size = self
            .offsets
            .get(keep)
            .copied()
            .unwrap_or(self.size);
        self.offsets.truncate(keep);
        self.backing.set_len(new_size)?;
        self.size = new_size;
        self.backing.sync()?;
        Ok(())
    }

    /// Reopens a sealed segment for appends after a truncation made it
    /// the tail again.
    pub fn unseal(&mut self) -> Result<()> {
        if !self.descriptor.locked {
            return Ok(());
        }
        self.descriptor.locked = false;
        match &mut self.backing {
            Backing::Disk(file) => {
                let encoded = self.descriptor.encode();
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&encoded)?;
                file.sync_data()?;
            }
            Backing::Memory(bytes) => {
                bytes[0..DESCRIPTOR_LEN as usize].copy_from_slice(&self.descriptor.encode());
            }
        }
        Ok(())
    }

    /// Seals the segment; it becomes read-only.
    pub fn seal(&mut self) -> Result<()> {
        self.descriptor.locked = true;
        match &mut self.backing {
            Backing::Disk(file) => {
                let encoded = self.descriptor.encode();
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&encoded)?;
                file.sync_data()?;
            }
            Backing::Memory(bytes) => {
                bytes[0..DESCRIPTOR_LEN as usize].copy_from_slice(&self.descriptor.encode());
            }
        }
        Ok(())
    }

    /// Flushes buffered writes to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.backing.sync()
    }

    /// Deletes the backing file.
    pub fn delete(self) -> Result<()> {
        if let Some(path) = &self.path {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

fn frame_checksum(length: u32, payload: &[u8]) -> u32 {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(payload);
    crc32c(&buf)
}

pub(crate) fn segment_file_name(descriptor: &SegmentDescriptor) -> String {
    format!("{}-{}.log", descriptor.id, descriptor.index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entry::{EntryKind, LogEntry};
    use tempfile::TempDir;

    fn descriptor(id: u64, index: LogIndex) -> SegmentDescriptor {
        SegmentDescriptor {
            id,
            index,
            max_segment_size: 1024 * 1024,
            max_entries: 1024,
            created: 1,
            locked: false,
        }
    }

    fn command(index: LogIndex, term: u64) -> Indexed {
        Indexed::new(
            index,
            LogEntry::new(
                term,
                index * 10,
                EntryKind::Command {
                    session: 1,
                    sequence: index,
                    operation: format!("op-{}", index).into_bytes(),
                },
            ),
        )
    }

    #[test]
    fn test_descriptor_round_trip() {
        let descriptor = SegmentDescriptor {
            id: 3,
            index: 101,
            max_segment_size: 4096,
            max_entries: 16,
            created: 1_700_000_000_000,
            locked: true,
        };
        let decoded = SegmentDescriptor::decode(&descriptor.encode()).unwrap();
        assert_eq!(decoded, descriptor);
    }

    #[test]
    fn test_append_and_read_memory() {
        let dir = TempDir::new().unwrap();
        let mut segment =
            Segment::create(StorageLevel::Memory, dir.path(), descriptor(1, 1)).unwrap();

        for i in 1..=5 {
            segment.append(&command(i, 1)).unwrap();
        }
        assert_eq!(segment.first_index(), 1);
        assert_eq!(segment.last_index(), 5);

        let entry = segment.read(3).unwrap().unwrap();
        assert_eq!(entry.index, 3);
        assert!(segment.read(6).unwrap().is_none());
    }

    #[test]
    fn test_reopen_recovers_entries() {
        let dir = TempDir::new().unwrap();
        let path;
        {
            let mut segment =
                Segment::create(StorageLevel::Disk, dir.path(), descriptor(1, 1)).unwrap();
            for i in 1..=4 {
                segment.append(&command(i, 2)).unwrap();
            }
            segment.flush().unwrap();
            path = dir.path().join(segment_file_name(segment.descriptor()));
        }

        let segment = Segment::open(&path).unwrap();
        assert_eq!(segment.entry_count(), 4);
        assert_eq!(segment.read(2).unwrap().unwrap().term(), 2);
    }

    #[test]
    fn test_recovery_truncates_torn_frame() {
        let dir = TempDir::new().unwrap();
        let path;
        {
            let mut segment =
                Segment::create(StorageLevel::Disk, dir.path(), descriptor(1, 1)).unwrap();
            for i in 1..=3 {
                segment.append(&command(i, 1)).unwrap();
            }
            segment.flush().unwrap();
            path = dir.path().join(segment_file_name(segment.descriptor()));
        }

        // Corrupt the tail: chop the last frame in half.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();

        let segment = Segment::open(&path).unwrap();
        assert_eq!(segment.entry_count(), 2);
        assert_eq!(segment.last_index(), 2);
    }

    #[test]
    fn test_truncate_within_segment() {
        let dir = TempDir::new().unwrap();
        let mut segment =
            Segment::create(StorageLevel::Memory, dir.path(), descriptor(1, 10)).unwrap();
        for i in 10..=15 {
            segment.append(&command(i, 1)).unwrap();
        }

        segment.truncate(12).unwrap();
        assert_eq!(segment.last_index(), 12);
        assert!(segment.read(13).unwrap().is_none());

        // Appends continue from the truncation point.
        segment.append(&command(13, 2)).unwrap();
        assert_eq!(segment.read(13).unwrap().unwrap().term(), 2);
    }

    #[test]
    fn test_is_full_by_entry_count() {
        let dir = TempDir::new().unwrap();
        let mut descriptor = descriptor(1, 1);
        descriptor.max_entries = 2;
        let mut segment = Segment::create(StorageLevel::Memory, dir.path(), descriptor).unwrap();

        segment.append(&command(1, 1)).unwrap();
        assert!(!segment.is_full(10));
        segment.append(&command(2, 1)).unwrap();
        assert!(segment.is_full(10));
    }
}
