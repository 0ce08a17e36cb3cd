//! The replicated log: an ordered sequence of entries stored in
//! segments, with a commit marker, tailable readers, truncation, and
//! prefix compaction.
//!
//! Segment ranges partition the log densely: the first index of segment
//! `n + 1` is always the last index of segment `n` plus one, and only
//! the tail segment may be empty or unsealed.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{Storage, StorageLevel};
use crate::error::{RaftError, Result};
use crate::storage::entry::{Indexed, LogEntry};
use crate::storage::segment::{Segment, SegmentDescriptor};
use crate::{LogIndex, Term};

/// Read cursor mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// Read every entry present in the log.
    All,
    /// Read only entries at or below the commit index.
    Committed,
}

struct LogInner {
    level: StorageLevel,
    directory: PathBuf,
    max_segment_size: u64,
    max_segment_entries: u32,
    segments: Vec<Segment>,
    commit_index: LogIndex,
    next_segment_id: u64,
    /// Index and term of the entry just below the first retained one;
    /// updated by compaction and snapshot installation.
    compacted_index: LogIndex,
    compacted_term: Term,
}

impl LogInner {
    fn tail(&mut self) -> &mut Segment {
        self.segments.last_mut().expect("log always has a tail segment")
    }

    fn first_index(&self) -> LogIndex {
        self.segments.first().map(|s| s.first_index()).unwrap_or(1)
    }

    fn last_index(&self) -> LogIndex {
        self.segments.last().map(|s| s.last_index()).unwrap_or(0)
    }

    fn next_index(&self) -> LogIndex {
        self.last_index() + 1
    }

    fn segment_for(&self, index: LogIndex) -> Option<&Segment> {
        let slot = self.segments.partition_point(|s| s.first_index() <= index);
        if slot == 0 {
            return None;
        }
        Some(&self.segments[slot - 1])
    }

    fn read(&self, index: LogIndex) -> Result<Option<Indexed>> {
        match self.segment_for(index) {
            Some(segment) => segment.read(index),
            None => Ok(None),
        }
    }

    fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.compacted_index {
            return Ok(Some(self.compacted_term));
        }
        Ok(self.read(index)?.map(|e| e.term()))
    }

    fn roll_segment(&mut self) -> Result<()> {
        let next_index = self.next_index();
        self.tail().seal()?;
        let descriptor = SegmentDescriptor {
            id: self.next_segment_id,
            index: next_index,
            max_segment_size: self.max_segment_size,
            max_entries: self.max_segment_entries,
            created: unix_millis(),
            locked: false,
        };
        self.next_segment_id += 1;
        let segment = Segment::create(self.level, &self.directory, descriptor)?;
        self.segments.push(segment);
        Ok(())
    }

    fn append_encoded(&mut self, indexed: &Indexed) -> Result<()> {
        let payload = serde_json::to_vec(indexed)?;
        if self.tail().is_full(payload.len()) && !self.tail().is_empty() {
            self.roll_segment()?;
        }
        let index = indexed.index;
        self.tail().append_encoded(index, &payload)
    }

    fn fresh_segment(&mut self, first_index: LogIndex) -> Result<()> {
        let descriptor = SegmentDescriptor {
            id: self.next_segment_id,
            index: first_index,
            max_segment_size: self.max_segment_size,
            max_entries: self.max_segment_entries,
            created: unix_millis(),
            locked: false,
        };
        self.next_segment_id += 1;
        let segment = Segment::create(self.level, &self.directory, descriptor)?;
        self.segments.push(segment);
        Ok(())
    }
}

/// Handle to the segmented log. Cloning shares the underlying store;
/// readers and the writer synchronize on an internal lock so that
/// compaction cannot invalidate a cursor mid-read.
#[derive(Clone)]
pub struct RaftLog {
    inner: Arc<RwLock<LogInner>>,
}

impl RaftLog {
    /// Opens (or creates) the log described by `storage`. On disk, all
    /// existing segments are scanned and any torn tail frames dropped.
    pub fn open(storage: &Storage) -> Result<Self> {
        let mut segments = Vec::new();
        let mut next_segment_id = 1;

        if storage.level == StorageLevel::Disk {
            std::fs::create_dir_all(&storage.directory)?;
            let mut paths: Vec<PathBuf> = std::fs::read_dir(&storage.directory)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().map(|e| e == "log").unwrap_or(false))
                .collect();
            paths.sort();

            for path in paths {
                let segment = Segment::open(&path)?;
                next_segment_id = next_segment_id.max(segment.descriptor().id + 1);
                segments.push(segment);
            }
            segments.sort_by_key(|s| s.first_index());

            for pair in segments.windows(2) {
                if pair[1].first_index() != pair[0].last_index() + 1 {
                    return Err(RaftError::Storage(format!(
                        "segment gap between index {} and {}",
                        pair[0].last_index(),
                        pair[1].first_index()
                    )));
                }
            }
        }

        let compacted_index = segments
            .first()
            .map(|s| s.first_index() - 1)
            .unwrap_or(0);

        let mut inner = LogInner {
            level: storage.level,
            directory: storage.directory.clone(),
            max_segment_size: storage.max_segment_size,
            max_segment_entries: storage.max_segment_entries,
            segments,
            commit_index: 0,
            next_segment_id,
            compacted_index,
            compacted_term: 0,
        };
        if inner.segments.is_empty() {
            inner.fresh_segment(1)?;
        }
        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    /// Appends an entry on the leader path, assigning the next index.
    pub fn append(&self, entry: LogEntry) -> Result<Indexed> {
        let mut inner = self.inner.write().unwrap();
        let indexed = Indexed::new(inner.next_index(), entry);
        inner.append_encoded(&indexed)?;
        Ok(indexed)
    }

    /// Appends an already-indexed entry on the follower path. The index
    /// must equal the log's next index; callers truncate first when the
    /// logs diverge.
    pub fn append_indexed(&self, indexed: &Indexed) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if indexed.index != inner.next_index() {
            return Err(RaftError::ProtocolError(format!(
                "append at index {} but next index is {}",
                indexed.index,
                inner.next_index()
            )));
        }
        inner.append_encoded(indexed)
    }

    /// Removes all entries above `index`, deleting or shrinking
    /// segments as needed.
    pub fn truncate(&self, index: LogIndex) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if index >= inner.last_index() {
            return Ok(());
        }
        if index < inner.commit_index {
            return Err(RaftError::Storage(format!(
                "cannot truncate below commit index {}",
                inner.commit_index
            )));
        }

        while inner.segments.len() > 1 {
            let first = inner.segments.last().unwrap().first_index();
            if first <= index + 1 {
                break;
            }
            let segment = inner.segments.pop().unwrap();
            segment.delete()?;
        }
        inner.tail().truncate(index)?;
        // The surviving tail may have been sealed by a roll.
        inner.tail().unseal()?;
        Ok(())
    }

    /// Advances the commit marker. Regressions are ignored; the marker
    /// never exceeds the last index.
    pub fn commit(&self, index: LogIndex) {
        let mut inner = self.inner.write().unwrap();
        let clamped = index.min(inner.last_index());
        if clamped > inner.commit_index {
            inner.commit_index = clamped;
        }
    }

    /// Discards full segments whose last index is below `index`. Never
    /// splits a segment and never removes the tail.
    pub fn compact(&self, index: LogIndex) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        while inner.segments.len() > 1 && inner.segments[0].last_index() < index {
            let boundary = inner.segments[0].last_index();
            let boundary_term = inner.segments[0]
                .read(boundary)?
                .map(|e| e.term())
                .unwrap_or(inner.compacted_term);
            let segment = inner.segments.remove(0);
            segment
                .delete()
                .map_err(|e| RaftError::Compaction(e.to_string()))?;
            inner.compacted_index = boundary;
            inner.compacted_term = boundary_term;
        }
        Ok(())
    }

    /// Discards the entire log up to and including `index` after a
    /// snapshot installation, restarting the log at `index + 1`.
    pub fn reset(&self, index: LogIndex, term: Term) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        while let Some(segment) = inner.segments.pop() {
            segment.delete()?;
        }
        inner.fresh_segment(index + 1)?;
        inner.compacted_index = index;
        inner.compacted_term = term;
        if index > inner.commit_index {
            inner.commit_index = index;
        }
        Ok(())
    }

    /// Re-anchors the compaction boundary after recovering applied
    /// state from a snapshot, so prev-entry term checks at the boundary
    /// resolve correctly.
    pub fn restore_boundary(&self, index: LogIndex, term: Term) {
        let mut inner = self.inner.write().unwrap();
        if inner.compacted_index == index {
            inner.compacted_term = term;
        }
        if index > inner.commit_index {
            inner.commit_index = index.min(inner.last_index());
        }
    }

    /// Flushes the tail segment to stable storage.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.read().unwrap();
        match inner.segments.last() {
            Some(tail) => tail.flush(),
            None => Ok(()),
        }
    }

    pub fn first_index(&self) -> LogIndex {
        self.inner.read().unwrap().first_index()
    }

    pub fn last_index(&self) -> LogIndex {
        self.inner.read().unwrap().last_index()
    }

    pub fn next_index(&self) -> LogIndex {
        self.inner.read().unwrap().next_index()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.inner.read().unwrap().commit_index
    }

    /// Index compacted away by the latest snapshot, 0 if none.
    pub fn compacted_index(&self) -> LogIndex {
        self.inner.read().unwrap().compacted_index
    }

    pub fn read(&self, index: LogIndex) -> Result<Option<Indexed>> {
        self.inner.read().unwrap().read(index)
    }

    /// Term of the entry at `index`; resolves index 0 and the latest
    /// compaction boundary without reading the log.
    pub fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        self.inner.read().unwrap().term_at(index)
    }

    /// Term of the last entry (or the compaction boundary for an empty
    /// suffix).
    pub fn last_term(&self) -> Result<Term> {
        let inner = self.inner.read().unwrap();
        Ok(inner.term_at(inner.last_index())?.unwrap_or(0))
    }

    /// Reads up to `max` consecutive entries starting at `from`.
    pub fn entries_from(&self, from: LogIndex, max: usize) -> Result<Vec<Indexed>> {
        let inner = self.inner.read().unwrap();
        let mut entries = Vec::new();
        let mut index = from;
        while index <= inner.last_index() && entries.len() < max {
            match inner.read(index)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
            index += 1;
        }
        Ok(entries)
    }

    /// Opens a cursor at `from`.
    pub fn reader(&self, from: LogIndex, mode: ReadMode) -> LogReader {
        LogReader {
            inner: Arc::clone(&self.inner),
            next: from,
            mode,
        }
    }
}

/// Cursor over the log. Stays valid across compaction: if the prefix it
/// points at is compacted away, the cursor skips forward to the first
/// retained entry.
pub struct LogReader {
    inner: Arc<RwLock<LogInner>>,
    next: LogIndex,
    mode: ReadMode,
}

impl LogReader {
    pub fn next_index(&self) -> LogIndex {
        self.next
    }

    /// Whether a subsequent [`LogReader::next`] call will yield an
    /// entry. In committed mode this clamps to the commit index.
    pub fn has_next(&self) -> bool {
        let inner = self.inner.read().unwrap();
        let next = self.next.max(inner.first_index());
        match self.mode {
            ReadMode::All => next <= inner.last_index(),
            ReadMode::Committed => {
                next <= inner.commit_index && next <= inner.last_index()
            }
        }
    }

    /// Reads the next entry, advancing the cursor.
    pub fn next(&mut self) -> Result<Option<Indexed>> {
        let inner = self.inner.read().unwrap();
        let next = self.next.max(inner.first_index());
        let bound = match self.mode {
            ReadMode::All => inner.last_index(),
            ReadMode::Committed => inner.commit_index.min(inner.last_index()),
        };
        if next > bound {
            return Ok(None);
        }
        let entry = inner.read(next)?;
        if entry.is_some() {
            self.next = next + 1;
        }
        Ok(entry)
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entry::EntryKind;
    use tempfile::TempDir;

    fn entry(term: Term) -> LogEntry {
        LogEntry::new(
            term,
            0,
            EntryKind::Command {
                session: 1,
                sequence: 0,
                operation: vec![1, 2, 3],
            },
        )
    }

    fn memory_log(max_entries: u32) -> RaftLog {
        let storage = Storage::memory().with_max_segment_entries(max_entries);
        RaftLog::open(&storage).unwrap()
    }

    #[test]
    fn test_append_assigns_dense_indexes() {
        let log = memory_log(1024);
        for expected in 1..=10u64 {
            let indexed = log.append(entry(1)).unwrap();
            assert_eq!(indexed.index, expected);
        }
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.next_index(), 11);
    }

    #[test]
    fn test_rolls_segments_and_keeps_partition() {
        let log = memory_log(3);
        for _ in 0..10 {
            log.append(entry(1)).unwrap();
        }
        let inner = log.inner.read().unwrap();
        assert!(inner.segments.len() > 1);
        for pair in inner.segments.windows(2) {
            assert_eq!(pair[1].first_index(), pair[0].last_index() + 1);
        }
    }

    #[test]
    fn test_commit_is_monotonic_and_clamped() {
        let log = memory_log(1024);
        for _ in 0..5 {
            log.append(entry(1)).unwrap();
        }
        log.commit(3);
        assert_eq!(log.commit_index(), 3);
        log.commit(2);
        assert_eq!(log.commit_index(), 3);
        log.commit(100);
        assert_eq!(log.commit_index(), 5);
    }

    #[test]
    fn test_committed_reader_clamps() {
        let log = memory_log(1024);
        for _ in 0..5 {
            log.append(entry(1)).unwrap();
        }
        log.commit(2);

        let mut reader = log.reader(1, ReadMode::Committed);
        assert!(reader.has_next());
        assert_eq!(reader.next().unwrap().unwrap().index, 1);
        assert_eq!(reader.next().unwrap().unwrap().index, 2);
        assert!(!reader.has_next());
        assert!(reader.next().unwrap().is_none());

        log.commit(4);
        assert!(reader.has_next());
        assert_eq!(reader.next().unwrap().unwrap().index, 3);
    }

    #[test]
    fn test_truncate_across_segments() {
        let log = memory_log(2);
        for _ in 0..8 {
            log.append(entry(1)).unwrap();
        }
        log.truncate(3).unwrap();
        assert_eq!(log.last_index(), 3);

        let indexed = log.append(entry(2)).unwrap();
        assert_eq!(indexed.index, 4);
        assert_eq!(log.term_at(4).unwrap(), Some(2));
    }

    #[test]
    fn test_truncate_below_commit_rejected() {
        let log = memory_log(1024);
        for _ in 0..5 {
            log.append(entry(1)).unwrap();
        }
        log.commit(4);
        assert!(log.truncate(2).is_err());
    }

    #[test]
    fn test_compact_discards_only_full_segments() {
        let log = memory_log(2);
        for _ in 0..9 {
            log.append(entry(1)).unwrap();
        }
        log.commit(9);
        log.compact(5).unwrap();

        // Segments covering 1..=4 are gone; the segment holding 5
        // survives because compaction never splits.
        assert!(log.first_index() <= 5);
        assert!(log.first_index() > 1);
        assert_eq!(log.compacted_index(), log.first_index() - 1);
        assert!(log.read(log.first_index()).unwrap().is_some());
        assert!(log.read(1).unwrap().is_none());
    }

    #[test]
    fn test_reset_after_install() {
        let log = memory_log(1024);
        for _ in 0..5 {
            log.append(entry(1)).unwrap();
        }
        log.reset(20, 3).unwrap();
        assert_eq!(log.last_index(), 20);
        assert_eq!(log.next_index(), 21);
        assert_eq!(log.term_at(20).unwrap(), Some(3));
        assert_eq!(log.commit_index(), 20);

        let indexed = log.append(entry(4)).unwrap();
        assert_eq!(indexed.index, 21);
    }

    #[test]
    fn test_disk_log_reopen() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::disk(dir.path()).with_max_segment_entries(3);
        {
            let log = RaftLog::open(&storage).unwrap();
            for _ in 0..7 {
                log.append(entry(2)).unwrap();
            }
            log.flush().unwrap();
        }

        let log = RaftLog::open(&storage).unwrap();
        assert_eq!(log.last_index(), 7);
        assert_eq!(log.term_at(7).unwrap(), Some(2));
        let indexed = log.append(entry(3)).unwrap();
        assert_eq!(indexed.index, 8);
    }

    #[test]
    fn test_log_matching_round_trip() {
        let log = memory_log(4);
        let payloads: Vec<Indexed> = (0..6).map(|_| log.append(entry(1)).unwrap()).collect();
        for expected in &payloads {
            let read = log.read(expected.index).unwrap().unwrap();
            assert_eq!(&read, expected);
        }
    }
}
