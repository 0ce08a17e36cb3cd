//! Replicated log entries.

use serde::{Deserialize, Serialize};

use crate::cluster::Member;
use crate::{LogIndex, SessionId, Term};

/// The payload variants a log entry can carry.
///
/// Session and configuration changes travel through the same log as
/// user commands so that every replica derives identical session and
/// membership state from the committed prefix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryKind {
    /// No-op appended by a freshly elected leader. Committing it allows
    /// entries from prior terms to commit as well.
    Initialize,

    /// A state machine command bound to a session.
    Command {
        session: SessionId,
        sequence: u64,
        operation: Vec<u8>,
    },

    /// A linearizable query routed through the log.
    Query {
        session: SessionId,
        operation: Vec<u8>,
    },

    /// Opens a session; the session id becomes the entry's log index.
    OpenSession { client: String, timeout_ms: u64 },

    /// Closes a session explicitly.
    CloseSession { session: SessionId },

    /// Renews a session lease and acknowledges delivered responses and
    /// events.
    KeepAlive {
        session: SessionId,
        command_sequence: u64,
        event_index: u64,
    },

    /// Replaces the cluster configuration.
    Configuration { members: Vec<Member> },
}

/// An entry as proposed: term, leader-chosen timestamp, payload.
///
/// The timestamp is the deterministic time source for session
/// expiration; replicas never consult the wall clock while applying.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub timestamp: u64,
    pub kind: EntryKind,
}

impl LogEntry {
    pub fn new(term: Term, timestamp: u64, kind: EntryKind) -> Self {
        Self {
            term,
            timestamp,
            kind,
        }
    }
}

/// An entry bound to its log index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Indexed {
    pub index: LogIndex,
    pub entry: LogEntry,
}

impl Indexed {
    pub fn new(index: LogIndex, entry: LogEntry) -> Self {
        Self { index, entry }
    }

    pub fn term(&self) -> Term {
        self.entry.term
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_round_trip() {
        let entry = Indexed::new(
            7,
            LogEntry::new(
                3,
                1_700_000_000_000,
                EntryKind::Command {
                    session: 2,
                    sequence: 9,
                    operation: b"put k v".to_vec(),
                },
            ),
        );

        let bytes = serde_json::to_vec(&entry).unwrap();
        let decoded: Indexed = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_configuration_entry_round_trip() {
        let entry = LogEntry::new(
            1,
            42,
            EntryKind::Configuration {
                members: vec![Member::active(1), Member::passive(2)],
            },
        );
        let bytes = serde_json::to_vec(&entry).unwrap();
        let decoded: LogEntry = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }
}
