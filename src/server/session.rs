//! Server-side sessions.
//!
//! All session state is derived from applied log entries, so every
//! replica holds an identical registry. Time never comes from the wall
//! clock here: expiration uses the timestamps the leader recorded in
//! the log, which makes it deterministic across replicas.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::RaftError;
use crate::protocol::message::Event;
use crate::{LogIndex, SessionId};

/// Session lifecycle states. `Expired` and `Closed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Open,
    Expired,
    Closed,
}

/// Lifecycle notifications, published exactly once per transition per
/// replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Opened(SessionId),
    Expired(SessionId),
    Closed(SessionId),
}

/// A cached command response, replayed byte-for-byte on duplicates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedResponse {
    pub index: LogIndex,
    pub event_index: u64,
    pub result: Result<Vec<u8>, String>,
}

/// One client session as every replica sees it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSession {
    pub id: SessionId,
    pub client: String,
    pub timeout_ms: u64,
    pub state: SessionState,
    /// Timestamp of the last entry that renewed the lease.
    pub last_heartbeat: u64,
    /// Highest command sequence applied for this session.
    pub last_sequence: u64,
    /// Responses not yet acknowledged via keep-alive, keyed by
    /// sequence.
    responses: BTreeMap<u64, CachedResponse>,
    /// Events not yet acknowledged via keep-alive.
    events: VecDeque<Event>,
    /// Index assigned to the next published event.
    next_event_index: u64,
}

impl ServerSession {
    fn new(id: SessionId, client: String, timeout_ms: u64, timestamp: u64) -> Self {
        Self {
            id,
            client,
            timeout_ms,
            state: SessionState::Open,
            last_heartbeat: timestamp,
            last_sequence: 0,
            responses: BTreeMap::new(),
            events: VecDeque::new(),
            next_event_index: 1,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Highest event index published to this session.
    pub fn event_index(&self) -> u64 {
        self.next_event_index - 1
    }

    pub fn cached_response(&self, sequence: u64) -> Option<&CachedResponse> {
        self.responses.get(&sequence)
    }

    /// Events above `from_index`, oldest first.
    pub fn events_after(&self, from_index: u64) -> Vec<Event> {
        self.events
            .iter()
            .filter(|e| e.index > from_index)
            .cloned()
            .collect()
    }
}

/// The registry owning every session on this replica. Resource-scoped
/// views hold only a session id plus a reference here; the registry is
/// the sole owner of session state.
pub struct SessionRegistry {
    sessions: HashMap<SessionId, ServerSession>,
    events_tx: broadcast::Sender<SessionEvent>,
}

/// Serializable image of the registry, embedded in snapshots so that
/// installed followers converge on session state too.
#[derive(Serialize, Deserialize)]
pub struct SessionRegistrySnapshot {
    sessions: Vec<ServerSession>,
}

impl SessionRegistry {
    pub fn new(events_tx: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            sessions: HashMap::new(),
            events_tx,
        }
    }

    pub fn get(&self, id: SessionId) -> Option<&ServerSession> {
        self.sessions.get(&id)
    }

    /// Looks up an open session, mapping missing and terminal states to
    /// the protocol errors clients see.
    pub fn open_session(&mut self, id: SessionId) -> Result<&mut ServerSession, RaftError> {
        match self.sessions.get_mut(&id) {
            None => Err(RaftError::UnknownSession(id)),
            Some(session) if session.is_open() => Ok(session),
            Some(_) => Err(RaftError::ClosedSession(id)),
        }
    }

    /// Applies an `open-session` entry. The session id is the entry's
    /// log index, which is unique cluster-wide.
    pub fn open(&mut self, id: SessionId, client: String, timeout_ms: u64, timestamp: u64) {
        let session = ServerSession::new(id, client, timeout_ms, timestamp);
        self.sessions.insert(id, session);
        let _ = self.events_tx.send(SessionEvent::Opened(id));
    }

    /// Applies a `keep-alive` entry: renews the lease and evicts
    /// acknowledged responses and events.
    pub fn keep_alive(
        &mut self,
        id: SessionId,
        command_sequence: u64,
        event_index: u64,
        timestamp: u64,
    ) -> Result<(), RaftError> {
        let session = self.open_session(id)?;
        session.last_heartbeat = timestamp;
        session.responses = session.responses.split_off(&(command_sequence + 1));
        while session
            .events
            .front()
            .map(|e| e.index <= event_index)
            .unwrap_or(false)
        {
            session.events.pop_front();
        }
        Ok(())
    }

    /// Applies a `close-session` entry.
    pub fn close(&mut self, id: SessionId) -> Result<(), RaftError> {
        self.open_session(id)?;
        if let Some(session) = self.sessions.get_mut(&id) {
            session.state = SessionState::Closed;
        }
        let _ = self.events_tx.send(SessionEvent::Closed(id));
        Ok(())
    }

    /// Expires sessions whose lease lapsed at `now` (an entry
    /// timestamp). Runs on every applied entry.
    pub fn expire(&mut self, now: u64) -> Vec<SessionId> {
        let mut expired = Vec::new();
        for session in self.sessions.values_mut() {
            if session.is_open() && session.last_heartbeat + session.timeout_ms < now {
                session.state = SessionState::Expired;
                expired.push(session.id);
            }
        }
        for &id in &expired {
            let _ = self.events_tx.send(SessionEvent::Expired(id));
        }
        expired
    }

    /// Caches a command response under its sequence and advances the
    /// session's sequence counter.
    pub fn record_response(
        &mut self,
        id: SessionId,
        sequence: u64,
        response: CachedResponse,
    ) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.last_sequence = sequence;
            session.responses.insert(sequence, response);
        }
    }

    /// Buffers an event for a session, assigning the next event index.
    pub fn publish(&mut self, id: SessionId, payload: Vec<u8>) -> Result<Event, RaftError> {
        let session = self.open_session(id)?;
        let event = Event {
            index: session.next_event_index,
            payload,
        };
        session.next_event_index += 1;
        session.events.push_back(event.clone());
        Ok(event)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Captures the registry for a snapshot.
    pub fn snapshot(&self) -> SessionRegistrySnapshot {
        let mut sessions: Vec<ServerSession> = self.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        SessionRegistrySnapshot { sessions }
    }

    /// Replaces the registry from a snapshot image.
    pub fn restore(&mut self, snapshot: SessionRegistrySnapshot) {
        self.sessions = snapshot
            .sessions
            .into_iter()
            .map(|s| (s.id, s))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (SessionRegistry, broadcast::Receiver<SessionEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (SessionRegistry::new(tx), rx)
    }

    #[test]
    fn test_open_and_lookup() {
        let (mut registry, mut rx) = registry();
        registry.open(5, "client-a".into(), 1000, 100);

        assert!(registry.open_session(5).is_ok());
        assert!(matches!(
            registry.open_session(6),
            Err(RaftError::UnknownSession(6))
        ));
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Opened(5));
    }

    #[test]
    fn test_expiration_is_timestamp_driven() {
        let (mut registry, mut rx) = registry();
        registry.open(5, "client-a".into(), 1000, 100);

        // Inside the lease: nothing expires.
        assert!(registry.expire(1100).is_empty());

        // Lease renewed at 1000; expiry moves out.
        registry.keep_alive(5, 0, 0, 1000).unwrap();
        assert!(registry.expire(1900).is_empty());

        let expired = registry.expire(2001);
        assert_eq!(expired, vec![5]);
        assert!(matches!(
            registry.open_session(5),
            Err(RaftError::ClosedSession(5))
        ));

        // The transition fires exactly once.
        assert!(registry.expire(3000).is_empty());
        let events: Vec<SessionEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            events,
            vec![SessionEvent::Opened(5), SessionEvent::Expired(5)]
        );
    }

    #[test]
    fn test_response_cache_eviction() {
        let (mut registry, _rx) = registry();
        registry.open(1, "c".into(), 1000, 0);

        for sequence in 1..=4 {
            registry.record_response(
                1,
                sequence,
                CachedResponse {
                    index: sequence + 10,
                    event_index: 0,
                    result: Ok(vec![sequence as u8]),
                },
            );
        }
        let session = registry.get(1).unwrap();
        assert!(session.cached_response(2).is_some());

        // Client acknowledged everything up to sequence 3.
        registry.keep_alive(1, 3, 0, 10).unwrap();
        let session = registry.get(1).unwrap();
        assert!(session.cached_response(3).is_none());
        assert!(session.cached_response(4).is_some());
    }

    #[test]
    fn test_event_indexes_and_eviction() {
        let (mut registry, _rx) = registry();
        registry.open(1, "c".into(), 1000, 0);

        let first = registry.publish(1, b"a".to_vec()).unwrap();
        let second = registry.publish(1, b"b".to_vec()).unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(second.index, 2);

        let session = registry.get(1).unwrap();
        assert_eq!(session.event_index(), 2);
        assert_eq!(session.events_after(0).len(), 2);

        registry.keep_alive(1, 0, 1, 10).unwrap();
        let session = registry.get(1).unwrap();
        assert_eq!(session.events_after(0), vec![second]);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (mut restored, _rx2) = registry();
        let (mut registry, _rx) = registry();
        registry.open(1, "a".into(), 500, 0);
        registry.open(2, "b".into(), 900, 5);
        registry.publish(2, b"evt".to_vec()).unwrap();
        registry
            .record_response(
                1,
                1,
                CachedResponse {
                    index: 3,
                    event_index: 0,
                    result: Ok(b"ok".to_vec()),
                },
            );

        let image = serde_json::to_vec(&registry.snapshot()).unwrap();
        let decoded: SessionRegistrySnapshot = serde_json::from_slice(&image).unwrap();

        restored.restore(decoded);
        assert_eq!(restored.get(2).unwrap().event_index(), 1);
        assert!(restored.get(1).unwrap().cached_response(1).is_some());
    }
}
