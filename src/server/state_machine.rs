//! The state machine executor.
//!
//! Applies committed entries in index order, driving the session
//! registry and the user state machine. Every replica runs the same
//! applier over the same committed prefix, so outcomes are identical
//! everywhere; only the leader routes them back to waiting clients.

use slog::Logger;
use tokio::sync::broadcast;

use serde::{Deserialize, Serialize};

use crate::error::RaftError;
use crate::protocol::message::Event;
use crate::server::session::{CachedResponse, SessionEvent, SessionRegistry};
use crate::storage::entry::{EntryKind, Indexed};
use crate::{LogIndex, SessionId};

/// Errors surfaced by user state machine code.
pub type StateMachineError = Box<dyn std::error::Error + Send + Sync>;

/// User-supplied replicated state machine.
///
/// Commands and queries are opaque bytes; the framework never inspects
/// them. `apply` runs exactly once per committed command per replica,
/// in commit order.
pub trait StateMachine: Send + 'static {
    /// Applies a committed command, returning the response bytes.
    fn apply(
        &mut self,
        operation: &[u8],
        context: &mut ApplyContext<'_>,
    ) -> Result<Vec<u8>, StateMachineError>;

    /// Executes a read-only query against current state.
    fn query(&self, operation: &[u8]) -> Result<Vec<u8>, StateMachineError>;

    /// Serializes the machine's state for a snapshot.
    fn snapshot(&self) -> Result<Vec<u8>, StateMachineError>;

    /// Replaces the machine's state from a snapshot.
    fn restore(&mut self, data: &[u8]) -> Result<(), StateMachineError>;
}

/// Context handed to [`StateMachine::apply`].
pub struct ApplyContext<'a> {
    /// Log index of the command being applied.
    pub index: LogIndex,
    /// Leader-chosen timestamp of the entry.
    pub timestamp: u64,
    /// Session that submitted the command.
    pub session: SessionId,
    registry: &'a mut SessionRegistry,
    published: &'a mut Vec<(SessionId, Event)>,
}

impl ApplyContext<'_> {
    /// Publishes an event to any open session. Events are buffered and
    /// pushed to the owning client by the leader; the per-session index
    /// is returned.
    pub fn publish(&mut self, session: SessionId, payload: Vec<u8>) -> Result<u64, RaftError> {
        let event = self.registry.publish(session, payload)?;
        let index = event.index;
        self.published.push((session, event));
        Ok(index)
    }
}

/// Outcome of applying one entry, routed to the waiting client future
/// on the leader.
#[derive(Debug)]
pub enum ApplyOutcome {
    None,
    SessionOpened(SessionId),
    SessionClosed(Result<(), RaftError>),
    KeepAlive(Result<(), RaftError>),
    Command(Result<CachedResponse, RaftError>),
    Query(Result<Vec<u8>, RaftError>),
    Configuration,
}

/// Serialized snapshot payload: applied state plus the session
/// registry. The applied entry's term travels with the image so an
/// installed follower can anchor its log boundary.
#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    applied_index: LogIndex,
    applied_term: u64,
    sessions: crate::server::session::SessionRegistrySnapshot,
    machine: Vec<u8>,
}

/// Drives committed entries through sessions and the user state
/// machine.
pub struct Applier {
    state_machine: Box<dyn StateMachine>,
    registry: SessionRegistry,
    applied_index: LogIndex,
    logger: Logger,
}

impl Applier {
    pub fn new(
        state_machine: Box<dyn StateMachine>,
        session_events: broadcast::Sender<SessionEvent>,
        logger: Logger,
    ) -> Self {
        Self {
            state_machine,
            registry: SessionRegistry::new(session_events),
            applied_index: 0,
            logger,
        }
    }

    pub fn applied_index(&self) -> LogIndex {
        self.applied_index
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Applies one committed entry. Entries must arrive in dense index
    /// order. Returns the outcome plus any events published during
    /// application.
    pub fn apply(&mut self, indexed: &Indexed) -> (ApplyOutcome, Vec<(SessionId, Event)>) {
        debug_assert_eq!(indexed.index, self.applied_index + 1);
        let timestamp = indexed.entry.timestamp;
        let mut published = Vec::new();

        // Deterministic expiration sweep: the entry's timestamp is the
        // only clock.
        let expired = self.registry.expire(timestamp);
        if !expired.is_empty() {
            slog::debug!(self.logger, "Sessions expired";
                "count" => expired.len(), "at" => timestamp);
        }

        let outcome = match &indexed.entry.kind {
            EntryKind::Initialize => ApplyOutcome::None,

            EntryKind::OpenSession { client, timeout_ms } => {
                self.registry
                    .open(indexed.index, client.clone(), *timeout_ms, timestamp);
                slog::info!(self.logger, "Session opened";
                    "session" => indexed.index, "client" => client.as_str());
                ApplyOutcome::SessionOpened(indexed.index)
            }

            EntryKind::CloseSession { session } => {
                ApplyOutcome::SessionClosed(self.registry.close(*session))
            }

            EntryKind::KeepAlive {
                session,
                command_sequence,
                event_index,
            } => ApplyOutcome::KeepAlive(self.registry.keep_alive(
                *session,
                *command_sequence,
                *event_index,
                timestamp,
            )),

            EntryKind::Command {
                session,
                sequence,
                operation,
            } => ApplyOutcome::Command(self.apply_command(
                indexed.index,
                timestamp,
                *session,
                *sequence,
                operation,
                &mut published,
            )),

            EntryKind::Query { session, operation } => {
                ApplyOutcome::Query(match self.registry.open_session(*session) {
                    Ok(_) => self
                        .state_machine
                        .query(operation)
                        .map_err(|e| RaftError::Application(e.to_string())),
                    Err(err) => Err(err),
                })
            }

            EntryKind::Configuration { .. } => ApplyOutcome::Configuration,
        };

        self.applied_index = indexed.index;
        (outcome, published)
    }

    fn apply_command(
        &mut self,
        index: LogIndex,
        timestamp: u64,
        session: SessionId,
        sequence: u64,
        operation: &[u8],
        published: &mut Vec<(SessionId, Event)>,
    ) -> Result<CachedResponse, RaftError> {
        let last_sequence = {
            let session_state = self.registry.open_session(session)?;
            session_state.last_sequence
        };

        // Exactly-once: a duplicate submission returns the cached
        // response without re-applying.
        if sequence <= last_sequence {
            return match self
                .registry
                .get(session)
                .and_then(|s| s.cached_response(sequence))
            {
                Some(cached) => Ok(cached.clone()),
                None => Err(RaftError::ProtocolError(format!(
                    "response for sequence {} already acknowledged",
                    sequence
                ))),
            };
        }
        if sequence != last_sequence + 1 {
            return Err(RaftError::ProtocolError(format!(
                "command sequence {} out of order, expected {}",
                sequence,
                last_sequence + 1
            )));
        }

        let result = {
            let mut context = ApplyContext {
                index,
                timestamp,
                session,
                registry: &mut self.registry,
                published,
            };
            self.state_machine.apply(operation, &mut context)
        };

        let cached = CachedResponse {
            index,
            event_index: self
                .registry
                .get(session)
                .map(|s| s.event_index())
                .unwrap_or(0),
            result: result.map_err(|e| e.to_string()),
        };
        self.registry.record_response(session, sequence, cached.clone());
        Ok(cached)
    }

    /// Executes a query outside the log (sequential or eventual mode).
    pub fn query(&mut self, session: SessionId, operation: &[u8]) -> Result<Vec<u8>, RaftError> {
        self.registry.open_session(session)?;
        self.state_machine
            .query(operation)
            .map_err(|e| RaftError::Application(e.to_string()))
    }

    /// Captures applied state plus sessions for a snapshot.
    /// `applied_term` is the term of the last applied entry.
    pub fn snapshot_with_term(&self, applied_term: u64) -> Result<Vec<u8>, RaftError> {
        let machine = self
            .state_machine
            .snapshot()
            .map_err(|e| RaftError::Storage(e.to_string()))?;
        let payload = SnapshotPayload {
            applied_index: self.applied_index,
            applied_term,
            sessions: self.registry.snapshot(),
            machine,
        };
        Ok(serde_json::to_vec(&payload)?)
    }

    /// Restores applied state plus sessions from a snapshot, returning
    /// the captured index and term.
    pub fn restore_with_term(&mut self, data: &[u8]) -> Result<(LogIndex, u64), RaftError> {
        let payload: SnapshotPayload = serde_json::from_slice(data)?;
        self.state_machine
            .restore(&payload.machine)
            .map_err(|e| RaftError::Storage(e.to_string()))?;
        self.registry.restore(payload.sessions);
        self.applied_index = payload.applied_index;
        Ok((payload.applied_index, payload.applied_term))
    }
}
