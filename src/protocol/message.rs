//! Protocol request and response types.
//!
//! Every request kind is constructed through a builder whose `build()`
//! validates the fields; handlers can therefore assume structurally
//! sound messages and reply with `ProtocolError` only for semantic
//! violations.

use serde::{Deserialize, Serialize};

use crate::cluster::Member;
use crate::error::{RaftError, Result};
use crate::storage::entry::Indexed;
use crate::{LogIndex, MemberId, SessionId, Term};

/// Query consistency modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Executed on the leader through the log; observes all prior
    /// commands in real-time order.
    Linearizable,
    /// Executed on the leader against applied state.
    Sequential,
    /// Executed on any member; may observe stale state.
    Eventual,
}

// ---------------------------------------------------------------------
// Server-to-server protocol
// ---------------------------------------------------------------------

/// Log replication request; an empty `entries` list is a heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: Term,
    pub leader: MemberId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<Indexed>,
    pub commit_index: LogIndex,
}

impl AppendRequest {
    pub fn builder() -> AppendRequestBuilder {
        AppendRequestBuilder::default()
    }
}

#[derive(Default)]
pub struct AppendRequestBuilder {
    term: Option<Term>,
    leader: Option<MemberId>,
    prev_log_index: LogIndex,
    prev_log_term: Term,
    entries: Vec<Indexed>,
    commit_index: LogIndex,
}

impl AppendRequestBuilder {
    pub fn term(mut self, term: Term) -> Self {
        self.term = Some(term);
        self
    }

    pub fn leader(mut self, leader: MemberId) -> Self {
        self.leader = Some(leader);
        self
    }

    pub fn prev_log(mut self, index: LogIndex, term: Term) -> Self {
        self.prev_log_index = index;
        self.prev_log_term = term;
        self
    }

    pub fn entries(mut self, entries: Vec<Indexed>) -> Self {
        self.entries = entries;
        self
    }

    pub fn commit_index(mut self, index: LogIndex) -> Self {
        self.commit_index = index;
        self
    }

    pub fn build(self) -> Result<AppendRequest> {
        let term = self
            .term
            .ok_or_else(|| RaftError::ProtocolError("append request missing term".into()))?;
        let leader = self
            .leader
            .ok_or_else(|| RaftError::ProtocolError("append request missing leader".into()))?;
        if let Some(first) = self.entries.first() {
            if first.index != self.prev_log_index + 1 {
                return Err(RaftError::ProtocolError(
                    "append entries do not follow prev_log_index".into(),
                ));
            }
        }
        Ok(AppendRequest {
            term,
            leader,
            prev_log_index: self.prev_log_index,
            prev_log_term: self.prev_log_term,
            entries: self.entries,
            commit_index: self.commit_index,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: Term,
    pub succeeded: bool,
    /// On success the follower's last index; on rejection the highest
    /// index the follower could match, as a back-off hint.
    pub log_index: LogIndex,
}

/// Election vote request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: MemberId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

impl VoteRequest {
    pub fn builder() -> VoteRequestBuilder {
        VoteRequestBuilder::default()
    }
}

#[derive(Default)]
pub struct VoteRequestBuilder {
    term: Option<Term>,
    candidate: Option<MemberId>,
    last_log_index: LogIndex,
    last_log_term: Term,
}

impl VoteRequestBuilder {
    pub fn term(mut self, term: Term) -> Self {
        self.term = Some(term);
        self
    }

    pub fn candidate(mut self, candidate: MemberId) -> Self {
        self.candidate = Some(candidate);
        self
    }

    pub fn last_log(mut self, index: LogIndex, term: Term) -> Self {
        self.last_log_index = index;
        self.last_log_term = term;
        self
    }

    pub fn build(self) -> Result<VoteRequest> {
        Ok(VoteRequest {
            term: self
                .term
                .ok_or_else(|| RaftError::ProtocolError("vote request missing term".into()))?,
            candidate: self.candidate.ok_or_else(|| {
                RaftError::ProtocolError("vote request missing candidate".into())
            })?,
            last_log_index: self.last_log_index,
            last_log_term: self.last_log_term,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub voted: bool,
}

/// Pre-vote probe sent before incrementing the term.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollRequest {
    pub term: Term,
    pub candidate: MemberId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

impl PollRequest {
    pub fn builder() -> PollRequestBuilder {
        PollRequestBuilder::default()
    }
}

#[derive(Default)]
pub struct PollRequestBuilder {
    term: Option<Term>,
    candidate: Option<MemberId>,
    last_log_index: LogIndex,
    last_log_term: Term,
}

impl PollRequestBuilder {
    pub fn term(mut self, term: Term) -> Self {
        self.term = Some(term);
        self
    }

    pub fn candidate(mut self, candidate: MemberId) -> Self {
        self.candidate = Some(candidate);
        self
    }

    pub fn last_log(mut self, index: LogIndex, term: Term) -> Self {
        self.last_log_index = index;
        self.last_log_term = term;
        self
    }

    pub fn build(self) -> Result<PollRequest> {
        Ok(PollRequest {
            term: self
                .term
                .ok_or_else(|| RaftError::ProtocolError("poll request missing term".into()))?,
            candidate: self.candidate.ok_or_else(|| {
                RaftError::ProtocolError("poll request missing candidate".into())
            })?,
            last_log_index: self.last_log_index,
            last_log_term: self.last_log_term,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub term: Term,
    pub accepted: bool,
}

/// One chunk of a snapshot installation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallRequest {
    pub term: Term,
    pub leader: MemberId,
    pub snapshot_id: u64,
    pub snapshot_index: LogIndex,
    pub snapshot_timestamp: u64,
    pub offset: u32,
    pub data: Vec<u8>,
    pub complete: bool,
}

impl InstallRequest {
    pub fn builder() -> InstallRequestBuilder {
        InstallRequestBuilder::default()
    }
}

#[derive(Default)]
pub struct InstallRequestBuilder {
    term: Option<Term>,
    leader: Option<MemberId>,
    snapshot_id: Option<u64>,
    snapshot_index: Option<LogIndex>,
    snapshot_timestamp: u64,
    offset: u32,
    data: Vec<u8>,
    complete: bool,
}

impl InstallRequestBuilder {
    pub fn term(mut self, term: Term) -> Self {
        self.term = Some(term);
        self
    }

    pub fn leader(mut self, leader: MemberId) -> Self {
        self.leader = Some(leader);
        self
    }

    pub fn snapshot(mut self, id: u64, index: LogIndex, timestamp: u64) -> Self {
        self.snapshot_id = Some(id);
        self.snapshot_index = Some(index);
        self.snapshot_timestamp = timestamp;
        self
    }

    pub fn chunk(mut self, offset: u32, data: Vec<u8>, complete: bool) -> Self {
        self.offset = offset;
        self.data = data;
        self.complete = complete;
        self
    }

    pub fn build(self) -> Result<InstallRequest> {
        Ok(InstallRequest {
            term: self
                .term
                .ok_or_else(|| RaftError::ProtocolError("install request missing term".into()))?,
            leader: self.leader.ok_or_else(|| {
                RaftError::ProtocolError("install request missing leader".into())
            })?,
            snapshot_id: self.snapshot_id.ok_or_else(|| {
                RaftError::ProtocolError("install request missing snapshot id".into())
            })?,
            snapshot_index: self.snapshot_index.ok_or_else(|| {
                RaftError::ProtocolError("install request missing snapshot index".into())
            })?,
            snapshot_timestamp: self.snapshot_timestamp,
            offset: self.offset,
            data: self.data,
            complete: self.complete,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallResponse {
    pub term: Term,
    pub succeeded: bool,
    /// The offset the follower expects next; lets the leader resync
    /// after a rejected chunk.
    pub next_offset: u32,
}

// ---------------------------------------------------------------------
// Client protocol
// ---------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    pub client: String,
    pub timeout_ms: u64,
}

impl OpenSessionRequest {
    pub fn builder() -> OpenSessionRequestBuilder {
        OpenSessionRequestBuilder::default()
    }
}

#[derive(Default)]
pub struct OpenSessionRequestBuilder {
    client: Option<String>,
    timeout_ms: Option<u64>,
}

impl OpenSessionRequestBuilder {
    pub fn client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn build(self) -> Result<OpenSessionRequest> {
        let client = self.client.ok_or_else(|| {
            RaftError::ProtocolError("open session request missing client".into())
        })?;
        let timeout_ms = self.timeout_ms.ok_or_else(|| {
            RaftError::ProtocolError("open session request missing timeout".into())
        })?;
        if timeout_ms == 0 {
            return Err(RaftError::ProtocolError(
                "session timeout must be positive".into(),
            ));
        }
        Ok(OpenSessionRequest { client, timeout_ms })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub session: SessionId,
    pub timeout_ms: u64,
    pub leader: Option<MemberId>,
    pub members: Vec<MemberId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub session: SessionId,
}

impl CloseSessionRequest {
    pub fn new(session: SessionId) -> Self {
        Self { session }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseSessionResponse {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session: SessionId,
    /// Highest command sequence whose response the client received.
    pub command_sequence: u64,
    /// Highest event index the client received.
    pub event_index: u64,
}

impl KeepAliveRequest {
    pub fn builder() -> KeepAliveRequestBuilder {
        KeepAliveRequestBuilder::default()
    }
}

#[derive(Default)]
pub struct KeepAliveRequestBuilder {
    session: Option<SessionId>,
    command_sequence: u64,
    event_index: u64,
}

impl KeepAliveRequestBuilder {
    pub fn session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn command_sequence(mut self, sequence: u64) -> Self {
        self.command_sequence = sequence;
        self
    }

    pub fn event_index(mut self, index: u64) -> Self {
        self.event_index = index;
        self
    }

    pub fn build(self) -> Result<KeepAliveRequest> {
        Ok(KeepAliveRequest {
            session: self.session.ok_or_else(|| {
                RaftError::ProtocolError("keep alive request missing session".into())
            })?,
            command_sequence: self.command_sequence,
            event_index: self.event_index,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub leader: Option<MemberId>,
    pub members: Vec<MemberId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandRequest {
    pub session: SessionId,
    pub sequence: u64,
    pub operation: Vec<u8>,
}

impl CommandRequest {
    pub fn builder() -> CommandRequestBuilder {
        CommandRequestBuilder::default()
    }
}

#[derive(Default)]
pub struct CommandRequestBuilder {
    session: Option<SessionId>,
    sequence: Option<u64>,
    operation: Vec<u8>,
}

impl CommandRequestBuilder {
    pub fn session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn operation(mut self, operation: Vec<u8>) -> Self {
        self.operation = operation;
        self
    }

    pub fn build(self) -> Result<CommandRequest> {
        Ok(CommandRequest {
            session: self.session.ok_or_else(|| {
                RaftError::ProtocolError("command request missing session".into())
            })?,
            sequence: self.sequence.ok_or_else(|| {
                RaftError::ProtocolError("command request missing sequence".into())
            })?,
            operation: self.operation,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Log index the command committed at.
    pub index: LogIndex,
    /// Highest event index published to this session so far.
    pub event_index: u64,
    pub result: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    pub session: SessionId,
    /// The session's current command sequence; queries do not advance
    /// it.
    pub sequence: u64,
    /// The highest index whose effects the client has observed; the
    /// query waits until at least this index is applied.
    pub last_index: LogIndex,
    pub operation: Vec<u8>,
    pub consistency: Consistency,
}

impl QueryRequest {
    pub fn builder() -> QueryRequestBuilder {
        QueryRequestBuilder::default()
    }
}

pub struct QueryRequestBuilder {
    session: Option<SessionId>,
    sequence: u64,
    last_index: LogIndex,
    operation: Vec<u8>,
    consistency: Consistency,
}

impl Default for QueryRequestBuilder {
    fn default() -> Self {
        Self {
            session: None,
            sequence: 0,
            last_index: 0,
            operation: Vec::new(),
            consistency: Consistency::Linearizable,
        }
    }
}

impl QueryRequestBuilder {
    pub fn session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn last_index(mut self, index: LogIndex) -> Self {
        self.last_index = index;
        self
    }

    pub fn operation(mut self, operation: Vec<u8>) -> Self {
        self.operation = operation;
        self
    }

    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn build(self) -> Result<QueryRequest> {
        Ok(QueryRequest {
            session: self.session.ok_or_else(|| {
                RaftError::ProtocolError("query request missing session".into())
            })?,
            sequence: self.sequence,
            last_index: self.last_index,
            operation: self.operation,
            consistency: self.consistency,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Applied index the query executed at.
    pub index: LogIndex,
    pub result: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataRequest {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub leader: Option<MemberId>,
    pub members: Vec<Member>,
}

// ---------------------------------------------------------------------
// Membership protocol
// ---------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub member: Member,
}

impl JoinRequest {
    pub fn new(member: Member) -> Self {
        Self { member }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    pub index: LogIndex,
    pub members: Vec<Member>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub member: MemberId,
}

impl LeaveRequest {
    pub fn new(member: MemberId) -> Self {
        Self { member }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaveResponse {
    pub index: LogIndex,
    pub members: Vec<Member>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconfigureRequest {
    pub member: Member,
}

impl ReconfigureRequest {
    pub fn new(member: Member) -> Self {
        Self { member }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconfigureResponse {
    pub index: LogIndex,
    pub members: Vec<Member>,
}

// ---------------------------------------------------------------------
// Server-to-client events
// ---------------------------------------------------------------------

/// An event published by the state machine to one session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub index: u64,
    pub payload: Vec<u8>,
}

/// Best-effort push of pending events to a session's client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishRequest {
    pub session: SessionId,
    pub events: Vec<Event>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entry::{EntryKind, LogEntry};

    #[test]
    fn test_append_builder_validates_entry_continuity() {
        let entry = Indexed::new(5, LogEntry::new(1, 0, EntryKind::Initialize));
        let err = AppendRequest::builder()
            .term(1)
            .leader(1)
            .prev_log(3, 1)
            .entries(vec![entry])
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn test_append_builder_accepts_heartbeat() {
        let request = AppendRequest::builder()
            .term(2)
            .leader(1)
            .prev_log(7, 2)
            .commit_index(6)
            .build()
            .unwrap();
        assert!(request.entries.is_empty());
        assert_eq!(request.commit_index, 6);
    }

    #[test]
    fn test_open_session_rejects_zero_timeout() {
        let err = OpenSessionRequest::builder()
            .client("client-1")
            .timeout_ms(0)
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn test_missing_fields_are_protocol_errors() {
        assert!(matches!(
            VoteRequest::builder().term(1).build(),
            Err(RaftError::ProtocolError(_))
        ));
        assert!(matches!(
            CommandRequest::builder().sequence(1).build(),
            Err(RaftError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_query_round_trip() {
        let request = QueryRequest::builder()
            .session(4)
            .sequence(2)
            .last_index(9)
            .operation(b"get k".to_vec())
            .consistency(Consistency::Sequential)
            .build()
            .unwrap();
        let bytes = serde_json::to_vec(&request).unwrap();
        let decoded: QueryRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.consistency, Consistency::Sequential);
        assert_eq!(decoded.last_index, 9);
    }
}
