//! The transport contract.
//!
//! Any reliable message-oriented channel can carry the protocol: the
//! server registers a [`RequestHandler`] and sends outbound requests
//! through a [`RaftProtocol`]. The in-process implementation lives in
//! [`crate::protocol::local`]; a network implementation would provide
//! the same two traits over its wire format.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::RaftError;
use crate::protocol::message::*;
use crate::{MemberId, SessionId};

/// Errors produced by a transport implementation. Mapped into
/// [`RaftError::Unavailable`] so callers retry.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("peer {0} not reachable")]
    PeerNotFound(MemberId),

    #[error("send to peer {peer} failed: {reason}")]
    SendFailed { peer: MemberId, reason: String },

    #[error("transport closed")]
    Closed,
}

impl From<TransportError> for RaftError {
    fn from(err: TransportError) -> Self {
        RaftError::Unavailable(err.to_string())
    }
}

/// Server-side handler: one method per request kind, each returning a
/// future completing with the matching response. Implemented by the
/// server handle, which forwards into the server actor's mailbox.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_append(&self, request: AppendRequest) -> Result<AppendResponse, RaftError>;
    async fn handle_vote(&self, request: VoteRequest) -> Result<VoteResponse, RaftError>;
    async fn handle_poll(&self, request: PollRequest) -> Result<PollResponse, RaftError>;
    async fn handle_install(&self, request: InstallRequest) -> Result<InstallResponse, RaftError>;

    async fn handle_open_session(
        &self,
        request: OpenSessionRequest,
    ) -> Result<OpenSessionResponse, RaftError>;
    async fn handle_close_session(
        &self,
        request: CloseSessionRequest,
    ) -> Result<CloseSessionResponse, RaftError>;
    async fn handle_keep_alive(
        &self,
        request: KeepAliveRequest,
    ) -> Result<KeepAliveResponse, RaftError>;
    async fn handle_command(&self, request: CommandRequest) -> Result<CommandResponse, RaftError>;
    async fn handle_query(&self, request: QueryRequest) -> Result<QueryResponse, RaftError>;
    async fn handle_metadata(
        &self,
        request: MetadataRequest,
    ) -> Result<MetadataResponse, RaftError>;

    async fn handle_join(&self, request: JoinRequest) -> Result<JoinResponse, RaftError>;
    async fn handle_leave(&self, request: LeaveRequest) -> Result<LeaveResponse, RaftError>;
    async fn handle_reconfigure(
        &self,
        request: ReconfigureRequest,
    ) -> Result<ReconfigureResponse, RaftError>;
}

/// Outbound side of the transport: sends a request to a member and
/// completes with its response, plus best-effort event publication to
/// client sessions.
#[async_trait]
pub trait RaftProtocol: Send + Sync + 'static {
    async fn append(
        &self,
        to: MemberId,
        request: AppendRequest,
    ) -> Result<AppendResponse, RaftError>;
    async fn vote(&self, to: MemberId, request: VoteRequest) -> Result<VoteResponse, RaftError>;
    async fn poll(&self, to: MemberId, request: PollRequest) -> Result<PollResponse, RaftError>;
    async fn install(
        &self,
        to: MemberId,
        request: InstallRequest,
    ) -> Result<InstallResponse, RaftError>;

    async fn open_session(
        &self,
        to: MemberId,
        request: OpenSessionRequest,
    ) -> Result<OpenSessionResponse, RaftError>;
    async fn close_session(
        &self,
        to: MemberId,
        request: CloseSessionRequest,
    ) -> Result<CloseSessionResponse, RaftError>;
    async fn keep_alive(
        &self,
        to: MemberId,
        request: KeepAliveRequest,
    ) -> Result<KeepAliveResponse, RaftError>;
    async fn command(
        &self,
        to: MemberId,
        request: CommandRequest,
    ) -> Result<CommandResponse, RaftError>;
    async fn query(&self, to: MemberId, request: QueryRequest) -> Result<QueryResponse, RaftError>;
    async fn metadata(
        &self,
        to: MemberId,
        request: MetadataRequest,
    ) -> Result<MetadataResponse, RaftError>;

    async fn join(&self, to: MemberId, request: JoinRequest) -> Result<JoinResponse, RaftError>;
    async fn leave(&self, to: MemberId, request: LeaveRequest) -> Result<LeaveResponse, RaftError>;
    async fn reconfigure(
        &self,
        to: MemberId,
        request: ReconfigureRequest,
    ) -> Result<ReconfigureResponse, RaftError>;

    /// Pushes events to the client owning `request.session`, if it is
    /// connected. Losses are recovered through keep-alive replay.
    fn publish(&self, request: PublishRequest);

    /// Subscribes a client to unsolicited messages for a session.
    fn register_listener(&self, session: SessionId, listener: mpsc::UnboundedSender<PublishRequest>);

    /// Removes a session subscription.
    fn unregister_listener(&self, session: SessionId);
}
