//! In-process transport.
//!
//! Routes requests between servers and clients living in one process
//! without network I/O. Used by the test suite and by embedded
//! single-process deployments. Members can be disconnected to simulate
//! partitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RaftError;
use crate::protocol::message::*;
use crate::protocol::transport::{RaftProtocol, RequestHandler, TransportError};
use crate::{MemberId, SessionId};

struct NetworkInner {
    handlers: HashMap<MemberId, Arc<dyn RequestHandler>>,
    listeners: HashMap<SessionId, mpsc::UnboundedSender<PublishRequest>>,
    partitioned: HashSet<MemberId>,
}

/// Shared in-process network: a registry of server handlers and client
/// session listeners. Cloning shares the registry.
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<RwLock<NetworkInner>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(NetworkInner {
                handlers: HashMap::new(),
                listeners: HashMap::new(),
                partitioned: HashSet::new(),
            })),
        }
    }

    /// Registers a server's request handler under its member id.
    pub fn register_server(&self, member: MemberId, handler: Arc<dyn RequestHandler>) {
        self.inner.write().unwrap().handlers.insert(member, handler);
    }

    pub fn unregister_server(&self, member: MemberId) {
        self.inner.write().unwrap().handlers.remove(&member);
    }

    /// Cuts a member off from the network in both directions.
    pub fn disconnect(&self, member: MemberId) {
        self.inner.write().unwrap().partitioned.insert(member);
    }

    /// Heals a previous [`LocalNetwork::disconnect`].
    pub fn reconnect(&self, member: MemberId) {
        self.inner.write().unwrap().partitioned.remove(&member);
    }

    /// The protocol endpoint for one server.
    pub fn protocol_for(&self, origin: MemberId) -> Arc<LocalProtocol> {
        Arc::new(LocalProtocol {
            network: self.clone(),
            origin: Some(origin),
        })
    }

    /// The protocol endpoint for a client (never partitioned).
    pub fn client_protocol(&self) -> Arc<LocalProtocol> {
        Arc::new(LocalProtocol {
            network: self.clone(),
            origin: None,
        })
    }

    fn route(&self, origin: Option<MemberId>, to: MemberId) -> Result<Arc<dyn RequestHandler>, RaftError> {
        let inner = self.inner.read().unwrap();
        if let Some(origin) = origin {
            if inner.partitioned.contains(&origin) {
                return Err(TransportError::SendFailed {
                    peer: to,
                    reason: "origin partitioned".into(),
                }
                .into());
            }
        }
        if inner.partitioned.contains(&to) {
            return Err(TransportError::SendFailed {
                peer: to,
                reason: "peer partitioned".into(),
            }
            .into());
        }
        inner
            .handlers
            .get(&to)
            .cloned()
            .ok_or_else(|| TransportError::PeerNotFound(to).into())
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint on a [`LocalNetwork`].
pub struct LocalProtocol {
    network: LocalNetwork,
    origin: Option<MemberId>,
}

#[async_trait]
impl RaftProtocol for LocalProtocol {
    async fn append(
        &self,
        to: MemberId,
        request: AppendRequest,
    ) -> Result<AppendResponse, RaftError> {
        let handler = self.network.route(self.origin, to)?;
        handler.handle_append(request).await
    }

    async fn vote(&self, to: MemberId, request: VoteRequest) -> Result<VoteResponse, RaftError> {
        let handler = self.network.route(self.origin, to)?;
        handler.handle_vote(request).await
    }

    async fn poll(&self, to: MemberId, request: PollRequest) -> Result<PollResponse, RaftError> {
        let handler = self.network.route(self.origin, to)?;
        handler.handle_poll(request).await
    }

    async fn install(
        &self,
        to: MemberId,
        request: InstallRequest,
    ) -> Result<InstallResponse, RaftError> {
        let handler = self.network.route(self.origin, to)?;
        handler.handle_install(request).await
    }

    async fn open_session(
        &self,
        to: MemberId,
        request: OpenSessionRequest,
    ) -> Result<OpenSessionResponse, RaftError> {
        let handler = self.network.route(self.origin, to)?;
        handler.handle_open_session(request).await
    }

    async fn close_session(
        &self,
        to: MemberId,
        request: CloseSessionRequest,
    ) -> Result<CloseSessionResponse, RaftError> {
        let handler = self.network.route(self.origin, to)?;
        handler.handle_close_session(request).await
    }

    async fn keep_alive(
        &self,
        to: MemberId,
        request: KeepAliveRequest,
    ) -> Result<KeepAliveResponse, RaftError> {
        let handler = self.network.route(self.origin, to)?;
        handler.handle_keep_alive(request).await
    }

    async fn command(
        &self,
        to: MemberId,
        request: CommandRequest,
    ) -> Result<CommandResponse, RaftError> {
        let handler = self.network.route(self.origin, to)?;
        handler.handle_command(request).await
    }

    async fn query(&self, to: MemberId, request: QueryRequest) -> Result<QueryResponse, RaftError> {
        let handler = self.network.route(self.origin, to)?;
        handler.handle_query(request).await
    }

    async fn metadata(
        &self,
        to: MemberId,
        request: MetadataRequest,
    ) -> Result<MetadataResponse, RaftError> {
        let handler = self.network.route(self.origin, to)?;
        handler.handle_metadata(request).await
    }

    async fn join(&self, to: MemberId, request: JoinRequest) -> Result<JoinResponse, RaftError> {
        let handler = self.network.route(self.origin, to)?;
        handler.handle_join(request).await
    }

    async fn leave(&self, to: MemberId, request: LeaveRequest) -> Result<LeaveResponse, RaftError> {
        let handler = self.network.route(self.origin, to)?;
        handler.handle_leave(request).await
    }

    async fn reconfigure(
        &self,
        to: MemberId,
        request: ReconfigureRequest,
    ) -> Result<ReconfigureResponse, RaftError> {
        let handler = self.network.route(self.origin, to)?;
        handler.handle_reconfigure(request).await
    }

    fn publish(&self, request: PublishRequest) {
        let inner = self.network.inner.read().unwrap();
        if let Some(origin) = self.origin {
            if inner.partitioned.contains(&origin) {
                return;
            }
        }
        if let Some(listener) = inner.listeners.get(&request.session) {
            let _ = listener.send(request);
        }
    }

    fn register_listener(
        &self,
        session: SessionId,
        listener: mpsc::UnboundedSender<PublishRequest>,
    ) {
        self.network
            .inner
            .write()
            .unwrap()
            .listeners
            .insert(session, listener);
    }

    fn unregister_listener(&self, session: SessionId) {
        self.network.inner.write().unwrap().listeners.remove(&session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle_append(
            &self,
            request: AppendRequest,
        ) -> Result<AppendResponse, RaftError> {
            Ok(AppendResponse {
                term: request.term,
                succeeded: true,
                log_index: request.prev_log_index,
            })
        }

        async fn handle_vote(&self, request: VoteRequest) -> Result<VoteResponse, RaftError> {
            Ok(VoteResponse {
                term: request.term,
                voted: true,
            })
        }

        async fn handle_poll(&self, request: PollRequest) -> Result<PollResponse, RaftError> {
            Ok(PollResponse {
                term: request.term,
                accepted: true,
            })
        }

        async fn handle_install(
            &self,
            request: InstallRequest,
        ) -> Result<InstallResponse, RaftError> {
            Ok(InstallResponse {
                term: request.term,
                succeeded: true,
                next_offset: request.offset + request.data.len() as u32,
            })
        }

        async fn handle_open_session(
            &self,
            _request: OpenSessionRequest,
        ) -> Result<OpenSessionResponse, RaftError> {
            Err(RaftError::NoLeader)
        }

        async fn handle_close_session(
            &self,
            _request: CloseSessionRequest,
        ) -> Result<CloseSessionResponse, RaftError> {
            Err(RaftError::NoLeader)
        }

        async fn handle_keep_alive(
            &self,
            _request: KeepAliveRequest,
        ) -> Result<KeepAliveResponse, RaftError> {
            Err(RaftError::NoLeader)
        }

        async fn handle_command(
            &self,
            _request: CommandRequest,
        ) -> Result<CommandResponse, RaftError> {
            Err(RaftError::NoLeader)
        }

        async fn handle_query(&self, _request: QueryRequest) -> Result<QueryResponse, RaftError> {
            Err(RaftError::NoLeader)
        }

        async fn handle_metadata(
            &self,
            _request: MetadataRequest,
        ) -> Result<MetadataResponse, RaftError> {
            Ok(MetadataResponse {
                leader: None,
                members: Vec::new(),
            })
        }

        async fn handle_join(&self, _request: JoinRequest) -> Result<JoinResponse, RaftError> {
            Err(RaftError::NoLeader)
        }

        async fn handle_leave(&self, _request: LeaveRequest) -> Result<LeaveResponse, RaftError> {
            Err(RaftError::NoLeader)
        }

        async fn handle_reconfigure(
            &self,
            _request: ReconfigureRequest,
        ) -> Result<ReconfigureResponse, RaftError> {
            Err(RaftError::NoLeader)
        }
    }

    #[tokio::test]
    async fn test_routes_to_registered_handler() {
        let network = LocalNetwork::new();
        network.register_server(2, Arc::new(EchoHandler));

        let protocol = network.protocol_for(1);
        let request = VoteRequest::builder()
            .term(3)
            .candidate(1)
            .last_log(0, 0)
            .build()
            .unwrap();
        let response = protocol.vote(2, request).await.unwrap();
        assert!(response.voted);
        assert_eq!(response.term, 3);
    }

    #[tokio::test]
    async fn test_unknown_peer_is_unavailable() {
        let network = LocalNetwork::new();
        let protocol = network.protocol_for(1);
        let request = MetadataRequest {};
        let err = protocol.metadata(9, request).await.unwrap_err();
        assert!(matches!(err, RaftError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_partition_blocks_both_directions() {
        let network = LocalNetwork::new();
        network.register_server(1, Arc::new(EchoHandler));
        network.register_server(2, Arc::new(EchoHandler));

        network.disconnect(2);
        let from_one = network.protocol_for(1);
        assert!(from_one.metadata(2, MetadataRequest {}).await.is_err());
        let from_two = network.protocol_for(2);
        assert!(from_two.metadata(1, MetadataRequest {}).await.is_err());

        network.reconnect(2);
        assert!(from_two.metadata(1, MetadataRequest {}).await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_reaches_listener() {
        let network = LocalNetwork::new();
        let protocol = network.protocol_for(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        protocol.register_listener(7, tx);

        protocol.publish(PublishRequest {
            session: 7,
            events: vec![Event {
                index: 1,
                payload: b"hello".to_vec(),
            }],
        });

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.session, 7);
        assert_eq!(delivered.events[0].payload, b"hello");
    }
}
