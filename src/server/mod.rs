//! The Raft server: role state machine, replication, sessions, and
//! membership, all driven by a single-threaded actor.
//!
//! [`RaftServer`] is the public handle. It implements the transport's
//! [`RequestHandler`] by forwarding every request into the actor's
//! mailbox and awaiting a oneshot reply, so all server state is touched
//! by exactly one task.

mod candidate;
mod follower;
mod leader;
pub mod session;
pub mod state_machine;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use slog::{Drain, Logger};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::cluster::{ClusterState, Configuration, Member, MemberKind};
use crate::config::ServerConfig;
use crate::context::{Scheduled, ThreadContext};
use crate::error::{RaftError, Result};
use crate::protocol::message::*;
use crate::protocol::transport::{RaftProtocol, RequestHandler};
use crate::storage::entry::{EntryKind, LogEntry};
use crate::storage::log::unix_millis;
use crate::storage::{MetaStore, RaftLog, SnapshotStore, SnapshotWriter, Snapshot};
use crate::{LogIndex, MemberId, SessionId, Term};

pub use session::{SessionEvent, SessionState};
pub use state_machine::{ApplyContext, StateMachine, StateMachineError};

use state_machine::{Applier, ApplyOutcome};

/// The role a server is currently running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleKind {
    /// Not participating; pre-start or shut down.
    Inactive,
    /// Member of record that is not replicated to.
    Reserve,
    /// Replicates the log, never votes or leads.
    Passive,
    Follower,
    Candidate,
    Leader,
}

/// Role transition notification, published on every change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoleChange {
    pub member: MemberId,
    pub role: RoleKind,
}

/// Point-in-time server state, for inspection and tests.
#[derive(Clone, Debug)]
pub struct ServerStatus {
    pub id: MemberId,
    pub role: RoleKind,
    pub term: Term,
    pub leader: Option<MemberId>,
    pub last_index: LogIndex,
    pub commit_index: LogIndex,
    pub applied_index: LogIndex,
    pub members: Vec<Member>,
}

/// Messages processed by the server actor.
pub(crate) enum ServerMessage {
    Append {
        request: AppendRequest,
        reply: oneshot::Sender<Result<AppendResponse>>,
    },
    Vote {
        request: VoteRequest,
        reply: oneshot::Sender<Result<VoteResponse>>,
    },
    Poll {
        request: PollRequest,
        reply: oneshot::Sender<Result<PollResponse>>,
    },
    Install {
        request: InstallRequest,
        reply: oneshot::Sender<Result<InstallResponse>>,
    },
    OpenSession {
        request: OpenSessionRequest,
        reply: oneshot::Sender<Result<OpenSessionResponse>>,
    },
    CloseSession {
        request: CloseSessionRequest,
        reply: oneshot::Sender<Result<CloseSessionResponse>>,
    },
    KeepAlive {
        request: KeepAliveRequest,
        reply: oneshot::Sender<Result<KeepAliveResponse>>,
    },
    Command {
        request: CommandRequest,
        reply: oneshot::Sender<Result<CommandResponse>>,
    },
    Query {
        request: QueryRequest,
        reply: oneshot::Sender<Result<QueryResponse>>,
    },
    Metadata {
        reply: oneshot::Sender<Result<MetadataResponse>>,
    },
    Join {
        request: JoinRequest,
        reply: oneshot::Sender<Result<JoinResponse>>,
    },
    Leave {
        request: LeaveRequest,
        reply: oneshot::Sender<Result<LeaveResponse>>,
    },
    Reconfigure {
        request: ReconfigureRequest,
        reply: oneshot::Sender<Result<ReconfigureResponse>>,
    },
    ElectionTimeout {
        round: u64,
    },
    HeartbeatTick,
    PollOutcome {
        term: Term,
        from: MemberId,
        response: Result<PollResponse>,
    },
    VoteOutcome {
        term: Term,
        from: MemberId,
        response: Result<VoteResponse>,
    },
    AppendOutcome {
        term: Term,
        member: MemberId,
        sent_last: LogIndex,
        response: Result<AppendResponse>,
    },
    InstallOutcome {
        term: Term,
        member: MemberId,
        sent_to_offset: u32,
        complete: bool,
        snapshot_index: LogIndex,
        response: Result<InstallResponse>,
    },
    Status {
        reply: oneshot::Sender<ServerStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Replies waiting on a log index to commit and apply.
pub(crate) enum PendingReply {
    Open(oneshot::Sender<Result<OpenSessionResponse>>),
    Close(oneshot::Sender<Result<CloseSessionResponse>>),
    KeepAlive(oneshot::Sender<Result<KeepAliveResponse>>),
    Command(oneshot::Sender<Result<CommandResponse>>),
    Query(oneshot::Sender<Result<QueryResponse>>),
}

pub(crate) enum ConfigReply {
    Join(oneshot::Sender<Result<JoinResponse>>),
    Leave(oneshot::Sender<Result<LeaveResponse>>),
    Reconfigure(oneshot::Sender<Result<ReconfigureResponse>>),
}

/// Volatile leader bookkeeping, rebuilt on every election.
pub(crate) struct LeaderState {
    pub next_index: HashMap<MemberId, LogIndex>,
    pub match_index: HashMap<MemberId, LogIndex>,
    pub last_contact: HashMap<MemberId, Instant>,
    pub in_flight: HashSet<MemberId>,
    pub installing: HashMap<MemberId, InstallSend>,
    pub pending: HashMap<LogIndex, PendingReply>,
    pub pending_config: Option<(LogIndex, ConfigReply)>,
    /// When this term's leadership began; quorum-contact checks start
    /// after one election timeout of grace.
    pub since: Instant,
}

/// An install sequence in progress toward one follower.
pub(crate) struct InstallSend {
    pub id: u64,
    pub index: LogIndex,
    pub timestamp: u64,
    pub data: Vec<u8>,
    pub offset: u32,
}

pub(crate) struct CandidateState {
    pub votes: HashSet<MemberId>,
}

pub(crate) struct PollRound {
    pub term: Term,
    pub accepts: HashSet<MemberId>,
}

/// A snapshot being received through the install protocol.
pub(crate) struct InstallProgress {
    pub id: u64,
    pub index: LogIndex,
    pub next_offset: u32,
    pub snapshot: Snapshot,
    pub writer: Option<SnapshotWriter>,
}

/// What a snapshot file actually holds: the applier's image plus the
/// configuration effective at the captured index, so installed
/// followers converge on membership too.
#[derive(Serialize, Deserialize)]
pub(crate) struct SnapshotEnvelope {
    pub configuration: Configuration,
    pub state: Vec<u8>,
}

/// A query waiting for the applied index to reach the client's view.
pub(crate) struct WaitingQuery {
    pub min_index: LogIndex,
    pub request: QueryRequest,
    pub reply: oneshot::Sender<Result<QueryResponse>>,
}

/// Handle to a running server.
#[derive(Clone)]
pub struct RaftServer {
    id: MemberId,
    sender: mpsc::UnboundedSender<ServerMessage>,
    protocol: Arc<dyn RaftProtocol>,
    role_tx: broadcast::Sender<RoleChange>,
    session_tx: broadcast::Sender<SessionEvent>,
    is_leader: Arc<AtomicBool>,
}

impl RaftServer {
    /// Starts a server with a default terminal logger.
    pub async fn start(
        id: MemberId,
        members: Vec<Member>,
        protocol: Arc<dyn RaftProtocol>,
        state_machine: Box<dyn StateMachine>,
        config: ServerConfig,
    ) -> Result<RaftServer> {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        let logger = Logger::root(drain, slog::o!("node_id" => id));
        Self::start_with_logger(id, members, protocol, state_machine, config, logger).await
    }

    /// Starts a server with the given logger.
    pub async fn start_with_logger(
        id: MemberId,
        members: Vec<Member>,
        protocol: Arc<dyn RaftProtocol>,
        state_machine: Box<dyn StateMachine>,
        config: ServerConfig,
        logger: Logger,
    ) -> Result<RaftServer> {
        let (sender, mailbox) = mpsc::unbounded_channel();
        let (role_tx, _) = broadcast::channel(128);
        let (session_tx, _) = broadcast::channel(128);
        let is_leader = Arc::new(AtomicBool::new(false));

        let log = RaftLog::open(&config.storage)?;
        let meta = MetaStore::open(&config.storage)?;
        let snapshots = SnapshotStore::open(&config.storage)?;
        let applier = Applier::new(state_machine, session_tx.clone(), logger.clone());

        let actor = ServerActor {
            id,
            config,
            logger,
            protocol: Arc::clone(&protocol),
            mailbox,
            context: ThreadContext::new(sender.clone()),
            log,
            meta,
            snapshots,
            applier,
            cluster: ClusterState::new(Configuration::bootstrap(members)),
            role: RoleKind::Inactive,
            leader_hint: None,
            role_tx: role_tx.clone(),
            is_leader: Arc::clone(&is_leader),
            election_timer: None,
            election_round: 0,
            heartbeat_timer: None,
            poll_round: None,
            candidate: None,
            leader: None,
            pending_install: None,
            waiting_queries: Vec::new(),
            last_snapshot_index: 0,
            last_applied_term: 0,
            last_applied_timestamp: 0,
            shutdown: false,
        };

        tokio::spawn(actor.run());

        Ok(RaftServer {
            id,
            sender,
            protocol,
            role_tx,
            session_tx,
            is_leader,
        })
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Subscribes to role transitions.
    pub fn role_changes(&self) -> broadcast::Receiver<RoleChange> {
        self.role_tx.subscribe()
    }

    /// Subscribes to session lifecycle events on this replica.
    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }

    pub async fn status(&self) -> Result<ServerStatus> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(ServerMessage::Status { reply })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    /// Joins this server to an existing cluster through any of the
    /// seed members, retrying with backoff until the configuration
    /// change commits.
    pub async fn join(&self, seeds: &[MemberId], kind: MemberKind) -> Result<()> {
        let request = JoinRequest::new(Member {
            id: self.id,
            kind,
        });
        let mut backoff = Duration::from_millis(50);
        let mut target_hint: Option<MemberId> = None;
        for _ in 0..32 {
            let targets: Vec<MemberId> = match target_hint.take() {
                Some(leader) => vec![leader],
                None => seeds.to_vec(),
            };
            for target in targets {
                match self.protocol.join(target, request.clone()).await {
                    Ok(_) => return Ok(()),
                    Err(RaftError::NotLeader { leader: Some(hint) }) => {
                        target_hint = Some(hint);
                        break;
                    }
                    Err(err) if err.is_retryable() => continue,
                    Err(err) => return Err(err),
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
        Err(RaftError::Unavailable("join did not commit".into()))
    }

    /// Removes this server from the cluster.
    pub async fn leave(&self, seeds: &[MemberId]) -> Result<()> {
        let request = LeaveRequest::new(self.id);
        let mut backoff = Duration::from_millis(50);
        let mut target_hint: Option<MemberId> = None;
        for _ in 0..32 {
            let targets: Vec<MemberId> = match target_hint.take() {
                Some(leader) => vec![leader],
                None => seeds.to_vec(),
            };
            for target in targets {
                match self.protocol.leave(target, request.clone()).await {
                    Ok(_) => return Ok(()),
                    Err(RaftError::NotLeader { leader: Some(hint) }) => {
                        target_hint = Some(hint);
                        break;
                    }
                    Err(err) if err.is_retryable() => continue,
                    Err(err) => return Err(err),
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
        Err(RaftError::Unavailable("leave did not commit".into()))
    }

    /// Stops the actor. Outstanding requests complete with `Shutdown`.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.sender.send(ServerMessage::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    async fn call<T>(
        &self,
        message: ServerMessage,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.sender.send(message).map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }
}

#[async_trait]
impl RequestHandler for RaftServer {
    async fn handle_append(&self, request: AppendRequest) -> Result<AppendResponse> {
        let (reply, rx) = oneshot::channel();
        self.call(ServerMessage::Append { request, reply }, rx).await
    }

    async fn handle_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        let (reply, rx) = oneshot::channel();
        self.call(ServerMessage::Vote { request, reply }, rx).await
    }

    async fn handle_poll(&self, request: PollRequest) -> Result<PollResponse> {
        let (reply, rx) = oneshot::channel();
        self.call(ServerMessage::Poll { request, reply }, rx).await
    }

    async fn handle_install(&self, request: InstallRequest) -> Result<InstallResponse> {
        let (reply, rx) = oneshot::channel();
        self.call(ServerMessage::Install { request, reply }, rx).await
    }

    async fn handle_open_session(
        &self,
        request: OpenSessionRequest,
    ) -> Result<OpenSessionResponse> {
        let (reply, rx) = oneshot::channel();
        self.call(ServerMessage::OpenSession { request, reply }, rx)
            .await
    }

    async fn handle_close_session(
        &self,
        request: CloseSessionRequest,
    ) -> Result<CloseSessionResponse> {
        let (reply, rx) = oneshot::channel();
        self.call(ServerMessage::CloseSession { request, reply }, rx)
            .await
    }

    async fn handle_keep_alive(&self, request: KeepAliveRequest) -> Result<KeepAliveResponse> {
        let (reply, rx) = oneshot::channel();
        self.call(ServerMessage::KeepAlive { request, reply }, rx)
            .await
    }

    async fn handle_command(&self, request: CommandRequest) -> Result<CommandResponse> {
        let (reply, rx) = oneshot::channel();
        self.call(ServerMessage::Command { request, reply }, rx).await
    }

    async fn handle_query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let (reply, rx) = oneshot::channel();
        self.call(ServerMessage::Query { request, reply }, rx).await
    }

    async fn handle_metadata(&self, _request: MetadataRequest) -> Result<MetadataResponse> {
        let (reply, rx) = oneshot::channel();
        self.call(ServerMessage::Metadata { reply }, rx).await
    }

    async fn handle_join(&self, request: JoinRequest) -> Result<JoinResponse> {
        let (reply, rx) = oneshot::channel();
        self.call(ServerMessage::Join { request, reply }, rx).await
    }

    async fn handle_leave(&self, request: LeaveRequest) -> Result<LeaveResponse> {
        let (reply, rx) = oneshot::channel();
        self.call(ServerMessage::Leave { request, reply }, rx).await
    }

    async fn handle_reconfigure(&self, request: ReconfigureRequest) -> Result<ReconfigureResponse> {
        let (reply, rx) = oneshot::channel();
        self.call(ServerMessage::Reconfigure { request, reply }, rx)
            .await
    }
}

/// The single-threaded server actor.
pub(crate) struct ServerActor {
    pub id: MemberId,
    pub config: ServerConfig,
    pub logger: Logger,
    pub protocol: Arc<dyn RaftProtocol>,
    mailbox: mpsc::UnboundedReceiver<ServerMessage>,
    pub context: ThreadContext<ServerMessage>,
    pub log: RaftLog,
    pub meta: MetaStore,
    pub snapshots: SnapshotStore,
    pub applier: Applier,
    pub cluster: ClusterState,
    pub role: RoleKind,
    pub leader_hint: Option<MemberId>,
    role_tx: broadcast::Sender<RoleChange>,
    is_leader: Arc<AtomicBool>,
    pub election_timer: Option<Scheduled>,
    pub election_round: u64,
    pub heartbeat_timer: Option<Scheduled>,
    pub poll_round: Option<PollRound>,
    pub candidate: Option<CandidateState>,
    pub leader: Option<LeaderState>,
    pub pending_install: Option<InstallProgress>,
    pub waiting_queries: Vec<WaitingQuery>,
    pub last_snapshot_index: LogIndex,
    pub last_applied_term: Term,
    pub last_applied_timestamp: u64,
    shutdown: bool,
}

impl ServerActor {
    pub(crate) async fn run(mut self) {
        if let Err(err) = self.startup() {
            slog::error!(self.logger, "Server failed to start"; "error" => %err);
            return;
        }

        while let Some(message) = self.mailbox.recv().await {
            self.dispatch(message);
            if self.shutdown {
                break;
            }
        }
        slog::info!(self.logger, "Server stopped");
    }

    fn dispatch(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Append { request, reply } => {
                let _ = reply.send(self.handle_append(request));
            }
            ServerMessage::Vote { request, reply } => {
                let _ = reply.send(self.handle_vote(request));
            }
            ServerMessage::Poll { request, reply } => {
                let _ = reply.send(self.handle_poll(request));
            }
            ServerMessage::Install { request, reply } => {
                let _ = reply.send(self.handle_install(request));
            }
            ServerMessage::OpenSession { request, reply } => self.handle_open_session(request, reply),
            ServerMessage::CloseSession { request, reply } => {
                self.handle_close_session(request, reply)
            }
            ServerMessage::KeepAlive { request, reply } => self.handle_keep_alive(request, reply),
            ServerMessage::Command { request, reply } => self.handle_command(request, reply),
            ServerMessage::Query { request, reply } => self.handle_query(request, reply),
            ServerMessage::Metadata { reply } => {
                let _ = reply.send(Ok(MetadataResponse {
                    leader: self.leader_hint,
                    members: self.cluster.current().members.clone(),
                }));
            }
            ServerMessage::Join { request, reply } => self.handle_join(request, reply),
            ServerMessage::Leave { request, reply } => self.handle_leave(request, reply),
            ServerMessage::Reconfigure { request, reply } => self.handle_reconfigure(request, reply),
            ServerMessage::ElectionTimeout { round } => self.handle_election_timeout(round),
            ServerMessage::HeartbeatTick => self.handle_heartbeat_tick(),
            ServerMessage::PollOutcome {
                term,
                from,
                response,
            } => self.handle_poll_outcome(term, from, response),
            ServerMessage::VoteOutcome {
                term,
                from,
                response,
            } => self.handle_vote_outcome(term, from, response),
            ServerMessage::AppendOutcome {
                term,
                member,
                sent_last,
                response,
            } => self.handle_append_outcome(term, member, sent_last, response),
            ServerMessage::InstallOutcome {
                term,
                member,
                sent_to_offset,
                complete,
                snapshot_index,
                response,
            } => self.handle_install_outcome(
                term,
                member,
                sent_to_offset,
                complete,
                snapshot_index,
                response,
            ),
            ServerMessage::Status { reply } => {
                let _ = reply.send(ServerStatus {
                    id: self.id,
                    role: self.role,
                    term: self.meta.current_term(),
                    leader: self.leader_hint,
                    last_index: self.log.last_index(),
                    commit_index: self.log.commit_index(),
                    applied_index: self.applier.applied_index(),
                    members: self.cluster.current().members.clone(),
                });
            }
            ServerMessage::Shutdown { reply } => {
                self.transition_to(RoleKind::Inactive);
                self.shutdown = true;
                let _ = reply.send(());
            }
        }
    }

    /// Recovers durable state and enters the initial role.
    fn startup(&mut self) -> Result<()> {
        if let Some(snapshot) = self.snapshots.current_snapshot() {
            let data = snapshot.reader()?.bytes().to_vec();
            let envelope: SnapshotEnvelope = serde_json::from_slice(&data)?;
            let (index, term) = self.applier.restore_with_term(&envelope.state)?;
            let config_index = envelope.configuration.index;
            self.cluster = ClusterState::new(envelope.configuration);
            self.cluster.commit(config_index);
            self.last_snapshot_index = index;
            self.last_applied_term = term;
            if self.log.last_index() < index {
                self.log.reset(index, term)?;
            } else {
                self.log.restore_boundary(index, term);
            }
            slog::info!(self.logger, "Recovered from snapshot";
                "index" => index, "term" => term);
        }

        // Rebuild membership from configuration entries still in the
        // log.
        let mut index = self.log.first_index();
        while index <= self.log.last_index() {
            if let Some(indexed) = self.log.read(index)? {
                if let EntryKind::Configuration { members } = &indexed.entry.kind {
                    self.cluster.append(Configuration {
                        index,
                        members: members.clone(),
                    });
                }
            }
            index += 1;
        }
        self.cluster.commit(self.meta.metadata().last_config_index);

        slog::info!(self.logger, "Server starting";
            "term" => self.meta.current_term(),
            "last_index" => self.log.last_index(),
            "members" => self.cluster.current().members.len());

        self.transition_to(self.role_for_membership());
        Ok(())
    }

    /// The role this server should run given the effective
    /// configuration.
    pub(crate) fn role_for_membership(&self) -> RoleKind {
        match self.cluster.current().member(self.id).map(|m| m.kind) {
            Some(MemberKind::Active) => RoleKind::Follower,
            Some(MemberKind::Passive) => RoleKind::Passive,
            Some(MemberKind::Reserve) => RoleKind::Reserve,
            // Not yet a member of record: like a reserve, the leader
            // does not replicate to this server until a join promotes
            // it into the configuration.
            None => RoleKind::Reserve,
        }
    }

    /// Switches role, tearing down the old role's transient state.
    pub(crate) fn transition_to(&mut self, role: RoleKind) {
        if role == self.role && !matches!(role, RoleKind::Candidate) {
            return;
        }
        slog::info!(self.logger, "Role transition";
            "from" => ?self.role, "to" => ?role, "term" => self.meta.current_term());

        // Tear down the old role.
        if self.role == RoleKind::Leader && role != RoleKind::Leader {
            self.heartbeat_timer = None;
            if let Some(leader) = self.leader.take() {
                fail_pending(leader, RaftError::Unavailable("leader stepped down".into()));
            }
        }
        self.candidate = None;
        self.poll_round = None;
        self.election_timer = None;

        self.role = role;
        self.is_leader
            .store(role == RoleKind::Leader, Ordering::SeqCst);
        let _ = self.role_tx.send(RoleChange {
            member: self.id,
            role,
        });

        match role {
            RoleKind::Follower | RoleKind::Candidate => self.arm_election_timer(),
            RoleKind::Leader => self.leader_hint = Some(self.id),
            _ => {}
        }
    }

    /// Applies membership changes to this server's own role.
    pub(crate) fn check_membership_role(&mut self) {
        // A leader keeps leading until the change that demotes or
        // removes it commits; it must replicate that entry itself.
        if self.role == RoleKind::Leader && self.cluster.change_pending() {
            return;
        }
        let desired = self.role_for_membership();
        match (self.role, desired) {
            // An active member already following, campaigning, or
            // leading keeps its role.
            (RoleKind::Leader | RoleKind::Candidate | RoleKind::Follower, RoleKind::Follower) => {}
            (current, wanted) if current != wanted => {
                if !self.cluster.current().contains(self.id)
                    && self.cluster.committed_index() >= self.cluster.current().index
                {
                    // Removed from the cluster entirely.
                    self.transition_to(RoleKind::Inactive);
                } else {
                    self.transition_to(wanted);
                }
            }
            _ => {}
        }
    }

    pub(crate) fn arm_election_timer(&mut self) {
        let min = self.config.election_timeout_min;
        let max = self.config.election_timeout_max;
        let timeout = if max > min {
            min + Duration::from_millis(
                rand::thread_rng().gen_range(0..=(max - min).as_millis() as u64),
            )
        } else {
            min
        };
        self.election_round += 1;
        let round = self.election_round;
        self.election_timer = Some(
            self.context
                .schedule(timeout, ServerMessage::ElectionTimeout { round }),
        );
    }

    /// Adopts a higher term: persists it and falls back to follower.
    pub(crate) fn step_down(&mut self, term: Term) {
        if term > self.meta.current_term() {
            if let Err(err) = self.meta.store_term(term) {
                self.fail_storage(&err);
                return;
            }
        }
        match self.role {
            RoleKind::Leader | RoleKind::Candidate => {
                self.transition_to(self.role_for_membership());
            }
            _ => {}
        }
    }

    /// Storage failures are fatal: the server stops accepting work.
    pub(crate) fn fail_storage(&mut self, err: &RaftError) {
        slog::error!(self.logger, "Fatal storage error; shutting down"; "error" => %err);
        self.transition_to(RoleKind::Inactive);
        self.shutdown = true;
    }

    // -----------------------------------------------------------------
    // Client request routing shared by roles
    // -----------------------------------------------------------------

    fn handle_open_session(
        &mut self,
        request: OpenSessionRequest,
        reply: oneshot::Sender<Result<OpenSessionResponse>>,
    ) {
        if self.role != RoleKind::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return;
        }
        let kind = EntryKind::OpenSession {
            client: request.client,
            timeout_ms: request.timeout_ms,
        };
        self.submit_to_log(kind, PendingReply::Open(reply));
    }

    fn handle_close_session(
        &mut self,
        request: CloseSessionRequest,
        reply: oneshot::Sender<Result<CloseSessionResponse>>,
    ) {
        if self.role != RoleKind::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return;
        }
        let kind = EntryKind::CloseSession {
            session: request.session,
        };
        self.submit_to_log(kind, PendingReply::Close(reply));
    }

    fn handle_keep_alive(
        &mut self,
        request: KeepAliveRequest,
        reply: oneshot::Sender<Result<KeepAliveResponse>>,
    ) {
        if self.role != RoleKind::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return;
        }
        let kind = EntryKind::KeepAlive {
            session: request.session,
            command_sequence: request.command_sequence,
            event_index: request.event_index,
        };
        self.submit_to_log(kind, PendingReply::KeepAlive(reply));
    }

    fn handle_command(
        &mut self,
        request: CommandRequest,
        reply: oneshot::Sender<Result<CommandResponse>>,
    ) {
        if self.role != RoleKind::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return;
        }
        let kind = EntryKind::Command {
            session: request.session,
            sequence: request.sequence,
            operation: request.operation,
        };
        self.submit_to_log(kind, PendingReply::Command(reply));
    }

    /// Appends a client operation, registers its reply against the
    /// assigned index, and kicks off replication.
    fn submit_to_log(&mut self, kind: EntryKind, pending: PendingReply) {
        match self.leader_append(kind) {
            Ok(index) => {
                if let Some(leader) = self.leader.as_mut() {
                    leader.pending.insert(index, pending);
                }
                self.after_append();
            }
            Err(err) => {
                let fatal = matches!(err, RaftError::Storage(_));
                fail_single(pending, err.clone());
                if fatal {
                    self.fail_storage(&err);
                }
            }
        }
    }

    fn handle_query(
        &mut self,
        request: QueryRequest,
        reply: oneshot::Sender<Result<QueryResponse>>,
    ) {
        match request.consistency {
            Consistency::Linearizable => {
                if self.role != RoleKind::Leader {
                    let _ = reply.send(Err(self.not_leader()));
                    return;
                }
                let kind = EntryKind::Query {
                    session: request.session,
                    operation: request.operation,
                };
                self.submit_to_log(kind, PendingReply::Query(reply));
            }
            Consistency::Sequential => {
                if self.role != RoleKind::Leader {
                    let _ = reply.send(Err(self.not_leader()));
                    return;
                }
                self.execute_or_wait_query(request, reply);
            }
            Consistency::Eventual => {
                self.execute_or_wait_query(request, reply);
            }
        }
    }

    fn execute_or_wait_query(
        &mut self,
        request: QueryRequest,
        reply: oneshot::Sender<Result<QueryResponse>>,
    ) {
        if self.applier.applied_index() >= request.last_index {
            let applied = self.applier.applied_index();
            let result = self
                .applier
                .query(request.session, &request.operation)
                .map(|result| QueryResponse {
                    index: applied,
                    result,
                });
            let _ = reply.send(result);
        } else {
            self.waiting_queries.push(WaitingQuery {
                min_index: request.last_index,
                request,
                reply,
            });
        }
    }

    pub(crate) fn drain_waiting_queries(&mut self) {
        let applied = self.applier.applied_index();
        let mut ready = Vec::new();
        let mut keep = Vec::new();
        for waiting in self.waiting_queries.drain(..) {
            if waiting.min_index <= applied {
                ready.push(waiting);
            } else {
                keep.push(waiting);
            }
        }
        self.waiting_queries = keep;
        for waiting in ready {
            let result = self
                .applier
                .query(waiting.request.session, &waiting.request.operation)
                .map(|result| QueryResponse {
                    index: applied,
                    result,
                });
            let _ = waiting.reply.send(result);
        }
    }

    pub(crate) fn not_leader(&self) -> RaftError {
        match self.leader_hint {
            Some(leader) if leader != self.id => RaftError::NotLeader {
                leader: Some(leader),
            },
            _ => RaftError::NoLeader,
        }
    }

    // -----------------------------------------------------------------
    // Commit application
    // -----------------------------------------------------------------

    /// Applies every committed-but-unapplied entry, completes waiting
    /// futures, publishes session events, and snapshots when due.
    pub(crate) fn apply_committed(&mut self) {
        let mut reader = self
            .log
            .reader(self.applier.applied_index() + 1, crate::storage::ReadMode::Committed);
        while reader.has_next() {
            let index = reader.next_index();
            let indexed = match reader.next() {
                Ok(Some(indexed)) => indexed,
                Ok(None) => {
                    slog::error!(self.logger, "Committed entry missing"; "index" => index);
                    return;
                }
                Err(err) => {
                    self.fail_storage(&err);
                    return;
                }
            };
            let index = indexed.index;

            let (outcome, events) = self.applier.apply(&indexed);
            self.last_applied_term = indexed.entry.term;
            self.last_applied_timestamp = indexed.entry.timestamp;

            if matches!(indexed.entry.kind, EntryKind::Configuration { .. }) {
                self.cluster.commit(index);
                if let Err(err) = self.meta.store_config_index(index) {
                    self.fail_storage(&err);
                    return;
                }
                self.complete_config(index);
                self.check_membership_role();
            }

            self.complete_pending(index, outcome);
            self.publish_events(events);

            // Replay any events the client has not yet acknowledged,
            // covering reconnects within the retention window.
            if let EntryKind::KeepAlive { session, .. } = indexed.entry.kind {
                self.republish_session_events(session);
            }
        }
        self.drain_waiting_queries();
        self.maybe_snapshot();
    }

    fn complete_pending(&mut self, index: LogIndex, outcome: ApplyOutcome) {
        let Some(leader) = self.leader.as_mut() else {
            return;
        };
        let Some(pending) = leader.pending.remove(&index) else {
            return;
        };

        let leader_hint = self.leader_hint;
        let member_ids: Vec<MemberId> = self
            .cluster
            .current()
            .members
            .iter()
            .map(|m| m.id)
            .collect();

        match (pending, outcome) {
            (PendingReply::Open(reply), ApplyOutcome::SessionOpened(session)) => {
                let timeout_ms = self
                    .applier
                    .registry()
                    .get(session)
                    .map(|s| s.timeout_ms)
                    .unwrap_or(0);
                let _ = reply.send(Ok(OpenSessionResponse {
                    session,
                    timeout_ms,
                    leader: leader_hint,
                    members: member_ids,
                }));
            }
            (PendingReply::Close(reply), ApplyOutcome::SessionClosed(result)) => {
                let _ = reply.send(result.map(|_| CloseSessionResponse {}));
            }
            (PendingReply::KeepAlive(reply), ApplyOutcome::KeepAlive(result)) => {
                let _ = reply.send(result.map(|_| KeepAliveResponse {
                    leader: leader_hint,
                    members: member_ids,
                }));
            }
            (PendingReply::Command(reply), ApplyOutcome::Command(result)) => {
                let response = result.and_then(|cached| match cached.result {
                    Ok(bytes) => Ok(CommandResponse {
                        index: cached.index,
                        event_index: cached.event_index,
                        result: bytes,
                    }),
                    Err(message) => Err(RaftError::Application(message)),
                });
                let _ = reply.send(response);
            }
            (PendingReply::Query(reply), ApplyOutcome::Query(result)) => {
                let response = result.map(|bytes| QueryResponse {
                    index,
                    result: bytes,
                });
                let _ = reply.send(response);
            }
            (pending, outcome) => {
                slog::warn!(self.logger, "Pending reply did not match outcome";
                    "index" => index, "outcome" => ?outcome);
                fail_single(pending, RaftError::ProtocolError("outcome mismatch".into()));
            }
        }
    }

    fn complete_config(&mut self, index: LogIndex) {
        let Some(leader) = self.leader.as_mut() else {
            return;
        };
        let Some((pending_index, reply)) = leader.pending_config.take() else {
            return;
        };
        if pending_index != index {
            leader.pending_config = Some((pending_index, reply));
            return;
        }
        let members = self.cluster.current().members.clone();
        match reply {
            ConfigReply::Join(reply) => {
                let _ = reply.send(Ok(JoinResponse { index, members }));
            }
            ConfigReply::Leave(reply) => {
                let _ = reply.send(Ok(LeaveResponse { index, members }));
            }
            ConfigReply::Reconfigure(reply) => {
                let _ = reply.send(Ok(ReconfigureResponse { index, members }));
            }
        }
    }

    /// Pushes freshly published events to their sessions' clients. Only
    /// the leader pushes; followers buffer silently.
    pub(crate) fn publish_events(&mut self, events: Vec<(SessionId, Event)>) {
        if self.role != RoleKind::Leader || events.is_empty() {
            return;
        }
        let mut by_session: HashMap<SessionId, Vec<Event>> = HashMap::new();
        for (session, event) in events {
            by_session.entry(session).or_default().push(event);
        }
        for (session, events) in by_session {
            self.protocol.publish(PublishRequest { session, events });
        }
    }

    /// Re-pushes all unacknowledged events for a session; used after
    /// keep-alives so reconnecting clients receive replays.
    pub(crate) fn republish_session_events(&mut self, session: SessionId) {
        if self.role != RoleKind::Leader {
            return;
        }
        if let Some(state) = self.applier.registry().get(session) {
            let events = state.events_after(0);
            if !events.is_empty() {
                self.protocol.publish(PublishRequest { session, events });
            }
        }
    }

    fn maybe_snapshot(&mut self) {
        let applied = self.applier.applied_index();
        if applied < self.last_snapshot_index + self.config.storage.compaction_threshold {
            return;
        }
        match self.take_snapshot(applied) {
            Ok(()) => {
                self.last_snapshot_index = applied;
            }
            Err(err) => {
                slog::error!(self.logger, "Snapshot failed"; "error" => %err, "index" => applied);
            }
        }
    }

    fn take_snapshot(&mut self, applied: LogIndex) -> Result<()> {
        let envelope = SnapshotEnvelope {
            configuration: self.cluster.current().clone(),
            state: self.applier.snapshot_with_term(self.last_applied_term)?,
        };
        let data = serde_json::to_vec(&envelope)?;
        let snapshot = self
            .snapshots
            .new_snapshot(applied, self.last_applied_timestamp)?;
        let mut writer = snapshot.writer()?;
        writer.write(&data)?;
        writer.close()?;
        snapshot.complete()?;
        self.snapshots.prune()?;
        self.log
            .compact(applied + 1)
            .map_err(|e| RaftError::Compaction(e.to_string()))?;
        slog::info!(self.logger, "Snapshot taken";
            "index" => applied, "bytes" => data.len());
        Ok(())
    }
}

/// Fails every pending future held by a leader that is stepping down.
fn fail_pending(leader: LeaderState, error: RaftError) {
    for (_, pending) in leader.pending {
        fail_single(pending, error.clone());
    }
    if let Some((_, config)) = leader.pending_config {
        match config {
            ConfigReply::Join(reply) => {
                let _ = reply.send(Err(error.clone()));
            }
            ConfigReply::Leave(reply) => {
                let _ = reply.send(Err(error.clone()));
            }
            ConfigReply::Reconfigure(reply) => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

fn fail_single(pending: PendingReply, error: RaftError) {
    match pending {
        PendingReply::Open(reply) => {
            let _ = reply.send(Err(error));
        }
        PendingReply::Close(reply) => {
            let _ = reply.send(Err(error));
        }
        PendingReply::KeepAlive(reply) => {
            let _ = reply.send(Err(error));
        }
        PendingReply::Command(reply) => {
            let _ = reply.send(Err(error));
        }
        PendingReply::Query(reply) => {
            let _ = reply.send(Err(error));
        }
    }
}

/// Builds a log entry stamped with the current wall clock; only the
/// leader calls this, so timestamps are single-sourced.
pub(crate) fn stamped(term: Term, kind: EntryKind) -> LogEntry {
    LogEntry::new(term, unix_millis(), kind)
}
