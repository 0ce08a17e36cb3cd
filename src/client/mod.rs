//! Session-oriented client proxy.
//!
//! A [`RaftClient`] opens a server-side session, routes commands to the
//! leader and queries according to their consistency mode, renews its
//! lease with periodic keep-alives, and delivers published events to
//! registered listeners in order. Retryable failures are retried with
//! exponential backoff capped at the session timeout; terminal errors
//! surface unchanged.

pub mod strategy;

pub use strategy::CommunicationStrategy;

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use slog::{Drain, Logger};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::context::{Scheduled, ThreadContext};
use crate::error::{RaftError, Result};
use crate::protocol::message::*;
use crate::protocol::transport::RaftProtocol;
use crate::{LogIndex, MemberId, SessionId};

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Builder for [`RaftClient`].
pub struct RaftClientBuilder {
    members: Vec<MemberId>,
    client_id: Option<String>,
    session_timeout: Duration,
    strategy: CommunicationStrategy,
    logger: Option<Logger>,
}

impl RaftClientBuilder {
    pub fn new(members: Vec<MemberId>) -> Self {
        Self {
            members,
            client_id: None,
            session_timeout: Duration::from_secs(5),
            strategy: CommunicationStrategy::Any,
            logger: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_strategy(mut self, strategy: CommunicationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Opens the session and starts keep-alives and event delivery.
    pub async fn connect(self, protocol: Arc<dyn RaftProtocol>) -> Result<RaftClient> {
        let client_id = self
            .client_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let logger = self.logger.unwrap_or_else(|| {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, slog::o!("client" => client_id.clone()))
        });

        let inner = Arc::new(ClientInner {
            client_id: client_id.clone(),
            protocol,
            logger,
            session_timeout: self.session_timeout,
            strategy: self.strategy,
            state: Mutex::new(ClientState {
                session: 0,
                members: self.members,
                leader: None,
                sequence: 0,
                acked_sequence: 0,
                event_index: 0,
                last_index: 0,
            }),
            command_lock: Mutex::new(()),
            event_handlers: StdMutex::new(Vec::new()),
        });

        // Open the session through whichever member leads.
        let timeout_ms = self.session_timeout.as_millis() as u64;
        let open = {
            let inner = Arc::clone(&inner);
            let client = client_id.clone();
            inner
                .clone()
                .retry_submit(move |to| {
                    let inner = Arc::clone(&inner);
                    let client = client.clone();
                    async move {
                        let request = OpenSessionRequest::builder()
                            .client(client)
                            .timeout_ms(timeout_ms)
                            .build()?;
                        inner.protocol.open_session(to, request).await
                    }
                })
                .await?
        };

        {
            let mut state = inner.state.lock().await;
            state.session = open.session;
            state.leader = open.leader;
            if !open.members.is_empty() {
                state.members = open.members.clone();
            }
            state.last_index = open.session;
        }
        slog::info!(inner.logger, "Session opened";
            "session" => open.session, "timeout_ms" => open.timeout_ms);

        // Event subscription: deliver in order, deduplicating replays
        // by event index.
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        inner.protocol.register_listener(open.session, event_tx);
        tokio::spawn(RaftClient::run_event_pump(Arc::clone(&inner), event_rx));

        // Keep-alive schedule at a quarter of the session timeout,
        // driven through the proxy's thread context.
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let context = ThreadContext::new(task_tx);
        let interval = self.session_timeout / 4;
        let keep_alive_timer = context.schedule_periodic(interval, interval, || ClientTask::KeepAlive);
        tokio::spawn(RaftClient::run_tasks(Arc::clone(&inner), task_rx));

        Ok(RaftClient {
            inner,
            context,
            keep_alive_timer,
        })
    }
}

enum ClientTask {
    KeepAlive,
    Stop,
}

struct ClientState {
    session: SessionId,
    members: Vec<MemberId>,
    leader: Option<MemberId>,
    /// Last command sequence assigned.
    sequence: u64,
    /// Highest sequence whose response arrived; acknowledged through
    /// keep-alives so the server can evict its cache.
    acked_sequence: u64,
    /// Highest event index received, acknowledged the same way.
    event_index: u64,
    /// Highest log index observed in responses; attached to queries.
    last_index: LogIndex,
}

struct ClientInner {
    client_id: String,
    protocol: Arc<dyn RaftProtocol>,
    logger: Logger,
    session_timeout: Duration,
    strategy: CommunicationStrategy,
    state: Mutex<ClientState>,
    /// Serializes command submission so sequences arrive in order.
    command_lock: Mutex<()>,
    event_handlers: StdMutex<Vec<Box<dyn Fn(Vec<u8>) + Send + 'static>>>,
}

impl ClientInner {
    /// Runs `call` against cluster members until it succeeds, a
    /// terminal error surfaces, or the backoff budget (one session
    /// timeout) is exhausted. Leader hints from `NotLeader` responses
    /// redirect the next attempt.
    async fn retry_submit<T, F, Fut>(self: Arc<Self>, mut call: F) -> Result<T>
    where
        F: FnMut(MemberId) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = Instant::now() + self.session_timeout;
        let mut backoff = INITIAL_BACKOFF;
        let mut last_error = RaftError::NoLeader;

        loop {
            let targets = {
                let state = self.state.lock().await;
                let mut targets = self.strategy.order(&state.members, state.leader);
                if targets.is_empty() {
                    targets = state.members.clone();
                }
                targets
            };

            let mut redirected = false;
            for to in targets {
                match call(to).await {
                    Ok(value) => return Ok(value),
                    Err(RaftError::NotLeader {
                        leader: Some(leader),
                    }) => {
                        self.state.lock().await.leader = Some(leader);
                        last_error = RaftError::NotLeader {
                            leader: Some(leader),
                        };
                        redirected = true;
                        break;
                    }
                    Err(err) if err.is_retryable() => {
                        last_error = err;
                    }
                    Err(err) => return Err(err),
                }
            }
            if redirected {
                continue;
            }

            if Instant::now() + backoff >= deadline {
                return Err(last_error);
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.session_timeout);
        }
    }

    async fn send_keep_alive(self: Arc<Self>) {
        let (session, command_sequence, event_index) = {
            let state = self.state.lock().await;
            (state.session, state.acked_sequence, state.event_index)
        };
        let protocol = Arc::clone(&self.protocol);
        let result = Arc::clone(&self)
            .retry_submit(move |to| {
                let protocol = Arc::clone(&protocol);
                async move {
                    let request = KeepAliveRequest::builder()
                        .session(session)
                        .command_sequence(command_sequence)
                        .event_index(event_index)
                        .build()?;
                    protocol.keep_alive(to, request).await
                }
            })
            .await;
        match result {
            Ok(response) => {
                let mut state = self.state.lock().await;
                state.leader = response.leader;
                if !response.members.is_empty() {
                    state.members = response.members;
                }
            }
            Err(err) => {
                slog::warn!(self.logger, "Keep-alive failed"; "error" => %err);
            }
        }
    }
}

/// A connected client session.
pub struct RaftClient {
    inner: Arc<ClientInner>,
    context: ThreadContext<ClientTask>,
    keep_alive_timer: Scheduled,
}

impl RaftClient {
    /// Starts building a client against the given member set.
    pub fn builder(members: Vec<MemberId>) -> RaftClientBuilder {
        RaftClientBuilder::new(members)
    }

    pub async fn session_id(&self) -> SessionId {
        self.inner.state.lock().await.session
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Submits a command for linearizable, exactly-once execution.
    pub async fn submit_command(&self, operation: Vec<u8>) -> Result<Vec<u8>> {
        let _guard = self.inner.command_lock.lock().await;
        let (session, sequence) = {
            let mut state = self.inner.state.lock().await;
            state.sequence += 1;
            (state.session, state.sequence)
        };

        let response = {
            let inner = Arc::clone(&self.inner);
            let protocol = Arc::clone(&self.inner.protocol);
            inner
                .retry_submit(move |to| {
                    let protocol = Arc::clone(&protocol);
                    let operation = operation.clone();
                    async move {
                        let request = CommandRequest::builder()
                            .session(session)
                            .sequence(sequence)
                            .operation(operation)
                            .build()?;
                        protocol.command(to, request).await
                    }
                })
                .await?
        };

        let mut state = self.inner.state.lock().await;
        state.acked_sequence = state.acked_sequence.max(sequence);
        state.last_index = state.last_index.max(response.index);
        Ok(response.result)
    }

    /// Submits a query with the requested consistency mode.
    pub async fn submit_query(
        &self,
        operation: Vec<u8>,
        consistency: Consistency,
    ) -> Result<Vec<u8>> {
        let (session, sequence, last_index) = {
            let state = self.inner.state.lock().await;
            (state.session, state.sequence, state.last_index)
        };

        let response = {
            let inner = Arc::clone(&self.inner);
            let protocol = Arc::clone(&self.inner.protocol);
            inner
                .retry_submit(move |to| {
                    let protocol = Arc::clone(&protocol);
                    let operation = operation.clone();
                    async move {
                        let request = QueryRequest::builder()
                            .session(session)
                            .sequence(sequence)
                            .last_index(last_index)
                            .operation(operation)
                            .consistency(consistency)
                            .build()?;
                        protocol.query(to, request).await
                    }
                })
                .await?
        };

        let mut state = self.inner.state.lock().await;
        state.last_index = state.last_index.max(response.index);
        Ok(response.result)
    }

    /// Registers an ordered event listener. Events published by the
    /// state machine to this session arrive exactly once, in index
    /// order.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(Vec<u8>) + Send + 'static,
    {
        self.inner.event_handlers.lock().unwrap().push(Box::new(handler));
    }

    /// Fetches the cluster's leader and member list from any reachable
    /// server.
    pub async fn metadata(&self) -> Result<MetadataResponse> {
        let inner = Arc::clone(&self.inner);
        let protocol = Arc::clone(&self.inner.protocol);
        let response = inner
            .retry_submit(move |to| {
                let protocol = Arc::clone(&protocol);
                async move { protocol.metadata(to, MetadataRequest {}).await }
            })
            .await?;
        let mut state = self.inner.state.lock().await;
        state.leader = response.leader;
        Ok(response)
    }

    /// Closes the session and stops keep-alives.
    pub async fn close(self) -> Result<()> {
        self.context.submit(ClientTask::Stop);
        self.keep_alive_timer.cancel();

        let session = self.inner.state.lock().await.session;
        self.inner.protocol.unregister_listener(session);

        let inner = Arc::clone(&self.inner);
        let protocol = Arc::clone(&self.inner.protocol);
        inner
            .retry_submit(move |to| {
                let protocol = Arc::clone(&protocol);
                async move {
                    protocol
                        .close_session(to, CloseSessionRequest::new(session))
                        .await
                }
            })
            .await?;
        slog::info!(self.inner.logger, "Session closed"; "session" => session);
        Ok(())
    }

    async fn run_event_pump(
        inner: Arc<ClientInner>,
        mut event_rx: mpsc::UnboundedReceiver<PublishRequest>,
    ) {
        while let Some(publish) = event_rx.recv().await {
            for event in publish.events {
                let fresh = {
                    let mut state = inner.state.lock().await;
                    if event.index > state.event_index {
                        state.event_index = event.index;
                        true
                    } else {
                        false
                    }
                };
                if fresh {
                    let handlers = inner.event_handlers.lock().unwrap();
                    for handler in handlers.iter() {
                        handler(event.payload.clone());
                    }
                }
            }
        }
    }

    async fn run_tasks(inner: Arc<ClientInner>, mut task_rx: mpsc::UnboundedReceiver<ClientTask>) {
        while let Some(task) = task_rx.recv().await {
            match task {
                ClientTask::KeepAlive => Arc::clone(&inner).send_keep_alive().await,
                ClientTask::Stop => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = RaftClient::builder(vec![1, 2, 3])
            .with_session_timeout(Duration::from_millis(800))
            .with_strategy(CommunicationStrategy::LeaderOnly)
            .with_client_id("tester");
        assert_eq!(builder.session_timeout, Duration::from_millis(800));
        assert_eq!(builder.strategy, CommunicationStrategy::LeaderOnly);
        assert_eq!(builder.client_id.as_deref(), Some("tester"));
    }
}
