//! Shared helpers for the integration tests: a quiet logger, a small
//! key/value state machine, and cluster bootstrap utilities.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use slog::{Drain, Logger};

use quoraft::protocol::LocalNetwork;
use quoraft::server::{ApplyContext, RaftServer, StateMachine, StateMachineError};
use quoraft::{Member, MemberId, ServerConfig, Storage};

pub fn test_logger(name: &str) -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::sink());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!("node" => name.to_string()))
}

/// Key/value machine with counters and self-notification, enough to
/// exercise commands, queries, snapshots, and events.
///
/// Commands: `put <k> <v>`, `incr <k>`, `notify <payload>`.
/// Queries: `get <k>`.
pub struct KvStateMachine {
    data: HashMap<String, String>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }
}

impl StateMachine for KvStateMachine {
    fn apply(
        &mut self,
        operation: &[u8],
        context: &mut ApplyContext<'_>,
    ) -> Result<Vec<u8>, StateMachineError> {
        let text = String::from_utf8_lossy(operation).to_string();
        let mut parts = text.split_whitespace();
        match parts.next() {
            Some("put") => {
                let key = parts.next().ok_or("put: missing key")?.to_string();
                let value = parts.next().ok_or("put: missing value")?.to_string();
                self.data.insert(key, value);
                Ok(b"ok".to_vec())
            }
            Some("incr") => {
                let key = parts.next().ok_or("incr: missing key")?.to_string();
                let next = self
                    .data
                    .get(&key)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0)
                    + 1;
                self.data.insert(key, next.to_string());
                Ok(next.to_string().into_bytes())
            }
            Some("notify") => {
                let payload = parts.collect::<Vec<_>>().join(" ");
                let session = context.session;
                context.publish(session, payload.into_bytes())?;
                Ok(b"ok".to_vec())
            }
            other => Err(format!("unknown command: {:?}", other).into()),
        }
    }

    fn query(&self, operation: &[u8]) -> Result<Vec<u8>, StateMachineError> {
        let text = String::from_utf8_lossy(operation);
        let key = text.strip_prefix("get ").ok_or("unknown query")?;
        Ok(self.data.get(key.trim()).cloned().unwrap_or_default().into_bytes())
    }

    fn snapshot(&self) -> Result<Vec<u8>, StateMachineError> {
        Ok(serde_json::to_vec(&self.data)?)
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), StateMachineError> {
        self.data = serde_json::from_slice(data)?;
        Ok(())
    }
}

pub fn fast_config() -> ServerConfig {
    ServerConfig::new()
        .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_storage(Storage::memory())
}

/// Starts one server on the shared network and registers its handler.
pub async fn start_server(
    network: &LocalNetwork,
    id: MemberId,
    members: Vec<Member>,
    config: ServerConfig,
) -> RaftServer {
    let server = RaftServer::start_with_logger(
        id,
        members,
        network.protocol_for(id),
        Box::new(KvStateMachine::new()),
        config,
        test_logger(&format!("node-{}", id)),
    )
    .await
    .expect("server should start");
    network.register_server(id, Arc::new(server.clone()));
    server
}

/// Boots a cluster of active members with in-memory storage.
pub async fn start_cluster(network: &LocalNetwork, ids: &[MemberId]) -> Vec<RaftServer> {
    let members: Vec<Member> = ids.iter().map(|&id| Member::active(id)).collect();
    let mut servers = Vec::new();
    for &id in ids {
        servers.push(start_server(network, id, members.clone(), fast_config()).await);
    }
    servers
}

/// Waits until some server reports itself leader, returning its index.
pub async fn wait_for_leader(servers: &[RaftServer]) -> usize {
    for _ in 0..200 {
        for (slot, server) in servers.iter().enumerate() {
            if server.is_leader() {
                return slot;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("no leader elected within timeout");
}
