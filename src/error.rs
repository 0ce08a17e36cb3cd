//! Error types shared across the server, storage, and client layers.

use thiserror::Error;

use crate::MemberId;

/// Result type for quoraft operations.
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors surfaced by servers and the client proxy.
///
/// Routable errors (`NoLeader`, `NotLeader`, `Unavailable`, `Timeout`)
/// are retried by the client with backoff; terminal errors are surfaced
/// to the caller unchanged.
#[derive(Debug, Clone, Error)]
pub enum RaftError {
    /// The addressed server is not a member of the cluster.
    #[error("not a cluster member")]
    IllegalMember,

    /// No leader is currently known.
    #[error("no leader available")]
    NoLeader,

    /// The addressed server is not the leader.
    #[error("not the leader")]
    NotLeader {
        /// Hint to the current leader, if this server knows one.
        leader: Option<MemberId>,
    },

    /// The session does not exist on any replica.
    #[error("unknown session {0}")]
    UnknownSession(u64),

    /// The session was closed or expired.
    #[error("session {0} is closed")]
    ClosedSession(u64),

    /// The state machine does not understand the submitted operation.
    #[error("unknown command")]
    UnknownCommand,

    /// Malformed or internally inconsistent request.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Error raised by the user state machine while applying a command.
    /// Wrapped into the command response; log state is unaffected.
    #[error("application error: {0}")]
    Application(String),

    /// Transient condition (transport failure, leadership in flux,
    /// storage backpressure).
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    /// Persistent storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Log compaction failure.
    #[error("compaction error: {0}")]
    Compaction(String),

    /// An outstanding request exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// The server or client was shut down.
    #[error("shut down")]
    Shutdown,
}

impl RaftError {
    /// Whether the client proxy may retry the operation elsewhere.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NoLeader
                | RaftError::NotLeader { .. }
                | RaftError::Unavailable(_)
                | RaftError::Timeout
        )
    }

    /// Whether the error must be surfaced to the caller without retry.
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }
}

impl From<std::io::Error> for RaftError {
    fn from(err: std::io::Error) -> Self {
        RaftError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(err: serde_json::Error) -> Self {
        RaftError::ProtocolError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RaftError::NoLeader.is_retryable());
        assert!(RaftError::NotLeader { leader: Some(2) }.is_retryable());
        assert!(RaftError::Unavailable("busy".into()).is_retryable());
        assert!(RaftError::Timeout.is_retryable());

        assert!(RaftError::UnknownSession(7).is_terminal());
        assert!(RaftError::ClosedSession(7).is_terminal());
        assert!(RaftError::ProtocolError("bad".into()).is_terminal());
        assert!(RaftError::Application("boom".into()).is_terminal());
    }
}
