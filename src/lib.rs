//! quoraft: a Raft-based replicated state machine framework.
//!
//! A cluster of [`server::RaftServer`]s agrees on an ordered log of
//! opaque commands, applies them to a user-supplied
//! [`server::StateMachine`], and serves clients through a
//! session-oriented proxy ([`client::RaftClient`]) with exactly-once
//! commands, keep-alive lease renewal, and ordered event delivery.
//!
//! The wire transport is pluggable; [`protocol::LocalNetwork`] provides
//! an in-process implementation used by the tests and by embedded
//! deployments.

pub mod client;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod protocol;
pub mod server;
pub mod storage;

/// Server identifier, unique within a cluster.
pub type MemberId = u64;
/// Election epoch; increases monotonically.
pub type Term = u64;
/// Log position; dense and strictly increasing from 1.
pub type LogIndex = u64;
/// Session identifier: the log index of its `open-session` entry.
pub type SessionId = u64;

pub use client::{CommunicationStrategy, RaftClient, RaftClientBuilder};
pub use cluster::{Configuration, Member, MemberKind};
pub use config::{ServerConfig, Storage, StorageLevel};
pub use error::{RaftError, Result};
pub use protocol::{Consistency, LocalNetwork, RaftProtocol};
pub use server::{
    ApplyContext, RaftServer, RoleChange, RoleKind, SessionEvent, StateMachine, StateMachineError,
};
