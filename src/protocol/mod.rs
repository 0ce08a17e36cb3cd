//! The client/server protocol: message types, the transport contract,
//! and the in-process transport.

pub mod local;
pub mod message;
pub mod transport;

pub use local::{LocalNetwork, LocalProtocol};
pub use message::*;
pub use transport::{RaftProtocol, RequestHandler, TransportError};
