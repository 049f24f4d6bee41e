//! Peer Session Layer
//!
//! Transport-agnostic connection management:
//! - `Connection` capability and the shared `ConnectionCore` state machine
//!   (bounded outbound queue, one-shot close gate)
//! - `Session` (connection + concurrent key/value store)
//! - `SessionManager` (identity assignment, lookup, dispatch, close notification)
//! - `Acceptor` capability and the named `AcceptorRegistry`
//!
//! Concrete transports live in `peer-transport`.

pub mod acceptor;
pub mod callback;
pub mod connection;
pub mod manager;
pub mod session;

pub use acceptor::{Acceptor, AcceptorDyn, AcceptorRegistry};
pub use callback::ConnectionCallback;
pub use connection::{Connection, ConnectionCore, ConnectionState};
pub use manager::SessionManager;
pub use session::Session;

pub use peer_protocol::SessionId;
