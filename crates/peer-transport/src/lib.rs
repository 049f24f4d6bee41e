//! Peer Transport Layer
//!
//! Concrete transports for the session layer:
//! - `tcp`: raw stream sockets, fixed-buffer reads, empty-write heartbeat
//! - `ws`: WebSocket over an axum HTTP upgrade, ping/pong heartbeat
//!
//! Each transport provides a `Connection` (receive loop + send loop per
//! socket) and an `Acceptor`. `register_default_acceptors` installs both
//! under their conventional names.

pub mod tcp;
pub mod ws;

use std::sync::Arc;

use peer_protocol::{AcceptorConfig, ConfigError};
use peer_session::AcceptorRegistry;

pub use tcp::{TcpAcceptor, TcpConnection};
pub use ws::{WsAcceptor, WsConnection};

/// Registry name of the TCP acceptor.
pub const TCP: &str = "tcp";
/// Registry name of the WebSocket acceptor.
pub const WS: &str = "ws";

/// Register the TCP and WebSocket acceptors, both configured with `config`.
pub fn register_default_acceptors(
    registry: &mut AcceptorRegistry,
    config: &AcceptorConfig,
) -> Result<(), ConfigError> {
    config.validate()?;
    registry.register(TCP, Arc::new(TcpAcceptor::new(config.clone())))?;
    registry.register(WS, Arc::new(WsAcceptor::new(config.clone())))?;
    Ok(())
}
