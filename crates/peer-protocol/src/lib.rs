//! Peer connection layer: protocol constants and shared types.
//!
//! This crate is the single source of truth for the wire-level constants
//! (deadlines, heartbeat period, frame and queue limits), the tunable
//! connection configuration, and every error type surfaced by the session
//! and transport crates.

pub mod config;
pub mod error;

pub use config::{
    AcceptorConfig, ConnectionConfig, ACCEPT_TIMEOUT, MAX_FRAME_LEN, PING_PERIOD, PONG_WAIT,
    SEND_QUEUE_CAPACITY, WRITE_WAIT,
};
pub use error::{AcceptorError, CallbackError, ConfigError, SendError};

/// Identity of a session, assigned by the session manager.
pub type SessionId = i64;
