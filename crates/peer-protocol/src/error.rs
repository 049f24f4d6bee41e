//! Error types for the connection layer.

use std::io;

use thiserror::Error;

/// Why `Connection::send` rejected a payload.
///
/// Each variant calls for a different recovery: `Closed` means the session
/// is gone, `QueueFull` is transient backpressure, and `PayloadTooLarge`
/// will fail again no matter how often it is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("send to closed connection")]
    Closed,

    #[error("send queue full ({capacity} payloads pending)")]
    QueueFull { capacity: usize },

    #[error("payload of {len} bytes exceeds maximum frame size of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Startup-time configuration errors. The process should not continue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("acceptor already registered: {0}")]
    DuplicateAcceptor(String),

    #[error("no acceptor registered under name: {0}")]
    UnknownAcceptor(String),

    #[error("invalid listen address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("expected a path in websocket listen address: {0}")]
    MissingPath(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors that end an acceptor's `start` call.
#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("http server failed: {0}")]
    Serve(#[source] io::Error),

    #[error("acceptor already started")]
    AlreadyStarted,
}

/// Returned by `ConnectionCallback::on_receive` to have the framework close
/// the session's connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CallbackError {
    pub message: String,
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<SendError> for CallbackError {
    fn from(err: SendError) -> Self {
        Self::new(err.to_string())
    }
}
