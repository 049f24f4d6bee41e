//! Protocol constants and connection configuration.
//!
//! The constants must match the deployed peers exactly. `ConnectionConfig`
//! defaults to them; other values are only meant for tests and for
//! deployments that control both ends.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Time allowed to write a single payload or heartbeat to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(20);

/// Time allowed between two reads before the peer is considered dead.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Heartbeat period, 9/10 of `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(60 * 9 / 10);

/// Largest payload accepted by `send`, and the TCP read buffer size.
pub const MAX_FRAME_LEN: usize = 16 * 1024;

/// Outbound payloads a connection buffers before `send` reports backpressure.
pub const SEND_QUEUE_CAPACITY: usize = 16;

/// Bound on a single accept call, so the accept loop wakes up periodically.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection deadlines and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Write deadline for payloads and heartbeats
    pub write_timeout: Duration,
    /// Read deadline, reset on every successful read
    pub read_timeout: Duration,
    /// Interval between heartbeats
    pub ping_period: Duration,
    /// Maximum payload size in bytes
    pub max_frame_len: usize,
    /// Capacity of the outbound queue
    pub send_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_timeout: WRITE_WAIT,
            read_timeout: PONG_WAIT,
            ping_period: PING_PERIOD,
            max_frame_len: MAX_FRAME_LEN,
            send_queue_capacity: SEND_QUEUE_CAPACITY,
        }
    }
}

impl ConnectionConfig {
    /// Set the idle deadline and derive the heartbeat period from it (9/10).
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.read_timeout = idle;
        self.ping_period = idle * 9 / 10;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_len == 0 {
            return Err(ConfigError::InvalidConfig("max_frame_len must be non-zero".into()));
        }
        if self.send_queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "send_queue_capacity must be non-zero".into(),
            ));
        }
        if self.write_timeout.is_zero() || self.ping_period.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "write_timeout and ping_period must be non-zero".into(),
            ));
        }
        // A heartbeat at or past the read deadline can never keep the peer alive.
        if self.ping_period >= self.read_timeout {
            return Err(ConfigError::InvalidConfig(format!(
                "ping_period ({:?}) must be shorter than read_timeout ({:?})",
                self.ping_period, self.read_timeout
            )));
        }
        Ok(())
    }
}

/// Configuration shared by every acceptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptorConfig {
    /// Settings applied to each accepted connection
    pub connection: ConnectionConfig,
    /// Bound on a single accept call (TCP only)
    pub accept_timeout: Duration,
    /// Reject new connections once this many sessions are live
    pub max_sessions: Option<usize>,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            accept_timeout: ACCEPT_TIMEOUT,
            max_sessions: None,
        }
    }
}

impl AcceptorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accept_timeout.is_zero() {
            return Err(ConfigError::InvalidConfig("accept_timeout must be non-zero".into()));
        }
        self.connection.validate()
    }
}
