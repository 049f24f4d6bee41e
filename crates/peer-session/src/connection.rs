//! Connection capability and the state shared by every transport.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use bytes::Bytes;
use peer_protocol::{ConnectionConfig, SendError, SessionId};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

use crate::manager::SessionManager;

/// The minimal contract a transport connection satisfies.
///
/// All methods are callable from any thread or task; none of them block.
pub trait Connection: Send + Sync + 'static {
    /// Queue a payload for asynchronous delivery.
    fn send(&self, payload: Bytes) -> Result<(), SendError>;
    /// Request shutdown. Idempotent.
    fn close(&self);
    fn id(&self) -> SessionId;
    fn remote_addr(&self) -> &str;
    fn is_closed(&self) -> bool;
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Resources allocated, loops not started
    Created = 0,
    /// Receive and send loops active
    Running = 1,
    /// Close gate passed, loops unwinding
    Closing = 2,
    /// Session unregistered and every loop exited, socket released
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Transport-independent half of a connection: identity, bounded outbound
/// queue, lifecycle state, and the close signal observed by both loops.
///
/// The transport owns the receiving end of the queue (returned by `new`)
/// and the socket; everything else goes through the core.
pub struct ConnectionCore {
    id: SessionId,
    remote_addr: String,
    config: ConnectionConfig,
    tx: mpsc::Sender<Bytes>,
    state: AtomicU8,
    /// Loops still holding a socket half
    loops: AtomicUsize,
    shutdown: CancellationToken,
    manager: Weak<SessionManager>,
}

impl ConnectionCore {
    pub fn new(
        id: SessionId,
        remote_addr: impl Into<String>,
        config: ConnectionConfig,
        manager: Weak<SessionManager>,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(config.send_queue_capacity);
        let core = Self {
            id,
            remote_addr: remote_addr.into(),
            config,
            tx,
            state: AtomicU8::new(ConnectionState::Created as u8),
            loops: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            manager,
        };
        (core, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The owning manager, unless it has been dropped.
    pub fn manager(&self) -> Option<Arc<SessionManager>> {
        self.manager.upgrade()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() >= ConnectionState::Closing
    }

    /// Move `Created → Running`. Returns false if the connection was already
    /// started or closed.
    pub fn mark_running(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Created as u8,
                ConnectionState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move `Created → Running` with `loops` tasks about to be spawned. Each
    /// of them must call `loop_exited` after releasing its socket half; the
    /// last one moves the connection to `Closed`.
    pub fn mark_running_with(&self, loops: usize) -> bool {
        self.loops.store(loops, Ordering::Release);
        if self.mark_running() {
            return true;
        }
        self.loops.store(0, Ordering::Release);
        self.finish_if_idle();
        false
    }

    /// Called by a loop on its way out: runs the close sequence, then
    /// completes it if this was the last loop.
    pub fn loop_exited(&self) {
        self.close();
        if self.loops.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish_if_idle();
        }
    }

    /// Non-blocking enqueue. Only a running connection accepts payloads.
    pub fn send(&self, payload: Bytes) -> Result<(), SendError> {
        if self.state() != ConnectionState::Running {
            return Err(SendError::Closed);
        }
        if payload.len() > self.config.max_frame_len {
            return Err(SendError::PayloadTooLarge {
                len: payload.len(),
                max: self.config.max_frame_len,
            });
        }
        match self.tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::QueueFull {
                capacity: self.config.send_queue_capacity,
            }),
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Run the close sequence. Only the first caller passes the gate and
    /// gets `true`; every later or concurrent caller gets `false`.
    ///
    /// Cancelling the close signal makes both loops exit and drop their
    /// socket halves; the session is then removed from the manager, which
    /// schedules the application's `on_closed`. The state stays `Closing`
    /// until the last loop has exited.
    pub fn close(&self) -> bool {
        let gate = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            (s < ConnectionState::Closing as u8).then_some(ConnectionState::Closing as u8)
        });
        if gate.is_err() {
            return false;
        }

        debug!("Closing connection {} ({})", self.id, self.remote_addr);
        self.shutdown.cancel();

        if let Some(manager) = self.manager.upgrade() {
            manager.remove(self.id);
        }
        self.finish_if_idle();
        true
    }

    fn finish_if_idle(&self) {
        if self.loops.load(Ordering::Acquire) == 0 {
            let _ = self.state.compare_exchange(
                ConnectionState::Closing as u8,
                ConnectionState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Resolves once the close sequence has started.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// A handle on the close signal for tasks that cannot borrow the core.
    pub fn close_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
