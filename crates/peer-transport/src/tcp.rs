//! Raw TCP transport.
//!
//! No framing is applied to the stream: every read fills a fresh, zeroed
//! buffer of `max_frame_len` bytes and the whole buffer, unfilled tail
//! included, is dispatched as one payload. Peers that need message
//! boundaries must delimit payloads themselves.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use peer_protocol::{AcceptorConfig, AcceptorError, ConnectionConfig, SendError, SessionId};
use peer_session::{Acceptor, Connection, ConnectionCore, SessionManager};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type PendingIo = (OwnedReadHalf, OwnedWriteHalf, mpsc::Receiver<Bytes>);

/// A TCP socket wrapped as a `Connection`.
pub struct TcpConnection {
    core: ConnectionCore,
    /// Socket halves and queue receiver, taken by `start`
    io: Mutex<Option<PendingIo>>,
}

impl TcpConnection {
    pub fn new(
        id: SessionId,
        stream: TcpStream,
        peer: SocketAddr,
        manager: Weak<SessionManager>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {peer}: {e}");
        }
        let (reader, writer) = stream.into_split();
        let (core, rx) = ConnectionCore::new(id, peer.to_string(), config, manager);
        Arc::new(Self {
            core,
            io: Mutex::new(Some((reader, writer, rx))),
        })
    }

    /// Spawn the receive and send loops. Call once, after the connection
    /// has been registered with the manager.
    pub fn start(self: &Arc<Self>) {
        let Some((reader, writer, rx)) = self.io.lock().take() else {
            return;
        };
        if !self.core.mark_running_with(2) {
            // Closed before it ever ran; dropping the halves releases the socket.
            return;
        }
        tokio::spawn(self.clone().recv_loop(reader));
        tokio::spawn(self.clone().send_loop(writer, rx));
    }

    async fn recv_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let id = self.core.id();
        let read_timeout = self.core.config().read_timeout;
        let frame_len = self.core.config().max_frame_len;
        let mut deadline = Instant::now() + read_timeout;

        loop {
            let mut buf = BytesMut::zeroed(frame_len);
            let read = tokio::select! {
                _ = self.core.closed() => break,
                read = time::timeout_at(deadline, reader.read(&mut buf[..])) => read,
            };
            match read {
                Ok(Ok(0)) => {
                    debug!("Session {id}: peer closed the stream");
                    break;
                }
                Ok(Ok(_)) => {
                    deadline = Instant::now() + read_timeout;
                    let Some(manager) = self.core.manager() else {
                        break;
                    };
                    manager.dispatch(id, buf.freeze());
                }
                Ok(Err(e)) => {
                    debug!("Session {id}: read failed: {e}");
                    break;
                }
                Err(_) => {
                    debug!("Session {id}: read deadline expired after {read_timeout:?}");
                    break;
                }
            }
        }

        drop(reader);
        debug!("recv loop closed: session {id}");
        self.core.loop_exited();
    }

    async fn send_loop(self: Arc<Self>, mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
        let id = self.core.id();
        let config = self.core.config().clone();
        let mut heartbeat =
            time::interval_at(Instant::now() + config.ping_period, config.ping_period);

        loop {
            tokio::select! {
                _ = self.core.closed() => break,
                payload = rx.recv() => {
                    let Some(payload) = payload else { break };
                    if let Err(e) = write_with_deadline(&mut writer, &payload, config.write_timeout).await {
                        debug!("Session {id}: write failed: {e}");
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = send_heartbeat(&mut writer, config.write_timeout).await {
                        debug!("Session {id}: heartbeat failed: {e}");
                        break;
                    }
                }
            }
        }

        let _ = time::timeout(config.write_timeout, writer.shutdown()).await;
        drop(writer);
        debug!("send loop closed: session {id}");
        self.core.loop_exited();
    }
}

impl Connection for TcpConnection {
    fn send(&self, payload: Bytes) -> Result<(), SendError> {
        self.core.send(payload)
    }

    fn close(&self) {
        self.core.close();
    }

    fn id(&self) -> SessionId {
        self.core.id()
    }

    fn remote_addr(&self) -> &str {
        self.core.remote_addr()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

async fn write_with_deadline(
    writer: &mut OwnedWriteHalf,
    buf: &[u8],
    limit: Duration,
) -> io::Result<()> {
    match time::timeout(limit, writer.write_all(buf)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "write deadline exceeded",
        )),
    }
}

/// Raw TCP has no control frames; the probe is a zero-length write. It must
/// be a single `write` call: `write_all` returns early on an empty buffer and
/// never touches the socket, so a reset peer would go unnoticed.
async fn send_heartbeat(writer: &mut OwnedWriteHalf, limit: Duration) -> io::Result<()> {
    match time::timeout(limit, writer.write(&[])).await {
        Ok(result) => result.map(|_| ()),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "heartbeat deadline exceeded",
        )),
    }
}

/// Errors after which the accept loop keeps going. Besides timeouts this
/// covers connections that died in the backlog, which only affect that
/// one client.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Acceptor
// ─────────────────────────────────────────────────────────────────────────────

/// Listens on a TCP address and registers every accepted socket.
pub struct TcpAcceptor {
    config: AcceptorConfig,
    addr: Mutex<String>,
    local_addr: Mutex<Option<SocketAddr>>,
    started: AtomicBool,
    stop: CancellationToken,
}

impl TcpAcceptor {
    pub fn new(config: AcceptorConfig) -> Self {
        Self {
            config,
            addr: Mutex::new(String::new()),
            local_addr: Mutex::new(None),
            started: AtomicBool::new(false),
            stop: CancellationToken::new(),
        }
    }

    fn register(&self, stream: TcpStream, peer: SocketAddr, manager: &Arc<SessionManager>) {
        if let Some(max) = self.config.max_sessions {
            if manager.live_count() >= max {
                warn!("Connection from {peer} rejected: max sessions reached ({max})");
                return;
            }
        }

        let weak = Arc::downgrade(manager);
        let config = self.config.connection.clone();
        let conn = manager.add(|id| TcpConnection::new(id, stream, peer, weak, config));
        debug!("Accepted tcp client {peer} as session {}", conn.id());
        conn.start();
    }
}

impl Default for TcpAcceptor {
    fn default() -> Self {
        Self::new(AcceptorConfig::default())
    }
}

impl Acceptor for TcpAcceptor {
    async fn start(&self, addr: &str, manager: Arc<SessionManager>) -> Result<(), AcceptorError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(AcceptorError::AlreadyStarted);
        }
        self.config.validate()?;
        *self.addr.lock() = addr.to_string();

        let bind_err = |source| AcceptorError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local = listener.local_addr().map_err(bind_err)?;
        *self.local_addr.lock() = Some(local);
        info!("Listening tcp on {local}, waiting for connections");

        let result = loop {
            let accepted = tokio::select! {
                _ = self.stop.cancelled() => break Ok(()),
                accepted = time::timeout(self.config.accept_timeout, listener.accept()) => accepted,
            };
            match accepted {
                // Accept timeout: go around so a stop request is noticed.
                Err(_) => continue,
                Ok(Ok((stream, peer))) => self.register(stream, peer, &manager),
                Ok(Err(e)) if is_transient(&e) => {
                    debug!("Transient accept error on {local}: {e}");
                }
                Ok(Err(e)) => {
                    error!("Accept failed on {local}, stopping listener: {e}");
                    break Err(AcceptorError::Accept(e));
                }
            }
        };

        info!("Tcp acceptor on {local} stopped");
        result
    }

    fn describe(&self) -> String {
        match *self.local_addr.lock() {
            Some(local) => local.to_string(),
            None => self.addr.lock().clone(),
        }
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}
