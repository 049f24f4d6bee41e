//! WebSocket transport using Axum.
//!
//! The acceptor serves one upgrade path (taken from its listen URL) plus a
//! `/health` probe. Each upgraded socket becomes a `WsConnection`: one
//! payload per data frame, heartbeat via Ping control frames, and every
//! received Pong pushes the read deadline forward.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use parking_lot::Mutex;
use peer_protocol::{
    AcceptorConfig, AcceptorError, ConfigError, ConnectionConfig, SendError, SessionId,
};
use peer_session::{Acceptor, Connection, ConnectionCore, SessionManager};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// An upgraded WebSocket wrapped as a `Connection`.
pub struct WsConnection {
    core: ConnectionCore,
    /// Socket halves and queue receiver, taken by `start`
    io: Mutex<Option<(WsSink, WsStream, mpsc::Receiver<Bytes>)>>,
}

impl WsConnection {
    pub fn new(
        id: SessionId,
        socket: WebSocket,
        peer: SocketAddr,
        manager: Weak<SessionManager>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let (sink, stream) = socket.split();
        let (core, rx) = ConnectionCore::new(id, peer.to_string(), config, manager);
        Arc::new(Self {
            core,
            io: Mutex::new(Some((sink, stream, rx))),
        })
    }

    /// Spawn the receive and send loops. Call once, after the connection
    /// has been registered with the manager.
    pub fn start(self: &Arc<Self>) {
        let Some((sink, stream, rx)) = self.io.lock().take() else {
            return;
        };
        if !self.core.mark_running_with(2) {
            return;
        }
        tokio::spawn(self.clone().recv_loop(stream));
        tokio::spawn(self.clone().send_loop(sink, rx));
    }

    async fn recv_loop(self: Arc<Self>, mut stream: WsStream) {
        let id = self.core.id();
        let read_timeout = self.core.config().read_timeout;
        let mut deadline = Instant::now() + read_timeout;

        loop {
            let next = tokio::select! {
                _ = self.core.closed() => break,
                next = time::timeout_at(deadline, stream.next()) => next,
            };
            let msg = match next {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => {
                    debug!("Session {id}: websocket error: {e}");
                    break;
                }
                Ok(None) => {
                    debug!("Session {id}: websocket stream ended");
                    break;
                }
                Err(_) => {
                    debug!("Session {id}: read deadline expired after {read_timeout:?}");
                    break;
                }
            };

            let payload = match msg {
                Message::Binary(data) => data,
                Message::Text(text) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Message::Pong(_) | Message::Ping(_) => {
                    deadline = Instant::now() + read_timeout;
                    continue;
                }
                Message::Close(frame) => {
                    debug!("Session {id}: client sent close {frame:?}");
                    break;
                }
            };

            deadline = Instant::now() + read_timeout;
            let Some(manager) = self.core.manager() else {
                break;
            };
            manager.dispatch(id, payload);
        }

        drop(stream);
        debug!("recv loop closed: session {id}");
        self.core.loop_exited();
    }

    async fn send_loop(self: Arc<Self>, mut sink: WsSink, mut rx: mpsc::Receiver<Bytes>) {
        let id = self.core.id();
        let config = self.core.config().clone();
        let mut heartbeat =
            time::interval_at(Instant::now() + config.ping_period, config.ping_period);

        loop {
            let msg = tokio::select! {
                _ = self.core.closed() => break,
                payload = rx.recv() => match payload {
                    Some(payload) => Message::Binary(payload),
                    None => break,
                },
                _ = heartbeat.tick() => Message::Ping(Bytes::new()),
            };
            match time::timeout(config.write_timeout, sink.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("Session {id}: write failed: {e}");
                    break;
                }
                Err(_) => {
                    debug!("Session {id}: write deadline exceeded");
                    break;
                }
            }
        }

        let _ = time::timeout(config.write_timeout, sink.close()).await;
        drop(sink);
        debug!("send loop closed: session {id}");
        self.core.loop_exited();
    }
}

impl Connection for WsConnection {
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

// ─────────────────────────────────────────────────────────────────────────────
// Acceptor
// ─────────────────────────────────────────────────────────────────────────────

/// Serves WebSocket upgrades on the path of its listen URL.
///
/// Listen addresses look like `ws://127.0.0.1:7070/ws`.
pub struct WsAcceptor {
    config: AcceptorConfig,
    addr: Mutex<String>,
    local_addr: Mutex<Option<SocketAddr>>,
    started: AtomicBool,
    stop: CancellationToken,
}

/// Shared state for the HTTP handlers.
struct AppState {
    manager: Arc<SessionManager>,
    config: AcceptorConfig,
}

impl WsAcceptor {
    pub fn new(config: AcceptorConfig) -> Self {
        Self {
            config,
            addr: Mutex::new(String::new()),
            local_addr: Mutex::new(None),
            started: AtomicBool::new(false),
            stop: CancellationToken::new(),
        }
    }
}

impl Default for WsAcceptor {
    fn default() -> Self {
        Self::new(AcceptorConfig::default())
    }
}

impl Acceptor for WsAcceptor {
    async fn start(&self, addr: &str, manager: Arc<SessionManager>) -> Result<(), AcceptorError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(AcceptorError::AlreadyStarted);
        }
        self.config.validate()?;
        *self.addr.lock() = addr.to_string();

        let (host, path) = parse_listen_url(addr)?;
        let bind_err = |source| AcceptorError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(host.as_str()).await.map_err(bind_err)?;
        let local = listener.local_addr().map_err(bind_err)?;
        *self.local_addr.lock() = Some(local);

        let state = Arc::new(AppState {
            manager,
            config: self.config.clone(),
        });
        let mut app = Router::new().route(&path, get(ws_upgrade_handler));
        if path != "/health" {
            app = app.route("/health", get(health_handler));
        }
        let app = app.with_state(state);

        info!("Listening websocket on ws://{local}{path}, waiting for connections");

        let stop = self.stop.clone();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
            .map_err(AcceptorError::Serve)?;

        info!("Websocket acceptor on {local} stopped");
        Ok(())
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

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if let Some(max) = state.config.max_sessions {
        if state.manager.live_count() >= max {
            warn!("Connection from {peer} rejected: max sessions reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    ws.on_failed_upgrade(move |e| debug!("Websocket upgrade from {peer} failed: {e}"))
        .on_upgrade(move |socket| accept_socket(socket, peer, state))
        .into_response()
}

async fn accept_socket(socket: WebSocket, peer: SocketAddr, state: Arc<AppState>) {
    let weak = Arc::downgrade(&state.manager);
    let config = state.config.connection.clone();
    let conn = state
        .manager
        .add(|id| WsConnection::new(id, socket, peer, weak, config));
    debug!("Accepted websocket client {peer} as session {}", conn.id());
    conn.start();
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "transport": "ws",
        "sessions": state.manager.live_count(),
        "connection": state.config.connection,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Split `ws://host:port/path` into the bind address and the route path.
/// The scheme is optional; query and fragment are ignored.
fn parse_listen_url(addr: &str) -> Result<(String, String), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    let rest = match addr.split_once("://") {
        Some(("ws" | "http", rest)) => rest,
        Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme '{scheme}'"))),
        None => addr,
    };
    let (host, path) = match rest.find(['/', '?', '#']) {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && port.parse::<u16>().is_ok() => {}
        _ => return Err(invalid("expected host:port")),
    }

    let path = path.split(['?', '#']).next().unwrap_or_default();
    if path.is_empty() {
        return Err(ConfigError::MissingPath(addr.to_string()));
    }
    Ok((host.to_string(), path.to_string()))
}
