//! Peer Server: echo demo over the peer connection layer
//!
//! Runs any combination of the TCP and WebSocket acceptors against one
//! session manager. Every inbound payload is echoed back to its sender.
//!
//! Usage:
//!   peer-server --tcp 127.0.0.1:7000                    # Raw TCP only
//!   peer-server --ws ws://127.0.0.1:7070/ws             # WebSocket only
//!   peer-server --tcp 0.0.0.0:7000 --ws ws://0.0.0.0:7070/ws --verbose

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use bytes::Bytes;
use clap::Parser;
use peer_protocol::{AcceptorConfig, CallbackError, ConnectionConfig, SendError};
use peer_session::{AcceptorRegistry, ConnectionCallback, Session, SessionManager};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Session store key of the per-session receive counter.
const RECEIVED: &str = "received";

#[derive(Parser, Debug)]
#[command(name = "peer-server", about = "Peer Server: TCP and WebSocket echo")]
struct Cli {
    /// TCP listen address, e.g. 127.0.0.1:7000
    #[arg(long)]
    tcp: Option<String>,

    /// WebSocket listen URL, e.g. ws://127.0.0.1:7070/ws
    #[arg(long)]
    ws: Option<String>,

    /// Maximum concurrent sessions across all transports
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Seconds without inbound traffic before a connection is dropped
    #[arg(long, default_value = "60")]
    idle_timeout_secs: u64,

    /// Session ids are allocated above this value
    #[arg(long, default_value = "0")]
    id_base: i64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file (defaults to ~/.peer/logs/peer-server.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

/// Echoes every payload and counts payloads per session.
struct EchoCallback;

impl ConnectionCallback for EchoCallback {
    fn on_closed(&self, session: &Arc<Session>) {
        let received = session
            .get::<AtomicU64>(RECEIVED)
            .map_or(0, |count| count.load(Ordering::Relaxed));
        info!(
            "Session {} from {} closed after {:?} ({received} payloads)",
            session.id(),
            session.conn().remote_addr(),
            session.age()
        );
    }

    fn on_receive(&self, session: &Arc<Session>, payload: Bytes) -> Result<(), CallbackError> {
        // Payloads of one session arrive from a single receive loop.
        match session.get::<AtomicU64>(RECEIVED) {
            Some(count) => {
                count.fetch_add(1, Ordering::Relaxed);
            }
            None => session.set(RECEIVED, AtomicU64::new(1)),
        }

        match session.send(payload) {
            Ok(()) => Ok(()),
            Err(e @ (SendError::QueueFull { .. } | SendError::PayloadTooLarge { .. })) => {
                warn!("Session {}: echo dropped: {e}", session.id());
                Ok(())
            }
            Err(e @ SendError::Closed) => Err(e.into()),
        }
    }
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    if let Some(ref log_file_arg) = cli.log_file {
        let log_path = if log_file_arg == "DEFAULT" {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
            PathBuf::from(&home).join(".peer/logs/peer-server.log")
        } else {
            PathBuf::from(log_file_arg)
        };

        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let listeners: Vec<(&str, String)> = [
        (peer_transport::TCP, cli.tcp.clone()),
        (peer_transport::WS, cli.ws.clone()),
    ]
    .into_iter()
    .filter_map(|(name, addr)| addr.map(|addr| (name, addr)))
    .collect();
    if listeners.is_empty() {
        bail!("nothing to listen on: pass --tcp and/or --ws");
    }

    let config = AcceptorConfig {
        connection: ConnectionConfig::default()
            .with_idle_timeout(Duration::from_secs(cli.idle_timeout_secs)),
        max_sessions: cli.max_sessions,
        ..AcceptorConfig::default()
    };

    let mut registry = AcceptorRegistry::new();
    if let Err(e) = peer_transport::register_default_acceptors(&mut registry, &config) {
        error!("Failed to register acceptors: {e}");
        std::process::exit(1);
    }
    let registry = Arc::new(registry);
    debug!("Registered acceptors: {:?}", registry.names());

    let manager = Arc::new(SessionManager::new(Arc::new(EchoCallback)));
    manager.set_id_base(cli.id_base);

    println!();
    println!("  Peer Server");
    for (name, addr) in &listeners {
        println!("    {name:<4} {addr}");
    }
    println!("  Idle timeout: {}s", cli.idle_timeout_secs);
    if let Some(max) = cli.max_sessions {
        println!("  Max sessions: {max}");
    }
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    let mut tasks = JoinSet::new();
    for (name, addr) in listeners {
        let registry = registry.clone();
        let manager = manager.clone();
        tasks.spawn(async move {
            let result = registry.start(name, &addr, manager).await;
            (name, result)
        });
    }

    let mut failed = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("  Shutting down...");
        }
        Some(joined) = tasks.join_next() => {
            match joined {
                Ok((name, Ok(()))) => warn!("{name} acceptor exited"),
                Ok((name, Err(e))) => error!("{name} acceptor failed: {e}"),
                Err(e) => error!("Acceptor task panicked: {e}"),
            }
            failed = true;
        }
    }

    registry.stop_all();
    manager.close_all();
    while tasks.join_next().await.is_some() {}
    info!("Acceptors stopped, {} sessions still closing", manager.live_count());

    if failed {
        bail!("an acceptor stopped unexpectedly");
    }
    println!("  Server stopped.");
    Ok(())
}
