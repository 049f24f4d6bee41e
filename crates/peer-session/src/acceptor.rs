//! Acceptor capability and the name → acceptor registry.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use peer_protocol::{AcceptorError, ConfigError};
use tracing::{debug, info};

use crate::manager::SessionManager;

/// Owns the listening side of one transport.
///
/// Each accepted connection is registered with the `SessionManager` passed
/// to `start`.
pub trait Acceptor: Send + Sync + 'static {
    /// Bind `addr` and run the accept loop until `stop` is called or a fatal
    /// error occurs. An acceptor can be started once.
    fn start(
        &self,
        addr: &str,
        manager: Arc<SessionManager>,
    ) -> impl Future<Output = Result<(), AcceptorError>> + Send;

    /// Human-readable identity, the bound address once listening.
    fn describe(&self) -> String;

    /// Ask the accept loop to end. Best effort, idempotent.
    fn stop(&self);

    /// The bound socket address, once listening.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Object-safe wrapper for the Acceptor trait.
pub trait AcceptorDyn: Send + Sync {
    fn start_dyn<'a>(
        &'a self,
        addr: &'a str,
        manager: Arc<SessionManager>,
    ) -> Pin<Box<dyn Future<Output = Result<(), AcceptorError>> + Send + 'a>>;
    fn describe_dyn(&self) -> String;
    fn stop_dyn(&self);
    fn local_addr_dyn(&self) -> Option<SocketAddr>;
}

impl<T: Acceptor> AcceptorDyn for T {
    fn start_dyn<'a>(
        &'a self,
        addr: &'a str,
        manager: Arc<SessionManager>,
    ) -> Pin<Box<dyn Future<Output = Result<(), AcceptorError>> + Send + 'a>> {
        Box::pin(self.start(addr, manager))
    }
    fn describe_dyn(&self) -> String {
        self.describe()
    }
    fn stop_dyn(&self) {
        self.stop()
    }
    fn local_addr_dyn(&self) -> Option<SocketAddr> {
        self.local_addr()
    }
}

/// Named acceptors, populated once at startup and read afterwards.
///
/// Share it behind an `Arc` once registration is done.
#[derive(Default)]
pub struct AcceptorRegistry {
    acceptors: HashMap<String, Arc<dyn AcceptorDyn>>,
}

impl AcceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `acceptor` under `name`. A second registration under the
    /// same name is rejected and the first one stays in place.
    pub fn register<A: Acceptor>(
        &mut self,
        name: impl Into<String>,
        acceptor: Arc<A>,
    ) -> Result<(), ConfigError> {
        match self.acceptors.entry(name.into()) {
            Entry::Occupied(entry) => Err(ConfigError::DuplicateAcceptor(entry.key().clone())),
            Entry::Vacant(entry) => {
                debug!("Registered acceptor: {}", entry.key());
                entry.insert(acceptor);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn AcceptorDyn>> {
        self.acceptors.get(name).cloned()
    }

    /// Look up `name` and run its accept loop on `addr`.
    pub async fn start(
        &self,
        name: &str,
        addr: &str,
        manager: Arc<SessionManager>,
    ) -> Result<(), AcceptorError> {
        let acceptor = self
            .lookup(name)
            .ok_or_else(|| ConfigError::UnknownAcceptor(name.to_string()))?;
        info!("Starting {name} acceptor on {addr}");
        acceptor.start_dyn(addr, manager).await
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.acceptors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn stop_all(&self) {
        for (name, acceptor) in &self.acceptors {
            debug!("Stopping acceptor {name} ({})", acceptor.describe_dyn());
            acceptor.stop_dyn();
        }
    }
}
