//! SessionManager: assigns identities and indexes live sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use peer_protocol::SessionId;
use tracing::{debug, trace, warn};

use crate::callback::ConnectionCallback;
use crate::connection::Connection;
use crate::session::Session;

/// Registry of live sessions.
///
/// Sessions enter only through `add` (the accept path) and leave only
/// through `remove` (the connection's close sequence). Lookups and
/// mutations touch a single `DashMap` shard, so unrelated sessions never
/// contend on a global lock. No map guard is ever held while application
/// code runs.
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Session>>,
    id_gen: AtomicI64,
    live: AtomicUsize,
    callback: Arc<dyn ConnectionCallback>,
}

impl SessionManager {
    pub fn new(callback: Arc<dyn ConnectionCallback>) -> Self {
        Self {
            sessions: DashMap::new(),
            id_gen: AtomicI64::new(0),
            live: AtomicUsize::new(0),
            callback,
        }
    }

    /// Raise the identity generator so every later id is above `base`.
    /// The generator never moves backwards, so issued ids are never reused.
    pub fn set_id_base(&self, base: SessionId) {
        self.id_gen.fetch_max(base, Ordering::AcqRel);
    }

    /// Register a new session.
    ///
    /// The next identity is generated first and handed to `make`, which
    /// builds the connection with that identity already bound. The
    /// connection is indexed before this returns, so the caller can start
    /// its loops knowing every inbound payload will find the session.
    pub fn add<C, F>(&self, make: F) -> Arc<C>
    where
        C: Connection,
        F: FnOnce(SessionId) -> Arc<C>,
    {
        let id = self.id_gen.fetch_add(1, Ordering::AcqRel) + 1;
        let conn = make(id);
        debug_assert_eq!(conn.id(), id, "connection must carry the assigned id");

        let session = Arc::new(Session::new(id, conn.clone()));
        self.sessions.insert(id, session);
        let live = self.live.fetch_add(1, Ordering::AcqRel) + 1;

        debug!("Session {id} registered from {} (live: {live})", conn.remote_addr());
        conn
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Unregister a session. Absent ids are a no-op and return false.
    ///
    /// `on_closed` is scheduled on the blocking pool so a slow callback
    /// cannot hold up the connection's teardown.
    pub fn remove(&self, id: SessionId) -> bool {
        let Some((_, session)) = self.sessions.remove(&id) else {
            return false;
        };
        let live = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!("Session {id} unregistered (live: {live})");

        let callback = self.callback.clone();
        spawn_detached(move || callback.on_closed(&session));
        true
    }

    /// Hand an inbound payload to the application.
    ///
    /// A payload for an id that is no longer registered is dropped; that
    /// only happens when the connection is already closing.
    pub fn dispatch(&self, id: SessionId, payload: Bytes) {
        let Some(session) = self.get(id) else {
            trace!("Dropping {} bytes for unregistered session {id}", payload.len());
            return;
        };
        if let Err(e) = self.callback.on_receive(&session, payload) {
            warn!("Receive callback failed for session {id}, closing: {e}");
            session.close();
        }
    }

    /// Call `f` for each live session until it returns false.
    ///
    /// Iterates a snapshot: sessions removed meanwhile may still be visited
    /// (their connection reports `is_closed`), sessions added meanwhile may
    /// be missed.
    pub fn visit_all<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Session>) -> bool,
    {
        for session in self.snapshot() {
            if !f(&session) {
                break;
            }
        }
    }

    /// Close every live connection.
    pub fn close_all(&self) {
        let sessions = self.snapshot();
        debug!("Closing {} sessions", sessions.len());
        for session in sessions {
            session.close();
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Run `f` off the caller's task: on the runtime's blocking pool when one
/// is available, on a detached thread otherwise.
fn spawn_detached<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(f);
        }
        Err(_) => {
            std::thread::spawn(f);
        }
    }
}
