//! Per-connection application context.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use peer_protocol::{SendError, SessionId};

use crate::connection::Connection;

type Value = Arc<dyn Any + Send + Sync>;

/// A live connection plus application state.
///
/// The data store maps free-form string keys to values of any type. Keys
/// are owned by the application; the framework never reads or writes them.
/// All accessors take `&self` and are safe from any number of tasks.
pub struct Session {
    id: SessionId,
    conn: Arc<dyn Connection>,
    connected_at: Instant,
    data: RwLock<HashMap<String, Value>>,
}

impl Session {
    pub fn new(id: SessionId, conn: Arc<dyn Connection>) -> Self {
        Self {
            id,
            conn,
            connected_at: Instant::now(),
            data: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn conn(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Queue a payload on the underlying connection.
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<(), SendError> {
        self.conn.send(payload.into())
    }

    pub fn close(&self) {
        self.conn.close();
    }

    /// Store a value, replacing any previous value under `key`.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.data.write().insert(key.into(), Arc::new(value));
    }

    /// Fetch the value under `key` if it exists and has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.data.read().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    /// Remove `key`. Returns whether a value was present.
    pub fn delete(&self, key: &str) -> bool {
        self.data.write().remove(key).is_some()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.conn.remote_addr())
            .field("closed", &self.conn.is_closed())
            .finish()
    }
}
