//! Application callback invoked by the session manager.

use std::sync::Arc;

use bytes::Bytes;
use peer_protocol::CallbackError;

use crate::session::Session;

/// Implemented by the application to receive payloads and close notifications.
///
/// `on_receive` runs inline on the session's receive loop, so calls for one
/// session never overlap. `on_closed` runs on a blocking task of its own,
/// at most once per session, after the session left the manager.
pub trait ConnectionCallback: Send + Sync + 'static {
    fn on_closed(&self, session: &Arc<Session>);

    /// Returning an error closes the session's connection.
    fn on_receive(&self, session: &Arc<Session>, payload: Bytes) -> Result<(), CallbackError>;
}
