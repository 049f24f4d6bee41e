//! Shared fixtures for transport tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use peer_protocol::{AcceptorConfig, AcceptorError, CallbackError, SessionId};
use peer_session::{Acceptor, ConnectionCallback, Session, SessionManager};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

#[derive(Debug)]
pub enum Event {
    Received(SessionId, Bytes),
    Closed(SessionId),
}

/// Forwards every callback to a channel so tests can await them.
pub struct ChannelCallback {
    tx: mpsc::UnboundedSender<Event>,
    pub fail_receive: AtomicBool,
}

impl ConnectionCallback for ChannelCallback {
    fn on_closed(&self, session: &Arc<Session>) {
        let _ = self.tx.send(Event::Closed(session.id()));
    }

    fn on_receive(&self, session: &Arc<Session>, payload: Bytes) -> Result<(), CallbackError> {
        let _ = self.tx.send(Event::Received(session.id(), payload));
        if self.fail_receive.load(Ordering::SeqCst) {
            return Err(CallbackError::new("rejected by test"));
        }
        Ok(())
    }
}

pub struct Harness<A> {
    pub acceptor: Arc<A>,
    pub manager: Arc<SessionManager>,
    pub callback: Arc<ChannelCallback>,
    pub events: mpsc::UnboundedReceiver<Event>,
    pub addr: SocketAddr,
    pub task: JoinHandle<Result<(), AcceptorError>>,
}

impl<A> Harness<A> {
    pub async fn next_event(&mut self) -> Event {
        timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for callback")
            .expect("callback channel closed")
    }

    /// Assert no callback fires within `window`.
    pub async fn expect_quiet(&mut self, window: Duration) {
        if let Ok(Some(event)) = timeout(window, self.events.recv()).await {
            panic!("unexpected callback: {event:?}");
        }
    }

    pub async fn wait_live(&self, count: usize) {
        let manager = self.manager.clone();
        timeout(Duration::from_secs(5), async move {
            while manager.live_count() != count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("live count not reached");
    }

    pub fn session(&self, id: SessionId) -> Arc<Session> {
        self.manager.get(id).expect("session registered")
    }
}

/// A manager whose callbacks land on the returned channel.
pub fn channel_manager() -> (
    Arc<SessionManager>,
    Arc<ChannelCallback>,
    mpsc::UnboundedReceiver<Event>,
) {
    let (tx, events) = mpsc::unbounded_channel();
    let callback = Arc::new(ChannelCallback {
        tx,
        fail_receive: AtomicBool::new(false),
    });
    let manager = Arc::new(SessionManager::new(callback.clone()));
    (manager, callback, events)
}

/// Start `acceptor` on `listen` in the background and wait until it is bound.
pub async fn start<A: Acceptor>(acceptor: A, listen: &str) -> Harness<A> {
    let (manager, callback, events) = channel_manager();
    let acceptor = Arc::new(acceptor);

    let task = {
        let acceptor = acceptor.clone();
        let manager = manager.clone();
        let listen = listen.to_string();
        tokio::spawn(async move { acceptor.start(&listen, manager).await })
    };

    let addr = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(addr) = acceptor.local_addr() {
                return addr;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("acceptor never bound");

    Harness {
        acceptor,
        manager,
        callback,
        events,
        addr,
        task,
    }
}

pub fn config_with_idle(idle: Duration) -> AcceptorConfig {
    let mut config = AcceptorConfig::default();
    config.connection = config.connection.with_idle_timeout(idle);
    config
}
