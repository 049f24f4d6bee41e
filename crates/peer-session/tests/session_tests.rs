//! Session layer tests: identity assignment, registry lifecycle, dispatch,
//! backpressure, exactly-once close, session data, acceptor registry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use peer_protocol::{
    AcceptorError, CallbackError, ConfigError, ConnectionConfig, SendError, SessionId,
};
use peer_session::{
    Acceptor, AcceptorRegistry, Connection, ConnectionCallback, ConnectionCore, Session,
    SessionManager,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

/// Connection backed by a real `ConnectionCore` but no socket. The queue's
/// receiver is parked so nothing drains it.
struct TestConnection {
    core: ConnectionCore,
    rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    teardowns: AtomicUsize,
}

impl TestConnection {
    fn new(id: SessionId, manager: Weak<SessionManager>) -> Arc<Self> {
        let (core, rx) =
            ConnectionCore::new(id, format!("test:{id}"), ConnectionConfig::default(), manager);
        core.mark_running();
        Arc::new(Self {
            core,
            rx: Mutex::new(Some(rx)),
            teardowns: AtomicUsize::new(0),
        })
    }

    fn queued(&self) -> usize {
        self.rx.lock().as_ref().map(|rx| rx.len()).unwrap_or(0)
    }
}

impl Connection for TestConnection {
    fn send(&self, payload: Bytes) -> Result<(), SendError> {
        self.core.send(payload)
    }
    fn close(&self) {
        if self.core.close() {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
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

#[derive(Default)]
struct Recorder {
    closed: Mutex<Vec<SessionId>>,
    received: Mutex<Vec<(SessionId, Bytes)>>,
    fail_receive: AtomicBool,
}

impl Recorder {
    fn closed_count(&self) -> usize {
        self.closed.lock().len()
    }
}

impl ConnectionCallback for Recorder {
    fn on_closed(&self, session: &Arc<Session>) {
        self.closed.lock().push(session.id());
    }

    fn on_receive(&self, session: &Arc<Session>, payload: Bytes) -> Result<(), CallbackError> {
        self.received.lock().push((session.id(), payload));
        if self.fail_receive.load(Ordering::SeqCst) {
            return Err("rejected".into());
        }
        Ok(())
    }
}

fn setup() -> (Arc<Recorder>, Arc<SessionManager>) {
    let recorder = Arc::new(Recorder::default());
    let manager = Arc::new(SessionManager::new(recorder.clone()));
    (recorder, manager)
}

fn add_conn(manager: &Arc<SessionManager>) -> Arc<TestConnection> {
    let weak = Arc::downgrade(manager);
    manager.add(|id| TestConnection::new(id, weak))
}

async fn wait_for(cond: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity assignment
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn ids_start_above_zero_and_increase() {
    let (_recorder, manager) = setup();
    let a = add_conn(&manager);
    let b = add_conn(&manager);
    assert_eq!(a.id(), 1);
    assert_eq!(b.id(), 2);
    assert_eq!(manager.live_count(), 2);
}

#[test]
fn concurrent_add_assigns_unique_ids() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 200;

    let (_recorder, manager) = setup();
    let ids: Vec<SessionId> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let manager = &manager;
                scope.spawn(move || {
                    (0..PER_THREAD).map(|_| add_conn(manager).id()).collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let unique: HashSet<_> = ids.iter().copied().collect();
    assert_eq!(unique.len(), THREADS * PER_THREAD);
    assert_eq!(manager.live_count(), THREADS * PER_THREAD);
    assert!(ids.iter().all(|id| *id > 0));
}

#[test]
fn id_base_raises_generator() {
    let (_recorder, manager) = setup();
    manager.set_id_base(1000);
    assert_eq!(add_conn(&manager).id(), 1001);

    // Lowering the base never reissues ids.
    manager.set_id_base(10);
    assert_eq!(add_conn(&manager).id(), 1002);
}

#[tokio::test]
async fn ids_are_not_reused_after_remove() {
    let (_recorder, manager) = setup();
    let first = add_conn(&manager);
    first.close();
    let second = add_conn(&manager);
    assert_eq!(second.id(), first.id() + 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Lookup and removal
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn get_returns_registered_session() {
    let (_recorder, manager) = setup();
    let conn = add_conn(&manager);
    let session = manager.get(conn.id()).expect("session registered");
    assert_eq!(session.id(), conn.id());
    assert_eq!(session.conn().remote_addr(), "test:1");
    assert!(manager.get(999).is_none());
}

#[tokio::test]
async fn remove_absent_is_noop() {
    let (recorder, manager) = setup();
    add_conn(&manager);
    assert!(!manager.remove(42));
    assert_eq!(manager.live_count(), 1);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(recorder.closed_count(), 0);
}

#[tokio::test]
async fn remove_notifies_once() {
    let (recorder, manager) = setup();
    let conn = add_conn(&manager);
    assert!(manager.remove(conn.id()));
    assert!(!manager.remove(conn.id()));
    assert_eq!(manager.live_count(), 0);

    wait_for(|| recorder.closed_count() == 1).await;
    sleep(Duration::from_millis(20)).await;
    assert_eq!(*recorder.closed.lock(), vec![conn.id()]);
}

#[test]
fn remove_outside_runtime_still_notifies() {
    let (recorder, manager) = setup();
    let conn = add_conn(&manager);
    assert!(manager.remove(conn.id()));
    for _ in 0..500 {
        if recorder.closed_count() == 1 {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("on_closed never ran");
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn dispatch_routes_payload() {
    let (recorder, manager) = setup();
    let conn = add_conn(&manager);
    manager.dispatch(conn.id(), Bytes::from_static(b"ping"));

    let received = recorder.received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, conn.id());
    assert_eq!(&received[0].1[..], b"ping");
}

#[tokio::test]
async fn dispatch_to_absent_session_is_dropped() {
    let (recorder, manager) = setup();
    manager.dispatch(77, Bytes::from_static(b"late"));
    assert!(recorder.received.lock().is_empty());
}

#[tokio::test]
async fn dispatch_failure_closes_connection() {
    let (recorder, manager) = setup();
    recorder.fail_receive.store(true, Ordering::SeqCst);
    let conn = add_conn(&manager);

    manager.dispatch(conn.id(), Bytes::from_static(b"bad"));

    assert!(conn.is_closed());
    assert_eq!(conn.teardowns.load(Ordering::SeqCst), 1);
    assert!(manager.get(conn.id()).is_none());
    assert_eq!(manager.live_count(), 0);
    wait_for(|| recorder.closed_count() == 1).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Backpressure
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn seventeenth_send_reports_queue_full() {
    let (_recorder, manager) = setup();
    let conn = add_conn(&manager);
    for i in 0..16u8 {
        assert_eq!(conn.send(Bytes::from(vec![i])), Ok(()));
    }
    assert_eq!(
        conn.send(Bytes::from_static(b"x")),
        Err(SendError::QueueFull { capacity: 16 })
    );
    assert_eq!(conn.queued(), 16);
}

#[test]
fn oversized_payload_is_rejected_without_enqueueing() {
    let (_recorder, manager) = setup();
    let conn = add_conn(&manager);
    let err = conn.send(Bytes::from(vec![0u8; 16385])).unwrap_err();
    assert_eq!(err, SendError::PayloadTooLarge { len: 16385, max: 16384 });
    assert_eq!(conn.queued(), 0);

    // Exactly the maximum is fine.
    assert_eq!(conn.send(Bytes::from(vec![0u8; 16384])), Ok(()));
    assert_eq!(conn.queued(), 1);
}

#[tokio::test]
async fn send_after_close_reports_closed() {
    let (_recorder, manager) = setup();
    let conn = add_conn(&manager);
    conn.close();
    assert_eq!(conn.send(Bytes::from_static(b"x")), Err(SendError::Closed));
    assert_eq!(conn.queued(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Idempotent close
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_close_tears_down_once() {
    const CLOSERS: usize = 32;

    let (recorder, manager) = setup();
    let conn = add_conn(&manager);
    let id = conn.id();

    let barrier = Arc::new(tokio::sync::Barrier::new(CLOSERS));
    let tasks: Vec<_> = (0..CLOSERS)
        .map(|_| {
            let conn = conn.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                conn.close();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(conn.teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(manager.live_count(), 0);
    wait_for(|| recorder.closed_count() == 1).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(*recorder.closed.lock(), vec![id]);
}

#[tokio::test]
async fn close_via_session_and_connection_converge() {
    let (recorder, manager) = setup();
    let conn = add_conn(&manager);
    let session = manager.get(conn.id()).unwrap();

    session.close();
    conn.close();
    manager.remove(conn.id());

    assert_eq!(conn.teardowns.load(Ordering::SeqCst), 1);
    wait_for(|| recorder.closed_count() == 1).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Iteration
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn visit_all_sees_every_session_and_stops_early() {
    let (_recorder, manager) = setup();
    for _ in 0..5 {
        add_conn(&manager);
    }

    let mut seen = HashSet::new();
    manager.visit_all(|session| {
        seen.insert(session.id());
        true
    });
    assert_eq!(seen, (1..=5).collect::<HashSet<_>>());

    let mut visits = 0;
    manager.visit_all(|_| {
        visits += 1;
        visits < 2
    });
    assert_eq!(visits, 2);
}

#[tokio::test]
async fn visit_all_tolerates_concurrent_removal() {
    let (_recorder, manager) = setup();
    for _ in 0..10 {
        add_conn(&manager);
    }
    let mut visits = 0;
    manager.visit_all(|session| {
        visits += 1;
        session.close();
        true
    });
    assert_eq!(visits, 10);
    assert_eq!(manager.live_count(), 0);
}

#[tokio::test]
async fn close_all_empties_registry() {
    let (recorder, manager) = setup();
    let conns: Vec<_> = (0..6).map(|_| add_conn(&manager)).collect();
    manager.close_all();

    assert!(conns.iter().all(|c| c.is_closed()));
    assert_eq!(manager.live_count(), 0);
    wait_for(|| recorder.closed_count() == 6).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Session data
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn session_data_set_get_delete() {
    let (_recorder, manager) = setup();
    let conn = add_conn(&manager);
    let session = manager.get(conn.id()).unwrap();

    session.set("user", String::from("alice"));
    session.set("score", 42u32);

    assert_eq!(session.get::<String>("user").as_deref().map(String::as_str), Some("alice"));
    assert_eq!(session.get::<u32>("score").map(|v| *v), Some(42));
    // Wrong type reads as absent.
    assert!(session.get::<i64>("score").is_none());
    assert!(session.contains("score"));

    session.set("score", 43u32);
    assert_eq!(session.get::<u32>("score").map(|v| *v), Some(43));

    assert!(session.delete("score"));
    assert!(!session.delete("score"));
    assert!(session.get::<u32>("score").is_none());
}

#[test]
fn session_data_concurrent_access() {
    let (_recorder, manager) = setup();
    let conn = add_conn(&manager);
    let session = manager.get(conn.id()).unwrap();

    std::thread::scope(|scope| {
        for t in 0..4 {
            let session = &session;
            scope.spawn(move || {
                for i in 0..250 {
                    let key = format!("k{t}-{i}");
                    session.set(key.clone(), i);
                    assert_eq!(session.get::<i32>(&key).map(|v| *v), Some(i));
                    if i % 2 == 0 {
                        session.delete(&key);
                    }
                }
            });
        }
    });

    assert!(session.contains("k0-1"));
    assert!(!session.contains("k3-0"));
}

#[test]
fn session_send_delegates_to_connection() {
    let (_recorder, manager) = setup();
    let conn = add_conn(&manager);
    let session = manager.get(conn.id()).unwrap();
    assert_eq!(session.send(&b"hello"[..]), Ok(()));
    assert_eq!(conn.queued(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Acceptor registry
// ─────────────────────────────────────────────────────────────────────────────

struct NamedAcceptor {
    label: &'static str,
    started: AtomicBool,
}

impl NamedAcceptor {
    fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            started: AtomicBool::new(false),
        })
    }
}

impl Acceptor for NamedAcceptor {
    async fn start(&self, _addr: &str, _manager: Arc<SessionManager>) -> Result<(), AcceptorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AcceptorError::AlreadyStarted);
        }
        Ok(())
    }
    fn describe(&self) -> String {
        self.label.to_string()
    }
    fn stop(&self) {}
}

#[test]
fn duplicate_registration_is_rejected_and_first_stays() {
    let mut registry = AcceptorRegistry::new();
    registry.register("tcp", NamedAcceptor::new("first")).unwrap();

    let err = registry.register("tcp", NamedAcceptor::new("second")).unwrap_err();
    assert_eq!(err, ConfigError::DuplicateAcceptor("tcp".into()));

    let acceptor = registry.lookup("tcp").expect("first acceptor kept");
    assert_eq!(acceptor.describe_dyn(), "first");
}

#[test]
fn lookup_unknown_name_is_none() {
    let registry = AcceptorRegistry::new();
    assert!(registry.lookup("udp").is_none());
}

#[test]
fn names_are_sorted() {
    let mut registry = AcceptorRegistry::new();
    registry.register("ws", NamedAcceptor::new("ws")).unwrap();
    registry.register("tcp", NamedAcceptor::new("tcp")).unwrap();
    assert_eq!(registry.names(), vec!["tcp", "ws"]);
}

#[tokio::test]
async fn starting_unknown_acceptor_is_a_lookup_failure() {
    let (_recorder, manager) = setup();
    let registry = AcceptorRegistry::new();
    let err = registry.start("udp", "127.0.0.1:0", manager).await.unwrap_err();
    assert!(matches!(err, AcceptorError::Config(ConfigError::UnknownAcceptor(name)) if name == "udp"));
}

#[tokio::test]
async fn registry_start_runs_named_acceptor() {
    let (_recorder, manager) = setup();
    let acceptor = NamedAcceptor::new("mock");
    let mut registry = AcceptorRegistry::new();
    registry.register("mock", acceptor.clone()).unwrap();

    registry.start("mock", "anywhere", manager.clone()).await.unwrap();
    assert!(acceptor.started.load(Ordering::SeqCst));

    let err = registry.start("mock", "anywhere", manager).await.unwrap_err();
    assert!(matches!(err, AcceptorError::AlreadyStarted));
}
