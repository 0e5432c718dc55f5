//! Drives the HTTP surface with an in-process consensus stand-in.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::future::{BoxFuture, FutureExt};
use tower::ServiceExt; // for `oneshot`

use raft_kv::command::LogEntry;
use raft_kv::consensus::{ApplyReport, Consensus, StateMachine};
use raft_kv::error::ConsensusError;
use raft_kv::fsm::KvFsm;
use raft_kv::gateway::{router, GatewayContext, SET_TIMEOUT};
use raft_kv::leadership::{leadership_channel, LeadershipMonitor, LeadershipNotifier, WriteGate};
use raft_kv::store::KvStore;

/// Applies commands straight to the state machine, or fails on demand.
struct LocalConsensus {
    fsm: KvFsm,
    applies: AtomicUsize,
    fail_with_timeout: bool,
    joined: Mutex<Vec<(String, String)>>,
}

impl LocalConsensus {
    fn new(store: Arc<KvStore>) -> Self {
        Self {
            fsm: KvFsm::new(store),
            applies: AtomicUsize::new(0),
            fail_with_timeout: false,
            joined: Mutex::new(Vec::new()),
        }
    }
}

impl Consensus for LocalConsensus {
    fn apply(
        &self,
        command: Vec<u8>,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<ApplyReport, ConsensusError>> {
        let index = self.applies.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let outcome = if self.fail_with_timeout {
            Err(ConsensusError::Timeout(timeout))
        } else {
            assert_eq!(timeout, SET_TIMEOUT);
            self.fsm.apply(&command).unwrap();
            Ok(ApplyReport { index, term: 1 })
        };
        async move { outcome }.boxed()
    }

    fn add_voter(
        &self,
        id: &str,
        address: &str,
        _prev_index: u64,
        _timeout: Duration,
    ) -> BoxFuture<'static, Result<(), ConsensusError>> {
        self.joined
            .lock()
            .unwrap()
            .push((id.to_string(), address.to_string()));
        async { Ok(()) }.boxed()
    }
}

struct Harness {
    app: Router,
    store: Arc<KvStore>,
    consensus: Arc<LocalConsensus>,
    // Dropping the notifier closes the gate.
    _leadership: LeadershipNotifier,
}

fn harness(leader: bool, fail_with_timeout: bool) -> Harness {
    let store = Arc::new(KvStore::new());
    let mut consensus = LocalConsensus::new(Arc::clone(&store));
    consensus.fail_with_timeout = fail_with_timeout;
    let consensus = Arc::new(consensus);

    // Open the gate the same way the process does: through the monitor.
    let gate = WriteGate::new();
    let (notifier, rx) = leadership_channel();
    LeadershipMonitor::new(rx, gate.clone()).spawn().unwrap();
    notifier.notify(leader);
    let deadline = Instant::now() + Duration::from_secs(5);
    while gate.is_open() != leader {
        assert!(Instant::now() < deadline, "gate never followed leadership");
        std::thread::sleep(Duration::from_millis(5));
    }

    let ctx = GatewayContext::new(Arc::clone(&store), consensus.clone(), gate);
    Harness {
        app: router(ctx),
        store,
        consensus,
        _leadership: notifier,
    }
}

async fn call(app: &Router, uri: &str) -> (StatusCode, String) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn set_then_get_on_leader() {
    let h = harness(true, false);

    assert_eq!(call(&h.app, "/set?key=x&value=1").await, (StatusCode::OK, "ok\n".to_string()));
    assert_eq!(call(&h.app, "/get?key=x").await.1, "1\n");

    assert_eq!(call(&h.app, "/set?key=x&value=2").await.1, "ok\n");
    assert_eq!(call(&h.app, "/get?key=x").await.1, "2\n");
    assert_eq!(h.consensus.applies.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn get_of_missing_or_empty_key() {
    let h = harness(true, false);
    assert_eq!(call(&h.app, "/get?key=nope").await.1, "\n");
    assert_eq!(call(&h.app, "/get?key=").await.1, "");
    assert_eq!(call(&h.app, "/get").await.1, "");
}

#[tokio::test]
async fn follower_rejects_writes_without_consensus() {
    let h = harness(false, false);
    h.store.set("x".to_string(), "stale".to_string());

    assert_eq!(call(&h.app, "/set?key=x&value=1").await.1, "write not allowed\n");
    assert_eq!(call(&h.app, "/set?key=&value=").await.1, "write not allowed\n");
    assert_eq!(h.consensus.applies.load(Ordering::SeqCst), 0);

    // Reads stay local.
    assert_eq!(call(&h.app, "/get?key=x").await.1, "stale\n");
}

#[tokio::test]
async fn empty_key_or_value_is_a_param_error() {
    let h = harness(true, false);
    assert_eq!(call(&h.app, "/set?key=&value=1").await.1, "param error\n");
    assert_eq!(call(&h.app, "/set?key=x&value=").await.1, "param error\n");
    assert_eq!(call(&h.app, "/set?key=x").await.1, "param error\n");
    assert_eq!(h.consensus.applies.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn commit_failure_is_an_internal_error() {
    let h = harness(true, true);
    assert_eq!(call(&h.app, "/set?key=x&value=1").await.1, "internal error\n");
    assert_eq!(h.store.get("x"), None);
}

#[tokio::test]
async fn join_uses_address_as_identity() {
    let h = harness(true, false);
    assert_eq!(call(&h.app, "/join?peerAddress=127.0.0.1:7001").await.1, "ok");
    assert_eq!(call(&h.app, "/join?peerAddress=").await.1, "invalid peerAddress\n");
    assert_eq!(call(&h.app, "/join").await.1, "invalid peerAddress\n");

    let joined = h.consensus.joined.lock().unwrap().clone();
    assert_eq!(
        joined,
        vec![("127.0.0.1:7001".to_string(), "127.0.0.1:7001".to_string())]
    );
}

#[tokio::test]
async fn applied_payload_uses_canonical_encoding() {
    let store = Arc::new(KvStore::new());
    let fsm = KvFsm::new(Arc::clone(&store));
    let payload = LogEntry::new("k", "v").encode().unwrap();
    assert_eq!(payload, br#"{"key":"k","value":"v"}"#);
    fsm.apply(&payload).unwrap();
    assert_eq!(store.get("k"), Some("v".to_string()));
}
