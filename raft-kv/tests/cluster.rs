//! Two real nodes on loopback: bootstrap, write, join, replicate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::net::TcpListener;

use raft_kv::consensus::{spawn_node, RaftConfig, RaftHandle};
use raft_kv::fsm::KvFsm;
use raft_kv::gateway::{router, GatewayContext};
use raft_kv::join::join_cluster;
use raft_kv::leadership::{LeadershipMonitor, WriteGate};
use raft_kv::store::KvStore;

struct TestNode {
    http: SocketAddr,
    raft: RaftHandle,
    monitor: JoinHandle<()>,
    _dir: TempDir,
}

impl TestNode {
    async fn start(bootstrap: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RaftConfig::new("127.0.0.1:0", dir.path());
        config.bootstrap = bootstrap;
        config.tick_interval = Duration::from_millis(20);

        let store = Arc::new(KvStore::new());
        let fsm = Arc::new(KvFsm::new(Arc::clone(&store)));
        let (raft, leadership) = spawn_node(config, fsm).unwrap();

        let gate = WriteGate::new();
        let monitor = LeadershipMonitor::new(leadership, gate.clone())
            .spawn()
            .unwrap();

        let ctx = GatewayContext::new(store, Arc::new(raft.clone()), gate);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(ctx)).await.unwrap();
        });

        Self {
            http,
            raft,
            monitor,
            _dir: dir,
        }
    }

    async fn get(&self, client: &reqwest::Client, path: &str) -> String {
        client
            .get(format!("http://{}{path}", self.http))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap()
    }

    fn stop(self) {
        self.raft.shutdown();
        self.monitor.join().unwrap();
    }
}

/// Repeats `path` until the body equals `expected` or ten seconds pass.
async fn eventually(node: &TestNode, client: &reqwest::Client, path: &str, expected: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let body = node.get(client, path).await;
        if body == expected {
            return;
        }
        assert!(Instant::now() < deadline, "{path} kept returning {body:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn joined_follower_replicates_and_refuses_writes() {
    let client = reqwest::Client::new();

    let a = TestNode::start(true).await;
    eventually(&a, &client, "/set?key=x&value=1", "ok\n").await;
    assert_eq!(a.get(&client, "/get?key=x").await, "1\n");

    let b = TestNode::start(false).await;
    assert_eq!(b.get(&client, "/set?key=y&value=2").await, "write not allowed\n");

    join_cluster(&client, &a.http.to_string(), b.raft.address())
        .await
        .unwrap();
    eventually(&b, &client, "/get?key=x", "1\n").await;

    assert_eq!(a.get(&client, "/set?key=x&value=3").await, "ok\n");
    eventually(&b, &client, "/get?key=x", "3\n").await;
    assert_eq!(b.get(&client, "/set?key=x&value=4").await, "write not allowed\n");

    let status = a.raft.status().await.unwrap();
    assert_eq!(status.members.len(), 2);
    assert_eq!(
        status.members.get(&b.raft.id()).map(String::as_str),
        Some(b.raft.address())
    );

    // Joining again with the same address is accepted without a new change.
    join_cluster(&client, &a.http.to_string(), b.raft.address())
        .await
        .unwrap();

    b.stop();
    a.stop();
}
