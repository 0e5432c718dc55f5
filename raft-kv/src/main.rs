//! Runs one member of the replicated key-value store.
//!
//! ```bash
//! # first node, starts a new cluster
//! cargo run -- --node node1 --http 127.0.0.1:6000 --raft 127.0.0.1:7000 --bootstrap
//!
//! # second node, joins through the first node's HTTP address
//! cargo run -- --node node2 --http 127.0.0.1:6001 --raft 127.0.0.1:7001 --join 127.0.0.1:6000
//!
//! curl "http://127.0.0.1:6000/set?key=x&value=1"
//! curl "http://127.0.0.1:6001/get?key=x"
//! ```

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use raft_kv::cli::Options;
use raft_kv::consensus::spawn_node;
use raft_kv::fsm::KvFsm;
use raft_kv::gateway::{self, GatewayContext};
use raft_kv::join::join_cluster;
use raft_kv::leadership::{LeadershipMonitor, WriteGate};
use raft_kv::store::KvStore;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let opts = Options::parse();
    let data_dir = opts.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let listener = TcpListener::bind(&opts.http)
        .await
        .with_context(|| format!("failed to bind http address {}", opts.http))?;

    let store = Arc::new(KvStore::new());
    let fsm = Arc::new(KvFsm::new(Arc::clone(&store)));
    let (raft, leadership) = spawn_node(opts.raft_config(), fsm)?;

    let gate = WriteGate::new();
    let monitor = LeadershipMonitor::new(leadership, gate.clone())
        .spawn()
        .context("failed to spawn leadership monitor")?;
    // The monitor returns once the raft worker is gone, for whatever reason.
    let mut engine = tokio::task::spawn_blocking(move || monitor.join());

    let ctx = GatewayContext::new(store, Arc::new(raft.clone()), gate);
    let app = gateway::router(ctx);
    info!(http = %listener.local_addr()?, raft = raft.address(), "node listening");

    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "failed to listen for ctrl-c");
                }
            })
            .await
    });

    if let Some(seed) = opts.join_seed() {
        let client = reqwest::Client::new();
        if let Err(err) = join_cluster(&client, seed, raft.address()).await {
            error!(error = %err, "failed to join cluster");
            raft.shutdown();
            return Err(err.into());
        }
    }

    tokio::select! {
        served = &mut server => {
            info!("shutting down");
            raft.shutdown();
            if !matches!(engine.await, Ok(Ok(()))) {
                warn!("leadership monitor panicked");
            }
            served
                .context("http server task panicked")?
                .context("http server failed")
        }
        _ = &mut engine => {
            error!("raft engine stopped, exiting");
            server.abort();
            bail!("raft engine stopped unexpectedly")
        }
    }
}
