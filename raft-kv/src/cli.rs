use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::consensus::RaftConfig;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Replicated key-value store node", long_about = None)]
pub struct Options {
    /// Address the HTTP request surface binds to.
    #[arg(long, default_value = "127.0.0.1:6000")]
    pub http: String,

    /// Address raft peers reach this node on. Also the node's identity.
    #[arg(long, default_value = "127.0.0.1:7000")]
    pub raft: String,

    /// Node name. Local state lives in `./<node>`.
    #[arg(long, default_value = "node1")]
    pub node: String,

    /// Start a new cluster with this node as its only member.
    #[arg(long)]
    pub bootstrap: bool,

    /// HTTP address of an existing member to join through.
    #[arg(long)]
    pub join: Option<String>,

    #[arg(long, default_value_t = 20)]
    pub snapshot_interval_secs: u64,

    /// Entries that must be applied since the last snapshot before another
    /// is taken.
    #[arg(long, default_value_t = 2)]
    pub snapshot_threshold: u64,
}

impl Options {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(".").join(&self.node)
    }

    pub fn raft_config(&self) -> RaftConfig {
        let mut config = RaftConfig::new(self.raft.clone(), self.data_dir());
        config.bootstrap = self.bootstrap;
        config.snapshot_interval = Duration::from_secs(self.snapshot_interval_secs);
        config.snapshot_threshold = self.snapshot_threshold;
        config
    }

    /// Seed to join through at startup. Bootstrapping takes precedence.
    pub fn join_seed(&self) -> Option<&str> {
        if self.bootstrap {
            return None;
        }
        self.join.as_deref().filter(|seed| !seed.is_empty())
    }
}
