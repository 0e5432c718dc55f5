//! Error kinds used across the replication layer.
//!
//! Each boundary gets its own enum so callers can tell recoverable request
//! failures apart from the invariant violations that end the process.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failures reported by the consensus engine for a submitted command or
/// membership change.
///
/// Every variant except `NotLeader` and `ConfigurationChanged` leaves the
/// outcome of the submission indeterminate: the entry may still commit and
/// apply after the caller has been told it failed.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("node is not the leader (known leader id: {leader_id})")]
    NotLeader { leader_id: u64 },
    #[error("timed out after {0:?} waiting for commit")]
    Timeout(Duration),
    #[error("leadership lost before the entry was applied")]
    LeadershipLost,
    #[error("proposal was dropped by the leader")]
    Dropped,
    #[error("configuration changed: expected index {expected}, latest is {actual}")]
    ConfigurationChanged { expected: u64, actual: u64 },
    #[error("consensus engine is shut down")]
    Shutdown,
    #[error(transparent)]
    Raft(#[from] raft::Error),
}

/// Errors surfaced by the FSM adapter.
#[derive(Debug, Error)]
pub enum FsmError {
    /// A committed entry could not be decoded. The replicated state can no
    /// longer be trusted once this happens.
    #[error("corrupt log entry: {0}")]
    CorruptLogEntry(#[source] serde_json::Error),
    #[error("restore failed: {0}")]
    Restore(#[source] serde_json::Error),
}

/// A snapshot attempt failed. The sink has been cancelled by the time this is
/// returned.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("write snapshot: {0}")]
    Write(#[source] io::Error),
    #[error("close snapshot: {0}")]
    Close(#[source] io::Error),
}

/// Rejections and failures of a client `set`.
#[derive(Debug, Error)]
pub enum SetError {
    #[error("write not allowed")]
    WriteNotAllowed,
    #[error("param error")]
    InvalidParams,
    #[error("encode log entry: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("commit failed: {0}")]
    Commit(#[from] ConsensusError),
}

/// Failures of an inbound join request.
#[derive(Debug, Error)]
pub enum JoinRequestError {
    #[error("invalid peerAddress")]
    InvalidPeerAddress,
    #[error("membership change failed: {0}")]
    Membership(#[from] ConsensusError),
}

/// The startup handshake with a seed member failed. Fatal for the process.
#[derive(Debug, Error)]
pub enum StartupJoinError {
    #[error("join request to {seed} failed: {source}")]
    Transport {
        seed: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("seed {seed} rejected join: {body:?}")]
    Rejected { seed: String, body: String },
}
