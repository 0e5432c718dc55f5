//! Contract between the replication layer and the consensus engine.
//!
//! The traits here are the narrow seam the rest of the crate talks through:
//!
//! - [`Consensus`] is what request handlers call to replicate commands and
//!   change membership.
//! - [`StateMachine`], [`FsmSnapshot`] and [`SnapshotSink`] are what the engine
//!   calls back into to apply entries and capture or restore state.
//!
//! The concrete engine lives in the submodules and drives tikv/raft:
//!
//! - [`node`]: `RawNode` wrapper running the ready cycle and the apply path
//! - [`runtime`]: worker thread, request handling, [`RaftHandle`]
//! - [`storage`]: raft log store that serves state machine snapshots
//! - [`log_db`]: redb file the log store writes through to
//! - [`snapshot_store`]: on-disk snapshot store with atomic sinks
//! - [`transport`]: TCP transport for raft messages

use std::io::{self, Read, Write};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::{ConsensusError, FsmError, SnapshotError};

pub mod log_db;
pub mod node;
pub mod runtime;
pub mod snapshot_store;
pub mod storage;
pub mod transport;

pub use runtime::{spawn_node, NodeStatus, RaftConfig, RaftHandle};

/// Log position at which a submitted command was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub index: u64,
    pub term: u64,
}

/// Client-facing side of the consensus engine.
pub trait Consensus: Send + Sync {
    /// Replicates `command` and resolves once it has been committed and
    /// applied locally.
    ///
    /// When `timeout` elapses first the future resolves with
    /// [`ConsensusError::Timeout`], but the entry may still commit and apply
    /// later. There is no rollback. A zero `timeout` waits indefinitely.
    fn apply(
        &self,
        command: Vec<u8>,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<ApplyReport, ConsensusError>>;

    /// Adds a voting member known by `id` and reachable at `address`.
    ///
    /// A non-zero `prev_index` makes the change conditional on the latest
    /// configuration still being the one committed at that index.
    fn add_voter(
        &self,
        id: &str,
        address: &str,
        prev_index: u64,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<(), ConsensusError>>;
}

/// Deterministic state machine driven by committed log entries.
///
/// The engine calls `apply` from a single thread in commit order, exactly
/// once per entry.
pub trait StateMachine: Send + Sync {
    fn apply(&self, entry: &[u8]) -> Result<(), FsmError>;

    /// Returns a handle to the current state. Serialization is deferred to
    /// [`FsmSnapshot::persist`].
    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>, FsmError>;

    /// Replaces the whole state with the content read from `source`.
    fn restore(&self, source: &mut dyn Read) -> Result<(), FsmError>;
}

/// Point-in-time capture handed out by [`StateMachine::snapshot`].
pub trait FsmSnapshot: Send {
    /// Writes the state into `sink` and closes it. On any failure the sink is
    /// cancelled before the error is returned.
    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<(), SnapshotError>;

    fn release(self: Box<Self>);
}

/// Destination for snapshot bytes. Nothing written becomes visible until
/// `close` succeeds; `cancel` discards everything.
pub trait SnapshotSink: Write + Send {
    fn id(&self) -> &str;
    fn close(&mut self) -> io::Result<()>;
    fn cancel(&mut self) -> io::Result<()>;
}

/// Maps a member address to the numeric id raft uses internally.
///
/// The address is the member's identity, so the id has to be a pure function
/// of it: 64-bit FNV-1a, with 0 (raft's "no node") remapped.
pub fn member_id(address: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let hash = address.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    });
    if hash == 0 {
        1
    } else {
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_id_is_stable_and_distinct() {
        let a = member_id("127.0.0.1:7000");
        assert_eq!(a, member_id("127.0.0.1:7000"));
        assert_ne!(a, member_id("127.0.0.1:7001"));
        assert_ne!(a, 0);
    }

    #[test]
    fn member_id_matches_fnv1a_reference() {
        // Reference values for FNV-1a 64.
        assert_eq!(member_id(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(member_id("a"), 0xaf63_dc4c_8601_ec8c);
    }
}
