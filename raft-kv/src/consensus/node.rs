//! Raft node driving the state machine.
//!
//! [`RaftNode`] wraps tikv/raft's `RawNode` and owns the only apply path:
//! committed entries reach the [`StateMachine`] from `poll_ready`, strictly
//! in log order, on whichever single thread drives the node.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, Config, Entry, EntryType, Message, RawNode, Snapshot,
};
use raft::StateRole;
use slog::{o, Logger};
use tracing::{error, info, warn};

use super::log_db::{DurableState, LogDb};
use super::snapshot_store::{FileSnapshotStore, SnapshotMeta};
use super::storage::{decode_snapshot_data, LogStore, MemberTable};
use super::{SnapshotSink, StateMachine};

/// Creates a logger that discards all output.
///
/// tikv/raft requires a slog logger; logging happens through `tracing` at
/// the application level instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Entries kept in the log behind a snapshot so slightly lagging followers
/// can catch up without a full snapshot transfer.
const TRAILING_LOGS: u64 = 128;

/// What an applied entry turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedKind {
    /// A client command, applied to the state machine.
    Command,
    /// A voter was added.
    Membership { node_id: u64, address: String },
    /// Leader no-ops and dropped proposals.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEntry {
    pub index: u64,
    pub term: u64,
    pub kind: AppliedKind,
}

/// Output from processing a raft ready state.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<AppliedEntry>,
}

pub struct RaftNode {
    id: u64,
    raw: RawNode<LogStore>,
    log: LogStore,
    fsm: Arc<dyn StateMachine>,
    members: MemberTable,
    snapshots: FileSnapshotStore,
    applied_index: u64,
    applied_term: u64,
    config_index: u64,
    snapshot_index: u64,
    bootstrapped: bool,
}

impl RaftNode {
    /// Opens the member at `address` on top of its durable log and snapshots.
    ///
    /// A restarted node restores the state machine from its newest snapshot
    /// and raft re-delivers the committed entries after it. A node with no
    /// local state either bootstraps a single-voter cluster or, without
    /// `bootstrap`, waits to be added by an existing leader.
    ///
    /// Timing assumes `tick()` every 100ms: elections after 1-2s without a
    /// leader, heartbeats every 300ms.
    pub fn open(
        address: &str,
        fsm: Arc<dyn StateMachine>,
        db: LogDb,
        snapshots: FileSnapshotStore,
        bootstrap: bool,
    ) -> Result<Self> {
        let id = super::member_id(address);
        db.save_address(address)?;
        let members = MemberTable::default();
        let (log, durable) = LogStore::open(db, Arc::clone(&fsm), members.clone())?;

        let latest = snapshots.latest().context("failed to list snapshots")?;
        let bootstrapped = bootstrap && latest.is_none() && durable.is_empty();
        let (applied_index, applied_term, config_index) = match latest {
            Some(meta) => {
                if bootstrap {
                    info!(snapshot = %meta.id, "local state found, skipping bootstrap");
                }
                let mut state = snapshots
                    .open_state(&meta.id)
                    .with_context(|| format!("failed to open snapshot {}", meta.id))?;
                fsm.restore(&mut state).context("restore state machine failed")?;
                let config_index = if durable.is_empty() {
                    log.install_snapshot(snapshot_at(&meta), meta.members.clone())?;
                    meta.index
                } else {
                    check_restart_point(&durable, meta.index)?;
                    durable.config_index
                };
                info!(id, index = meta.index, term = meta.term, "restored from local snapshot");
                (meta.index, meta.term, config_index)
            }
            None if !durable.is_empty() => {
                // Only the bootstrap configuration precedes the log without a
                // snapshot to back it.
                if durable.log_start.index > 1 {
                    bail!(
                        "raft log starts after index {} but no local snapshot covers it",
                        durable.log_start.index
                    );
                }
                if bootstrap {
                    info!(id, "local raft log found, skipping bootstrap");
                }
                (
                    durable.log_start.index,
                    durable.log_start.term,
                    durable.config_index,
                )
            }
            None if bootstrap => {
                log.bootstrap(id, address)?;
                info!(id, address, "bootstrapped new cluster");
                (1, 1, 1)
            }
            None => (0, 0, 0),
        };

        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            max_size_per_msg: 1024 * 1024,
            applied: applied_index,
            ..Default::default()
        };
        let raw = RawNode::new(&cfg, log.clone(), &silent_logger())
            .with_context(|| format!("failed to construct RawNode {id}"))?;

        Ok(Self {
            id,
            raw,
            log,
            fsm,
            members,
            snapshots,
            applied_index,
            applied_term,
            config_index,
            snapshot_index: applied_index,
            bootstrapped,
        })
    }

    /// Advances raft's logical clock by one tick.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    /// Starts an election right away instead of waiting for the timeout.
    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    pub fn is_leader(&self) -> bool {
        self.role() == StateRole::Leader
    }

    /// Current leader's id, or 0 if none is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    /// Index of the entry (or snapshot) that produced the current
    /// configuration.
    pub fn config_index(&self) -> u64 {
        self.config_index
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    /// True when opening this node created a new single-voter cluster.
    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    pub fn member_address(&self, id: u64) -> Option<String> {
        self.members.get(id)
    }

    pub fn members(&self) -> BTreeMap<u64, String> {
        self.members.to_map()
    }

    /// Appends a command to the log. Returns the index and term it was
    /// assigned; it is not committed yet.
    pub fn propose(&mut self, command: Vec<u8>) -> raft::Result<(u64, u64)> {
        self.raw.propose(vec![], command)?;
        Ok(self.last_position())
    }

    /// Proposes adding `node_id` as a voter reachable at `address`.
    pub fn propose_add_voter(&mut self, node_id: u64, address: &str) -> raft::Result<(u64, u64)> {
        let mut change = ConfChange::default();
        change.set_change_type(ConfChangeType::AddNode);
        change.node_id = node_id;
        change.context = address.as_bytes().to_vec().into();
        self.raw.propose_conf_change(vec![], change)?;
        Ok(self.last_position())
    }

    fn last_position(&self) -> (u64, u64) {
        (self.raw.raft.raft_log.last_index(), self.raw.raft.term)
    }

    /// Processes a raft message from another node.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Runs one Ready/LightReady cycle if raft has work.
    ///
    /// Phase 1 persists the snapshot, new entries and hard state, then applies
    /// committed entries and releases messages that required persistence.
    /// Phase 2 persists the advanced commit index and applies whatever else
    /// became committed.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = Vec::new();

        outbound.extend(ready.take_messages());

        if !ready.snapshot().is_empty() {
            self.install_snapshot(ready.snapshot().clone())?;
        }

        if !ready.entries().is_empty() {
            self.log.append(ready.entries())?;
        }

        if let Some(hard_state) = ready.hs() {
            self.log.set_hard_state(hard_state.clone())?;
        }

        applied.extend(self.apply_entries(ready.take_committed_entries())?);
        outbound.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.log.set_commit(commit)?;
        }

        outbound.extend(light_ready.take_messages());
        applied.extend(self.apply_entries(light_ready.take_committed_entries())?);

        self.raw.advance_apply();

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
        }))
    }

    /// Replaces the log, configuration and state machine with a snapshot sent
    /// by the leader. The snapshot is stored locally first so a restart finds
    /// the state the log now starts after.
    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let index = snapshot.get_metadata().index;
        let term = snapshot.get_metadata().term;
        let (members, state) = match decode_snapshot_data(&snapshot.data) {
            Ok(decoded) => decoded,
            Err(err) => fail_fast(index, &err),
        };
        let mut reader = state;
        if let Err(err) = self.fsm.restore(&mut reader) {
            fail_fast(index, &err);
        }

        let voters = snapshot.get_metadata().get_conf_state().voters.clone();
        self.store_snapshot(SnapshotMeta::new(index, term, voters, members.clone()), state)?;
        self.log.install_snapshot(snapshot, members)?;

        self.applied_index = index;
        self.applied_term = term;
        self.config_index = index;
        self.snapshot_index = index;
        info!(id = self.id, index, term, "installed snapshot from leader");
        Ok(())
    }

    fn store_snapshot(&self, meta: SnapshotMeta, state: &[u8]) -> Result<()> {
        let mut sink = self.snapshots.create(meta).context("create snapshot failed")?;
        let written = sink.write_all(state).and_then(|()| sink.close());
        if written.is_err() {
            if let Err(err) = sink.cancel() {
                warn!(error = %err, "failed to discard unfinished snapshot");
            }
        }
        written.context("store snapshot from leader failed")
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<AppliedEntry>> {
        let mut applied = Vec::with_capacity(entries.len());
        for entry in entries {
            let kind = match entry.entry_type() {
                EntryType::EntryNormal if entry.data.is_empty() => AppliedKind::Empty,
                EntryType::EntryNormal => {
                    if let Err(err) = self.fsm.apply(&entry.data) {
                        fail_fast(entry.index, &err);
                    }
                    AppliedKind::Command
                }
                EntryType::EntryConfChange => self.apply_conf_change(&entry)?,
                EntryType::EntryConfChangeV2 => {
                    warn!(index = entry.index, "ignoring joint configuration entry");
                    AppliedKind::Empty
                }
            };
            self.applied_index = entry.index;
            self.applied_term = entry.term;
            applied.push(AppliedEntry {
                index: entry.index,
                term: entry.term,
                kind,
            });
        }
        Ok(applied)
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<AppliedKind> {
        if entry.data.is_empty() {
            return Ok(AppliedKind::Empty);
        }
        let change = match ConfChange::decode(&entry.data[..]) {
            Ok(change) => change,
            Err(err) => fail_fast(entry.index, &err),
        };
        let conf_state = self
            .raw
            .apply_conf_change(&change)
            .context("apply conf change failed")?;
        self.log.set_conf_state(conf_state, entry.index)?;
        self.config_index = entry.index;

        let address = String::from_utf8_lossy(&change.context).into_owned();
        match change.change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                info!(node_id = change.node_id, %address, index = entry.index, "member added");
                self.log.add_member(change.node_id, address.clone())?;
            }
            ConfChangeType::RemoveNode => {
                warn!(node_id = change.node_id, "remove-node entries are not produced by this layer");
            }
        }
        Ok(AppliedKind::Membership {
            node_id: change.node_id,
            address,
        })
    }

    /// Persists a snapshot of everything applied so far and compacts the log
    /// behind it.
    pub fn take_snapshot(&mut self) -> Result<SnapshotMeta> {
        let voters = self.log.conf_state()?.voters;
        let meta = SnapshotMeta::new(self.applied_index, self.applied_term, voters, self.members());

        let handle = self.fsm.snapshot()?;
        let mut sink = self
            .snapshots
            .create(meta.clone())
            .context("create snapshot failed")?;
        let persisted = handle.persist(&mut sink);
        handle.release();
        persisted?;

        self.snapshot_index = meta.index;
        let compact_to = meta.index.saturating_sub(TRAILING_LOGS);
        if compact_to > 0 {
            self.log.compact(compact_to)?;
        }
        Ok(meta)
    }
}

fn snapshot_at(meta: &SnapshotMeta) -> Snapshot {
    let mut snapshot = Snapshot::default();
    let snapshot_meta = snapshot.mut_metadata();
    snapshot_meta.index = meta.index;
    snapshot_meta.term = meta.term;
    snapshot_meta.mut_conf_state().voters = meta.voters.clone();
    snapshot
}

/// The newest snapshot must sit inside what the durable log can continue
/// from: not before its first entry and not past its commit index.
fn check_restart_point(durable: &DurableState, snapshot_index: u64) -> Result<()> {
    let first = durable.log_start.index;
    let commit = durable.hard_state.commit;
    if snapshot_index < first || snapshot_index > commit {
        bail!(
            "snapshot at index {snapshot_index} does not fit the raft log \
             (starts after {first}, committed up to {commit})"
        );
    }
    Ok(())
}

/// An entry or snapshot that made it through consensus cannot be applied.
/// Continuing would let this node diverge from the others.
fn fail_fast(index: u64, err: &dyn Display) -> ! {
    error!(index, error = %err, "unrecoverable replicated entry, aborting");
    std::process::abort();
}
