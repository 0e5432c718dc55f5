//! Raft log storage.
//!
//! Entries, hard state and configuration are served to raft from tikv/raft's
//! `MemStorage` and written through to a [`LogDb`] first, so the log survives
//! a restart. [`LogStore`] also makes snapshots requested by the leader (to
//! bring a lagging or freshly added follower up to date) carry the state
//! machine content and the member address table, not just raft metadata.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use raft::prelude::{ConfState, Entry, HardState, Snapshot, SnapshotMetadata};
use raft::storage::{GetEntriesContext, MemStorage, RaftState, Storage};
use raft::StorageError;
use tracing::warn;

use super::log_db::{DurableState, LogDb};
use super::{SnapshotSink, StateMachine};

/// Address of every configured member, keyed by raft id.
///
/// Shared between the node (which reads it to route messages) and the log
/// store (which keeps it durable and ships it inside snapshots).
#[derive(Debug, Clone, Default)]
pub struct MemberTable {
    inner: Arc<RwLock<BTreeMap<u64, String>>>,
}

impl MemberTable {
    pub fn get(&self, id: u64) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn insert(&self, id: u64, address: String) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, address);
    }

    fn replace(&self, members: BTreeMap<u64, String>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = members;
    }

    pub fn to_map(&self) -> BTreeMap<u64, String> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Raft `Storage` implementation used by the node.
#[derive(Clone)]
pub struct LogStore {
    mem: MemStorage,
    db: Arc<LogDb>,
    fsm: Arc<dyn StateMachine>,
    members: MemberTable,
}

impl LogStore {
    /// Loads whatever `db` holds into memory.
    ///
    /// Returns the store together with the loaded state so the caller can
    /// tell a fresh node from a restarted one.
    pub fn open(
        db: LogDb,
        fsm: Arc<dyn StateMachine>,
        members: MemberTable,
    ) -> Result<(Self, DurableState)> {
        let durable = db.load()?;
        let mem = MemStorage::new();
        {
            let mut core = mem.wl();
            if durable.log_start.index > 0 {
                let mut snapshot = Snapshot::default();
                *snapshot.mut_metadata() = durable.log_start.clone();
                core.apply_snapshot(snapshot)
                    .context("load log start failed")?;
            }
            if !durable.entries.is_empty() {
                core.append(&durable.entries).context("load log entries failed")?;
            }
            if let Some(conf_state) = &durable.conf_state {
                core.set_conf_state(conf_state.clone());
            }
            if durable.hard_state != HardState::default() {
                core.set_hardstate(durable.hard_state.clone());
            }
        }
        members.replace(durable.members.clone());

        let store = Self {
            mem,
            db: Arc::new(db),
            fsm,
            members,
        };
        Ok((store, durable))
    }

    /// Seeds an empty log with a configuration in which `id` is the only
    /// voter.
    ///
    /// The configuration sits in a snapshot at index 1 rather than in log
    /// entries, so the first log index is 2 and any member added later is
    /// brought up to date by a snapshot carrying the full configuration.
    pub fn bootstrap(&self, id: u64, address: &str) -> Result<()> {
        let mut snapshot = Snapshot::default();
        let meta = snapshot.mut_metadata();
        meta.index = 1;
        meta.term = 1;
        meta.mut_conf_state().voters = vec![id];
        self.install_snapshot(snapshot, BTreeMap::from([(id, address.to_string())]))
            .context("apply bootstrap configuration failed")
    }

    /// Resets the log to the position described by a snapshot, with
    /// `members` as the address table at that point.
    pub fn install_snapshot(
        &self,
        snapshot: Snapshot,
        members: BTreeMap<u64, String>,
    ) -> Result<()> {
        let meta = snapshot.get_metadata().clone();
        self.mem
            .wl()
            .apply_snapshot(snapshot)
            .context("apply snapshot failed")?;
        let hard_state = self.mem.initial_state()?.hard_state;
        self.db.install_snapshot(&meta, &hard_state, &members)?;
        self.members.replace(members);
        Ok(())
    }

    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        self.db.append(entries)?;
        self.mem.wl().append(entries).context("append entries failed")
    }

    pub fn set_hard_state(&self, hard_state: HardState) -> Result<()> {
        self.db.save_hard_state(&hard_state)?;
        self.mem.wl().set_hardstate(hard_state);
        Ok(())
    }

    pub fn set_commit(&self, commit: u64) -> Result<()> {
        let mut hard_state = self.mem.initial_state()?.hard_state;
        hard_state.commit = commit;
        self.set_hard_state(hard_state)
    }

    /// Records the configuration produced by the entry at `index`.
    pub fn set_conf_state(&self, conf_state: ConfState, index: u64) -> Result<()> {
        self.db.save_conf_state(&conf_state, index)?;
        self.mem.wl().set_conf_state(conf_state);
        Ok(())
    }

    pub fn add_member(&self, id: u64, address: String) -> Result<()> {
        let mut members = self.members.to_map();
        members.insert(id, address.clone());
        self.db.save_members(&members)?;
        self.members.insert(id, address);
        Ok(())
    }

    /// Discards entries before `index`.
    pub fn compact(&self, index: u64) -> Result<()> {
        if index <= self.mem.first_index()? {
            return Ok(());
        }
        let mut log_start = SnapshotMetadata::default();
        log_start.index = index - 1;
        log_start.term = self.mem.term(index - 1)?;
        *log_start.mut_conf_state() = self.conf_state()?;
        self.db.compact(&log_start)?;
        self.mem.wl().compact(index).context("compact log failed")
    }

    pub fn conf_state(&self) -> Result<ConfState> {
        Ok(self.mem.initial_state()?.conf_state)
    }

    pub fn hard_state(&self) -> Result<HardState> {
        Ok(self.mem.initial_state()?.hard_state)
    }

    fn capture_state(&self) -> Result<Vec<u8>> {
        let handle = self.fsm.snapshot()?;
        let mut sink = BufferSink::default();
        let persisted = handle.persist(&mut sink);
        handle.release();
        persisted?;
        Ok(encode_snapshot_data(&self.members.to_map(), &sink.into_inner())?)
    }
}

impl Storage for LogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let mut snapshot = self.mem.snapshot(request_index, to)?;
        match self.capture_state() {
            Ok(data) => {
                snapshot.data = data.into();
                Ok(snapshot)
            }
            Err(err) => {
                warn!(to, error = %err, "failed to capture snapshot for follower");
                Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable))
            }
        }
    }
}

/// In-memory sink used when a snapshot is shipped to a follower.
#[derive(Default)]
pub struct BufferSink {
    buf: Vec<u8>,
}

impl BufferSink {
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Write for BufferSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for BufferSink {
    fn id(&self) -> &str {
        "in-memory"
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn cancel(&mut self) -> io::Result<()> {
        self.buf.clear();
        Ok(())
    }
}

/// Frames the member table and the state machine bytes into one snapshot
/// payload: a big-endian u32 length, the member table as JSON, then the
/// state bytes.
pub fn encode_snapshot_data(members: &BTreeMap<u64, String>, state: &[u8]) -> io::Result<Vec<u8>> {
    let members = serde_json::to_vec(members)?;
    let len = u32::try_from(members.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "member table too large"))?;
    let mut data = Vec::with_capacity(4 + members.len() + state.len());
    data.extend_from_slice(&len.to_be_bytes());
    data.extend_from_slice(&members);
    data.extend_from_slice(state);
    Ok(data)
}

/// Splits a snapshot payload produced by [`encode_snapshot_data`].
pub fn decode_snapshot_data(data: &[u8]) -> io::Result<(BTreeMap<u64, String>, &[u8])> {
    let truncated = || io::Error::new(io::ErrorKind::InvalidData, "truncated snapshot payload");
    if data.len() < 4 {
        return Err(truncated());
    }
    let (len, rest) = data.split_at(4);
    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    if rest.len() < len {
        return Err(truncated());
    }
    let (members, state) = rest.split_at(len);
    let members = serde_json::from_slice(members)?;
    Ok((members, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::KvFsm;
    use crate::store::KvStore;

    #[test]
    fn snapshot_payload_round_trips() {
        let members = BTreeMap::from([(1, "a:1".to_string()), (2, "b:2".to_string())]);
        let data = encode_snapshot_data(&members, br#"{"x":"1"}"#).unwrap();
        let (decoded, state) = decode_snapshot_data(&data).unwrap();
        assert_eq!(decoded, members);
        assert_eq!(state, br#"{"x":"1"}"#);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        assert!(decode_snapshot_data(&[0, 0]).is_err());
        assert!(decode_snapshot_data(&[0, 0, 0, 9, b'{']).is_err());
    }

    fn open_log(dir: &std::path::Path, store: Arc<KvStore>) -> (LogStore, DurableState) {
        let db = LogDb::open(&dir.join("raft.db")).unwrap();
        LogStore::open(db, Arc::new(KvFsm::new(store)), MemberTable::default()).unwrap()
    }

    fn entry(index: u64, term: u64) -> Entry {
        let mut entry = Entry::default();
        entry.index = index;
        entry.term = term;
        entry
    }

    #[test]
    fn follower_snapshot_carries_state_and_members() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KvStore::new());
        store.set("x".into(), "1".into());
        let (log, _) = open_log(dir.path(), store);
        log.bootstrap(7, "127.0.0.1:7000").unwrap();

        let snapshot = log.snapshot(0, 9).unwrap();
        assert_eq!(snapshot.get_metadata().index, 1);
        assert_eq!(snapshot.get_metadata().get_conf_state().voters, vec![7]);

        let (members, state) = decode_snapshot_data(&snapshot.data).unwrap();
        assert_eq!(members.get(&7).map(String::as_str), Some("127.0.0.1:7000"));
        assert_eq!(state, br#"{"x":"1"}"#);
    }

    #[test]
    fn bootstrap_starts_log_after_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let (log, durable) = open_log(dir.path(), Arc::new(KvStore::new()));
        assert!(durable.is_empty());

        log.bootstrap(3, "n3").unwrap();
        assert_eq!(log.first_index().unwrap(), 2);
        assert_eq!(log.last_index().unwrap(), 1);
        assert_eq!(log.conf_state().unwrap().voters, vec![3]);
    }

    #[test]
    fn reopened_log_matches_what_was_written() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (log, _) = open_log(dir.path(), Arc::new(KvStore::new()));
            log.bootstrap(3, "n3").unwrap();
            log.append(&[entry(2, 2), entry(3, 2), entry(4, 2)]).unwrap();
            let mut hard_state = log.hard_state().unwrap();
            hard_state.term = 2;
            hard_state.vote = 3;
            log.set_hard_state(hard_state).unwrap();
            log.set_commit(4).unwrap();

            let mut conf_state = log.conf_state().unwrap();
            conf_state.voters.push(5);
            log.set_conf_state(conf_state, 4).unwrap();
            log.add_member(5, "n5".to_string()).unwrap();
            log.compact(3).unwrap();
        }

        let (log, durable) = open_log(dir.path(), Arc::new(KvStore::new()));
        assert!(!durable.is_empty());
        assert_eq!(durable.config_index, 4);
        assert_eq!(log.first_index().unwrap(), 3);
        assert_eq!(log.last_index().unwrap(), 4);
        assert_eq!(log.term(2).unwrap(), 2);
        assert_eq!(log.term(4).unwrap(), 2);

        let state = log.initial_state().unwrap();
        assert_eq!(state.hard_state.term, 2);
        assert_eq!(state.hard_state.vote, 3);
        assert_eq!(state.hard_state.commit, 4);
        assert_eq!(state.conf_state.voters, vec![3, 5]);
        assert_eq!(log.members.get(5).as_deref(), Some("n5"));
        assert_eq!(log.members.get(3).as_deref(), Some("n3"));
    }
}
