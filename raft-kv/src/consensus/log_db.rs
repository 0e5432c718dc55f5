//! Durable raft state kept in redb.
//!
//! Everything raft needs to come back after a restart lives in one database
//! file: log entries, hard state, the latest configuration, the compaction
//! point and the member address table. [`LogStore`](super::storage::LogStore)
//! writes here before the in-memory log, so a ready state is on disk before
//! its committed entries are applied or its persisted messages are sent.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use prost::Message as ProstMessage;
use raft::prelude::{ConfState, Entry, HardState, SnapshotMetadata};
use redb::{Database, ReadableTable, TableDefinition};

const ENTRIES: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");
const STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_state");

const ADDRESS_KEY: &str = "address";
const HARD_STATE_KEY: &str = "hard_state";
const CONF_STATE_KEY: &str = "conf_state";
const CONFIG_INDEX_KEY: &str = "config_index";
const LOG_START_KEY: &str = "log_start";
const MEMBERS_KEY: &str = "members";

/// Raft state read back from disk.
#[derive(Debug, Default)]
pub struct DurableState {
    pub hard_state: HardState,
    pub conf_state: Option<ConfState>,
    /// Index of the entry that produced `conf_state`.
    pub config_index: u64,
    /// Index and term of the last entry no longer stored. Everything after it
    /// is in `entries`.
    pub log_start: SnapshotMetadata,
    pub entries: Vec<Entry>,
    pub members: BTreeMap<u64, String>,
}

impl DurableState {
    /// True when this node never joined or started a cluster.
    pub fn is_empty(&self) -> bool {
        self.log_start.index == 0
            && self.entries.is_empty()
            && self.hard_state == HardState::default()
    }
}

pub struct LogDb {
    db: Database,
}

impl LogDb {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("failed to open raft log at {}", path.display()))?;

        let txn = db.begin_write()?;
        {
            txn.open_table(ENTRIES)?;
            txn.open_table(STATE)?;
        }
        txn.commit()?;
        Ok(Self { db })
    }

    /// Raft address this node used last time it ran.
    pub fn address(&self) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let state = txn.open_table(STATE)?;
        let Some(value) = state.get(ADDRESS_KEY)? else {
            return Ok(None);
        };
        let address =
            String::from_utf8(value.value().to_vec()).context("stored address is not utf-8")?;
        Ok(Some(address))
    }

    pub fn save_address(&self, address: &str) -> Result<()> {
        self.put_state(ADDRESS_KEY, address.as_bytes())
    }

    pub fn load(&self) -> Result<DurableState> {
        let txn = self.db.begin_read()?;
        let state = txn.open_table(STATE)?;
        let log = txn.open_table(ENTRIES)?;

        let mut durable = DurableState::default();
        if let Some(value) = state.get(HARD_STATE_KEY)? {
            durable.hard_state = HardState::decode(value.value()).context("corrupt hard state")?;
        }
        if let Some(value) = state.get(CONF_STATE_KEY)? {
            durable.conf_state =
                Some(ConfState::decode(value.value()).context("corrupt configuration")?);
        }
        if let Some(value) = state.get(CONFIG_INDEX_KEY)? {
            durable.config_index =
                decode_u64(value.value()).context("corrupt configuration index")?;
        }
        if let Some(value) = state.get(LOG_START_KEY)? {
            durable.log_start =
                SnapshotMetadata::decode(value.value()).context("corrupt log start")?;
        }
        if let Some(value) = state.get(MEMBERS_KEY)? {
            durable.members =
                serde_json::from_slice(value.value()).context("corrupt member table")?;
        }
        for item in log.range(0u64..)? {
            let (index, value) = item?;
            let entry = Entry::decode(value.value())
                .with_context(|| format!("corrupt log entry {}", index.value()))?;
            durable.entries.push(entry);
        }
        Ok(durable)
    }

    /// Stores `entries`, first dropping any stored entry at or after the
    /// first new index, since a new leader may overwrite an uncommitted
    /// suffix.
    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let txn = self.db.begin_write()?;
        {
            let mut log = txn.open_table(ENTRIES)?;
            let stale: Vec<u64> = log
                .range(first.index..)?
                .map(|item| item.map(|(index, _)| index.value()))
                .collect::<Result<_, _>>()?;
            for index in stale {
                log.remove(index)?;
            }
            for entry in entries {
                log.insert(entry.index, &entry.encode_to_vec()[..])?;
            }
        }
        txn.commit().context("commit log entries failed")
    }

    pub fn save_hard_state(&self, hard_state: &HardState) -> Result<()> {
        self.put_state(HARD_STATE_KEY, &hard_state.encode_to_vec())
    }

    /// Records the configuration produced by the entry at `index`.
    pub fn save_conf_state(&self, conf_state: &ConfState, index: u64) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut state = txn.open_table(STATE)?;
            state.insert(CONF_STATE_KEY, &conf_state.encode_to_vec()[..])?;
            state.insert(CONFIG_INDEX_KEY, &index.to_be_bytes()[..])?;
        }
        txn.commit().context("commit configuration failed")
    }

    pub fn save_members(&self, members: &BTreeMap<u64, String>) -> Result<()> {
        self.put_state(MEMBERS_KEY, &serde_json::to_vec(members)?)
    }

    /// Replaces the whole log with the position described by `meta`.
    pub fn install_snapshot(
        &self,
        meta: &SnapshotMetadata,
        hard_state: &HardState,
        members: &BTreeMap<u64, String>,
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut log = txn.open_table(ENTRIES)?;
            let stored: Vec<u64> = log
                .range(0u64..)?
                .map(|item| item.map(|(index, _)| index.value()))
                .collect::<Result<_, _>>()?;
            for index in stored {
                log.remove(index)?;
            }

            let mut state = txn.open_table(STATE)?;
            state.insert(LOG_START_KEY, &meta.encode_to_vec()[..])?;
            state.insert(HARD_STATE_KEY, &hard_state.encode_to_vec()[..])?;
            state.insert(CONF_STATE_KEY, &meta.get_conf_state().encode_to_vec()[..])?;
            state.insert(CONFIG_INDEX_KEY, &meta.index.to_be_bytes()[..])?;
            state.insert(MEMBERS_KEY, &serde_json::to_vec(members)?[..])?;
        }
        txn.commit().context("commit snapshot position failed")
    }

    /// Drops every entry up to and including `log_start.index`.
    pub fn compact(&self, log_start: &SnapshotMetadata) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut log = txn.open_table(ENTRIES)?;
            let compacted: Vec<u64> = log
                .range(..=log_start.index)?
                .map(|item| item.map(|(index, _)| index.value()))
                .collect::<Result<_, _>>()?;
            for index in compacted {
                log.remove(index)?;
            }

            let mut state = txn.open_table(STATE)?;
            state.insert(LOG_START_KEY, &log_start.encode_to_vec()[..])?;
        }
        txn.commit().context("commit compaction failed")
    }

    fn put_state(&self, key: &str, value: &[u8]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut state = txn.open_table(STATE)?;
            state.insert(key, value)?;
        }
        txn.commit().with_context(|| format!("commit {key} failed"))
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes.try_into().context("expected 8 bytes")?;
    Ok(u64::from_be_bytes(bytes))
}
