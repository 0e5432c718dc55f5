//! FSM adapter: turns committed log entries into store mutations.

use std::io::Read;
use std::sync::Arc;

use tracing::debug;

use crate::command::LogEntry;
use crate::consensus::{FsmSnapshot, StateMachine};
use crate::error::FsmError;
use crate::snapshot::KvSnapshot;
use crate::store::KvStore;

/// State machine over a shared [`KvStore`].
///
/// The engine guarantees one apply path in commit order; the store's own
/// lock is the only synchronisation needed against concurrent readers.
pub struct KvFsm {
    store: Arc<KvStore>,
}

impl KvFsm {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }
}

impl StateMachine for KvFsm {
    fn apply(&self, entry: &[u8]) -> Result<(), FsmError> {
        let LogEntry { key, value } = LogEntry::decode(entry).map_err(FsmError::CorruptLogEntry)?;
        debug!(%key, %value, "applying log entry");
        self.store.set(key, value);
        Ok(())
    }

    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>, FsmError> {
        Ok(Box::new(KvSnapshot::new(Arc::clone(&self.store))))
    }

    fn restore(&self, source: &mut dyn Read) -> Result<(), FsmError> {
        self.store.deserialize(source).map_err(FsmError::Restore)
    }
}
