//! Snapshot producer for the key-value state machine.

use std::io::{self, Write};
use std::sync::Arc;

use tracing::warn;

use crate::consensus::{FsmSnapshot, SnapshotSink};
use crate::error::SnapshotError;
use crate::store::KvStore;

/// Handle over the live store. Holds no copy of the data; the store is
/// serialized when [`persist`](FsmSnapshot::persist) runs.
pub struct KvSnapshot {
    store: Arc<KvStore>,
}

impl KvSnapshot {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }
}

impl FsmSnapshot for KvSnapshot {
    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<(), SnapshotError> {
        let mut guard = SinkGuard::new(sink);
        let bytes = self.store.serialize().map_err(SnapshotError::Serialize)?;
        guard.write_all(&bytes).map_err(SnapshotError::Write)?;
        guard.close().map_err(SnapshotError::Close)
    }

    fn release(self: Box<Self>) {}
}

/// Cancels the wrapped sink on drop unless it was closed successfully.
struct SinkGuard<'a> {
    sink: &'a mut dyn SnapshotSink,
    closed: bool,
}

impl<'a> SinkGuard<'a> {
    fn new(sink: &'a mut dyn SnapshotSink) -> Self {
        Self {
            sink,
            closed: false,
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.sink.write_all(bytes)
    }

    fn close(mut self) -> io::Result<()> {
        self.sink.close()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for SinkGuard<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.sink.cancel() {
            warn!(sink = self.sink.id(), error = %err, "failed to cancel snapshot sink");
        }
    }
}
