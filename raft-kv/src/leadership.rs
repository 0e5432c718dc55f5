//! Leadership tracking and the write-availability gate.
//!
//! The consensus engine publishes "am I leader" booleans on a depth-1
//! channel. A single [`LeadershipMonitor`] thread consumes them and flips the
//! [`WriteGate`] that request handlers consult before accepting a write.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::info;

/// Whether this node currently accepts client writes.
///
/// Cloned into every request handler for reading; only the monitor writes.
#[derive(Debug, Clone, Default)]
pub struct WriteGate {
    enabled: Arc<AtomicBool>,
}

impl WriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, open: bool) {
        self.enabled.store(open, Ordering::Release);
    }
}

/// Producer side of the leadership channel.
///
/// The channel holds at most one value. Publishing while a value is still
/// pending replaces it, so a burst of flips collapses to the latest status.
pub struct LeadershipNotifier {
    tx: Sender<bool>,
    pending: Receiver<bool>,
}

impl LeadershipNotifier {
    pub fn notify(&self, is_leader: bool) {
        let mut value = is_leader;
        loop {
            match self.tx.try_send(value) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    let _ = self.pending.try_recv();
                    value = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// Creates the leadership channel. Dropping the notifier closes it.
pub fn leadership_channel() -> (LeadershipNotifier, Receiver<bool>) {
    let (tx, rx) = bounded(1);
    let notifier = LeadershipNotifier {
        tx,
        pending: rx.clone(),
    };
    (notifier, rx)
}

/// Sole consumer of leadership notifications and sole writer of the gate.
pub struct LeadershipMonitor {
    notifications: Receiver<bool>,
    gate: WriteGate,
}

impl LeadershipMonitor {
    pub fn new(notifications: Receiver<bool>, gate: WriteGate) -> Self {
        Self {
            notifications,
            gate,
        }
    }

    /// Applies every notification to the gate until the channel closes.
    ///
    /// A closed channel means the engine is gone, so the gate is left closed.
    pub fn run(self) {
        while let Ok(is_leader) = self.notifications.recv() {
            if is_leader {
                info!("became leader, enabling writes");
            } else {
                info!("no longer leader, disabling writes");
            }
            self.gate.set(is_leader);
        }
        self.gate.set(false);
        info!("leadership channel closed, writes disabled, monitor exiting");
    }

    /// Runs the monitor on a dedicated thread.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("leadership-monitor".to_string())
            .spawn(move || self.run())
    }
}
