//! The single observable event this system raises: `compaction.done`.
//!
//! Grounded on `change_stream.rs`'s subscriber fan-out via
//! `mpsc::SyncSender`, trimmed to the one event kind this system needs —
//! no resume tokens, no per-collection filters, no buffered replay. Those
//! are the teacher's own extension for a much larger change-stream API
//! that this system's single-collection scope doesn't call for.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

/// A handle a caller can poll (or move to another thread) to observe
/// `compaction.done` notifications.
pub struct CompactionWatcher {
    rx: Receiver<()>,
}

impl CompactionWatcher {
    /// Blocks until the next `compaction.done`, or returns `false` if the
    /// broker has been dropped.
    pub fn wait(&self) -> bool {
        self.rx.recv().is_ok()
    }

    pub fn try_recv(&self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

#[derive(Default)]
pub struct EventBroker {
    subscribers: Mutex<Vec<Sender<()>>>,
}

impl EventBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> CompactionWatcher {
        let (tx, rx) = channel();
        self.subscribers.lock().expect("event broker mutex poisoned").push(tx);
        CompactionWatcher { rx }
    }

    /// Fires `compaction.done` to every live subscriber; dead ones (whose
    /// watcher was dropped) are pruned.
    pub fn notify_compaction_done(&self) {
        let mut subs = self.subscribers.lock().expect("event broker mutex poisoned");
        subs.retain(|tx| tx.send(()).is_ok());
    }
}
