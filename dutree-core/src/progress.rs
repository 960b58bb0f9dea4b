//! Live progress and the end-of-scan broadcast.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;

/// Snapshot of a running scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub current_path: PathBuf,
    pub item_count: u64,
    pub total_size: u64,
}

/// Completion signal. Every clone observes the broadcast at the same time:
/// the hub drops the only sender and all receivers see disconnection.
#[derive(Clone)]
pub struct Done(Receiver<()>);

impl Done {
    /// Block until the scan that handed out this signal has finished.
    pub fn wait(&self) {
        let _ = self.0.recv();
    }

    pub fn is_done(&self) -> bool {
        matches!(self.0.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// For use in `crossbeam_channel::select!` next to the progress receiver.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.0
    }
}

struct Channels {
    tx: Sender<Progress>,
    // kept so the producer can evict a stale snapshot
    rx: Receiver<Progress>,
    done_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
}

impl Channels {
    fn new() -> Self {
        let (tx, rx) = bounded(1);
        let (done_tx, done_rx) = bounded(0);
        Self {
            tx,
            rx,
            done_tx: Some(done_tx),
            done_rx,
        }
    }
}

/// Progress producer shared by the scan workers.
pub struct ProgressHub {
    channels: Mutex<Channels>,
    items: AtomicU64,
    size: AtomicU64,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHub {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(Channels::new()),
            items: AtomicU64::new(0),
            size: AtomicU64::new(0),
        }
    }

    pub fn receiver(&self) -> Receiver<Progress> {
        self.channels.lock().rx.clone()
    }

    pub fn done(&self) -> Done {
        Done(self.channels.lock().done_rx.clone())
    }

    /// Fresh channels and zeroed counters for the next scan.
    pub fn reset(&self) {
        *self.channels.lock() = Channels::new();
        self.items.store(0, Ordering::Relaxed);
        self.size.store(0, Ordering::Relaxed);
    }

    /// Account `items`/`size` and publish the running totals.
    pub fn add(&self, path: &Path, items: u64, size: u64) {
        let item_count = self.items.fetch_add(items, Ordering::Relaxed) + items;
        let total_size = self.size.fetch_add(size, Ordering::Relaxed) + size;
        self.publish(Progress {
            current_path: path.to_path_buf(),
            item_count,
            total_size,
        });
    }

    /// Latest-wins send: never blocks, never queues more than one snapshot.
    pub fn publish(&self, p: Progress) {
        let ch = self.channels.lock();
        match ch.tx.try_send(p) {
            Ok(()) => {}
            Err(TrySendError::Full(p)) => {
                let _ = ch.rx.try_recv();
                let _ = ch.tx.try_send(p);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Broadcast completion. Further calls are no-ops until `reset`.
    pub fn finish(&self) {
        if self.channels.lock().done_tx.take().is_some() {
            log::debug!(
                "scan done: {} items, {} bytes",
                self.items.load(Ordering::Relaxed),
                self.size.load(Ordering::Relaxed)
            );
        }
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.items.load(Ordering::Relaxed),
            self.size.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_latest_snapshot() {
        let hub = ProgressHub::new();
        let rx = hub.receiver();
        for i in 1..=10 {
            hub.add(Path::new("/x"), 1, i);
        }
        assert_eq!(rx.len(), 1);
        let p = rx.try_recv().unwrap();
        assert_eq!(p.item_count, 10);
        assert_eq!(p.total_size, 55);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn done_is_broadcast_to_every_clone() {
        let hub = ProgressHub::new();
        let a = hub.done();
        let b = a.clone();
        let c = hub.done();
        assert!(!a.is_done());
        hub.finish();
        hub.finish();
        a.wait();
        assert!(b.is_done());
        assert!(c.is_done());
    }

    #[test]
    fn reset_gives_fresh_channels() {
        let hub = ProgressHub::new();
        let old = hub.done();
        hub.add(Path::new("/x"), 3, 3);
        hub.finish();
        hub.reset();
        assert!(old.is_done());
        assert!(!hub.done().is_done());
        assert_eq!(hub.totals(), (0, 0));
        assert!(hub.receiver().try_recv().is_err());
    }
}
