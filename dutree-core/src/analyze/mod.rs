//! Analyzers: turn a directory on disk into an [`ItemRef`] tree.

use std::{
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use crossbeam_channel::Receiver;

use crate::{
    governor::{GovernorGuard, MemoryGovernor},
    item::{HardLinkedItems, ItemRef},
    progress::{Done, Progress, ProgressHub},
    sync::AdmissionPool,
    Options,
};

mod memory;
mod parallel;
mod sequential;
pub mod sqlite;
pub mod stored;
pub mod uring;
pub mod walk;

pub use memory::MemorySink;
pub use parallel::ParallelAnalyzer;
pub use sequential::SequentialAnalyzer;
pub use sqlite::SqliteAnalyzer;
pub use stored::StoredAnalyzer;
pub use uring::UringAnalyzer;

/// Ignore predicate, called with `(entry name, full path)`.
pub type IgnoreFn = dyn Fn(&str, &Path) -> bool + Send + Sync;

/// Predicate that ignores nothing.
pub fn ignore_nothing(_name: &str, _path: &Path) -> bool {
    false
}

/// Contract shared by every backend.
///
/// `analyze_dir` blocks until the scan has finished; a second thread can
/// follow it through [`Analyzer::progress`] and [`Analyzer::done`], both of
/// which must be obtained before the scan starts.
pub trait Analyzer: Send + Sync {
    fn analyze_dir(
        &self,
        path: &Path,
        ignore_dir: &IgnoreFn,
        ignore_file: Option<&IgnoreFn>,
    ) -> Result<ItemRef>;

    fn state(&self) -> &ScanState;

    fn progress(&self) -> Receiver<Progress> {
        self.state().progress.receiver()
    }

    fn done(&self) -> Done {
        self.state().progress.done()
    }

    fn reset_progress(&self) {
        self.state().progress.reset()
    }

    fn set_follow_symlinks(&self, follow: bool) {
        self.state().follow.store(follow, Ordering::Relaxed)
    }

    fn set_show_annexed_size(&self, show: bool) {
        self.state().annexed.store(show, Ordering::Relaxed)
    }
}

/// Options, toggles and progress channels common to all analyzers.
pub struct ScanState {
    options: Options,
    follow: AtomicBool,
    annexed: AtomicBool,
    progress: ProgressHub,
}

impl ScanState {
    pub fn new(options: Options) -> Self {
        Self {
            follow: AtomicBool::new(options.follow_symlinks),
            annexed: AtomicBool::new(options.show_annexed_size),
            options,
            progress: ProgressHub::new(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn progress_hub(&self) -> &ProgressHub {
        &self.progress
    }

    pub(crate) fn settings(&self) -> walk::WalkSettings {
        walk::WalkSettings {
            follow_symlinks: self.follow.load(Ordering::Relaxed),
            show_annexed_size: self.annexed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn governor(&self) -> Option<GovernorGuard> {
        MemoryGovernor::start_default(self.options.const_gc, self.options.governor_interval)
    }

    pub(crate) fn admission_pool(&self) -> AdmissionPool {
        AdmissionPool::new(self.options.scan_slots)
    }

    /// Broadcast completion whatever the outcome.
    pub(crate) fn finish<T>(&self, result: Result<T>) -> Result<T> {
        self.progress.finish();
        if let Err(e) = &result {
            log::debug!("scan failed: {e:#}");
        }
        result
    }
}

/// Recompute aggregates of a freshly built in-memory tree.
pub(crate) fn finalize(root: ItemRef) -> Result<ItemRef> {
    root.update_stats(&mut HardLinkedItems::new())?;
    Ok(root)
}
