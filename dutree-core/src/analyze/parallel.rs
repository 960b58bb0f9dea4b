use std::{
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::Result;

use super::{
    finalize,
    walk::{StdStat, Walk},
    Analyzer, IgnoreFn, MemorySink, ScanState,
};
use crate::{item::ItemRef, Options};

/// Work-stealing in-memory analyzer with bounded directory admission.
pub struct ParallelAnalyzer {
    state: ScanState,
    last_peak: AtomicUsize,
}

impl ParallelAnalyzer {
    pub fn new(options: Options) -> Self {
        Self {
            state: ScanState::new(options),
            last_peak: AtomicUsize::new(0),
        }
    }

    /// Highest number of directories listed at once during the last scan.
    pub fn last_peak(&self) -> usize {
        self.last_peak.load(Ordering::Relaxed)
    }
}

impl Default for ParallelAnalyzer {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

impl Analyzer for ParallelAnalyzer {
    fn analyze_dir(
        &self,
        path: &Path,
        ignore_dir: &IgnoreFn,
        ignore_file: Option<&IgnoreFn>,
    ) -> Result<ItemRef> {
        let _governor = self.state.governor();
        let opts = self.state.options();
        let sink = MemorySink::new(opts.dir_overhead);
        let pool = self.state.admission_pool();
        let walk = Walk::new(&sink, &StdStat, self.state.settings(), self.state.progress_hub())
            .ignore(ignore_dir, ignore_file);
        let result = walk.parallel(path, opts.threads, &pool).and_then(finalize);
        self.last_peak.store(pool.peak(), Ordering::Relaxed);
        if walk.errors() > 0 {
            log::debug!("{} entries could not be read", walk.errors());
        }
        self.state.finish(result)
    }

    fn state(&self) -> &ScanState {
        &self.state
    }
}
