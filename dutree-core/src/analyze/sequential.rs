use std::path::Path;

use anyhow::Result;

use super::{
    finalize,
    walk::{StdStat, Walk},
    Analyzer, IgnoreFn, MemorySink, ScanState,
};
use crate::{item::ItemRef, Options};

/// Single-threaded in-memory analyzer.
pub struct SequentialAnalyzer {
    state: ScanState,
}

impl SequentialAnalyzer {
    pub fn new(options: Options) -> Self {
        Self {
            state: ScanState::new(options),
        }
    }
}

impl Default for SequentialAnalyzer {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

impl Analyzer for SequentialAnalyzer {
    fn analyze_dir(
        &self,
        path: &Path,
        ignore_dir: &IgnoreFn,
        ignore_file: Option<&IgnoreFn>,
    ) -> Result<ItemRef> {
        let _governor = self.state.governor();
        let sink = MemorySink::new(self.state.options().dir_overhead);
        let walk = Walk::new(&sink, &StdStat, self.state.settings(), self.state.progress_hub())
            .ignore(ignore_dir, ignore_file);
        let result = walk.sequential(path).and_then(finalize);
        self.state.finish(result)
    }

    fn state(&self) -> &ScanState {
        &self.state
    }
}
