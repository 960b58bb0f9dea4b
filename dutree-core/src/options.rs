use std::time::Duration;

use crate::constants::{self, perf, sizes};

/// Scan configuration shared by every analyzer.
#[derive(Clone, Debug)]
pub struct Options {
    pub follow_symlinks: bool,
    pub show_annexed_size: bool,
    pub dir_overhead: u64,  // added to every directory's size and usage
    pub scan_slots: usize,  // admission pool capacity
    pub threads: usize,     // worker threads of the parallel engine
    pub const_gc: bool,     // if true, the memory governor stays off
    pub governor_interval: Duration,
    pub uring_sq_depth: u32,
    pub disable_uring: bool,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl Default for Options {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
            show_annexed_size: false,
            dir_overhead: sizes::DIR_OVERHEAD,
            scan_slots: env_parse("DUTREE_SCAN_SLOTS")
                .filter(|&n: &usize| n > 0)
                .unwrap_or_else(constants::default_scan_slots),
            threads: env_parse("DUTREE_THREADS")
                .filter(|&n: &usize| n > 0)
                .unwrap_or_else(constants::available_cores),
            const_gc: env_flag("DUTREE_CONST_GC"),
            governor_interval: Duration::from_millis(perf::GOVERNOR_INTERVAL_MS),
            uring_sq_depth: env_parse("DUTREE_URING_SQ_DEPTH")
                .filter(|&n: &u32| n > 0)
                .unwrap_or(perf::URING_SQ_DEPTH),
            disable_uring: env_flag("DUTREE_DISABLE_URING"),
        }
    }
}

#[derive(Default, Clone)]
pub struct OptionsBuilder {
    pub follow_symlinks: Option<bool>,
    pub show_annexed_size: Option<bool>,
    pub dir_overhead: Option<u64>,
    pub scan_slots: Option<usize>,
    pub threads: Option<usize>,
    pub const_gc: Option<bool>,
    pub governor_interval: Option<Duration>,
    pub uring_sq_depth: Option<u32>,
    pub disable_uring: Option<bool>,
}

impl OptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn follow_symlinks(mut self, v: bool) -> Self {
        self.follow_symlinks = Some(v);
        self
    }
    pub fn show_annexed_size(mut self, v: bool) -> Self {
        self.show_annexed_size = Some(v);
        self
    }
    pub fn dir_overhead(mut self, v: u64) -> Self {
        self.dir_overhead = Some(v);
        self
    }
    pub fn scan_slots(mut self, v: usize) -> Self {
        self.scan_slots = Some(v);
        self
    }
    pub fn threads(mut self, v: usize) -> Self {
        self.threads = Some(v);
        self
    }
    pub fn const_gc(mut self, v: bool) -> Self {
        self.const_gc = Some(v);
        self
    }
    pub fn governor_interval(mut self, v: Duration) -> Self {
        self.governor_interval = Some(v);
        self
    }
    pub fn uring_sq_depth(mut self, v: u32) -> Self {
        self.uring_sq_depth = Some(v);
        self
    }
    pub fn disable_uring(mut self, v: bool) -> Self {
        self.disable_uring = Some(v);
        self
    }

    pub fn build(self) -> Options {
        let mut o = Options::default();
        if let Some(v) = self.follow_symlinks {
            o.follow_symlinks = v;
        }
        if let Some(v) = self.show_annexed_size {
            o.show_annexed_size = v;
        }
        if let Some(v) = self.dir_overhead {
            o.dir_overhead = v;
        }
        if let Some(v) = self.scan_slots {
            o.scan_slots = v.max(1);
        }
        if let Some(v) = self.threads {
            o.threads = v.max(1);
        }
        if let Some(v) = self.const_gc {
            o.const_gc = v;
        }
        if let Some(v) = self.governor_interval {
            o.governor_interval = v;
        }
        if let Some(v) = self.uring_sq_depth {
            o.uring_sq_depth = v.max(1);
        }
        if let Some(v) = self.disable_uring {
            o.disable_uring = v;
        }
        o
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let o = OptionsBuilder::new()
            .follow_symlinks(true)
            .dir_overhead(0)
            .scan_slots(0)
            .threads(2)
            .build();
        assert!(o.follow_symlinks);
        assert_eq!(o.dir_overhead, 0);
        assert_eq!(o.scan_slots, 1, "capacity is clamped to at least one slot");
        assert_eq!(o.threads, 2);
    }

    #[test]
    fn defaults_use_named_constants() {
        let o = OptionsBuilder::new().build();
        assert_eq!(o.dir_overhead, sizes::DIR_OVERHEAD);
        assert!(o.scan_slots >= 1);
        assert!(o.threads >= 1);
    }
}
