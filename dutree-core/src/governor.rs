//! Memory-pressure governor.
//!
//! A background thread samples allocated/free memory and asks a [`Collector`]
//! to be more or less aggressive. Rust has no tracing collector to steer, so
//! the default [`RecordingCollector`] only records and logs the level; callers
//! embedding an arena or cache can plug in their own collector.

use std::{sync::Arc, thread::JoinHandle, time::Duration};

use parking_lot::{Condvar, Mutex};

/// Memory sample in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pressure {
    pub allocated: u64,
    pub free: u64,
}

/// How aggressively the collector should reclaim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcLevel {
    Disabled,
    Percent(u8),
}

pub trait PressureSource: Send + 'static {
    fn sample(&mut self) -> Option<Pressure>;
}

pub trait Collector: Send + Sync + 'static {
    fn level(&self) -> GcLevel;
    fn set_level(&self, level: GcLevel);
}

/// Collection is off while there is more free memory than the scan has
/// allocated; after that the percentage shrinks with the free/allocated ratio.
pub fn gc_level_for(p: Pressure) -> GcLevel {
    if p.allocated < p.free {
        return GcLevel::Disabled;
    }
    let pct = (p.free.saturating_mul(100) / p.allocated.max(1)).clamp(1, 100);
    GcLevel::Percent(pct as u8)
}

/// Stops the governor thread and restores the collector's original level
/// when dropped.
pub struct GovernorGuard {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
    collector: Arc<dyn Collector>,
    original: GcLevel,
}

impl Drop for GovernorGuard {
    fn drop(&mut self) {
        {
            let (lock, cv) = &*self.stop;
            *lock.lock() = true;
            cv.notify_all();
        }
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
        self.collector.set_level(self.original);
    }
}

pub struct MemoryGovernor;

impl MemoryGovernor {
    pub fn start(
        mut source: impl PressureSource,
        collector: Arc<dyn Collector>,
        interval: Duration,
    ) -> Option<GovernorGuard> {
        let original = collector.level();
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_c = stop.clone();
        let coll = collector.clone();
        let handle = std::thread::Builder::new()
            .name("dutree-governor".into())
            .spawn(move || {
                let (lock, cv) = &*stop_c;
                loop {
                    if let Some(p) = source.sample() {
                        let level = gc_level_for(p);
                        if level != coll.level() {
                            coll.set_level(level);
                        }
                    }
                    let mut stopped = lock.lock();
                    if !*stopped {
                        cv.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        break;
                    }
                }
            })
            .map_err(|e| log::warn!("cannot start memory governor: {e}"))
            .ok()?;
        Some(GovernorGuard {
            stop,
            handle: Some(handle),
            collector,
            original,
        })
    }

    /// Start with the platform pressure source and a recording collector,
    /// unless `const_gc` pins the level.
    pub fn start_default(const_gc: bool, interval: Duration) -> Option<GovernorGuard> {
        if const_gc {
            log::debug!("memory governor disabled (constant gc)");
            return None;
        }
        Self::start(ProcPressure, Arc::new(RecordingCollector::default()), interval)
    }
}

/// Records the requested level and logs transitions.
pub struct RecordingCollector {
    level: Mutex<GcLevel>,
}

impl Default for RecordingCollector {
    fn default() -> Self {
        Self {
            level: Mutex::new(GcLevel::Percent(100)),
        }
    }
}

impl Collector for RecordingCollector {
    fn level(&self) -> GcLevel {
        *self.level.lock()
    }

    fn set_level(&self, level: GcLevel) {
        let mut cur = self.level.lock();
        if *cur != level {
            log::debug!("gc level {:?} -> {:?}", *cur, level);
            *cur = level;
        }
    }
}

/// Resident size from `/proc/self/statm`, available memory from `/proc/meminfo`.
pub struct ProcPressure;

impl PressureSource for ProcPressure {
    #[cfg(target_os = "linux")]
    fn sample(&mut self) -> Option<Pressure> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page = if page > 0 { page as u64 } else { 4096 };
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let free_kb: u64 = meminfo
            .lines()
            .find(|l| l.starts_with("MemAvailable:"))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()?;
        Some(Pressure {
            allocated: rss_pages * page,
            free: free_kb * 1024,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&mut self) -> Option<Pressure> {
        None
    }
}
