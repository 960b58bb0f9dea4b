/// Aggregation constants
pub mod sizes {
    /// Bytes added to every directory's size and usage for its own entry storage.
    pub const DIR_OVERHEAD: u64 = 4096;

    /// Unit of `st_blocks` / `stx_blocks`.
    pub const BLOCK_SIZE: u64 = 512;
}

/// Scheduling constants
pub mod perf {
    /// Admission slots per available core for directory scans and parallel removal.
    pub const SCAN_SLOTS_PER_CORE: usize = 3;

    /// Fallback when `available_parallelism` cannot be queried.
    pub const FALLBACK_CORES: usize = 4;

    /// Default io_uring submission queue depth.
    pub const URING_SQ_DEPTH: u32 = 256;

    /// How often the memory governor samples pressure.
    pub const GOVERNOR_INTERVAL_MS: u64 = 1000;
}

/// Number of cores the process may use.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(perf::FALLBACK_CORES)
}

/// Default admission pool capacity: `SCAN_SLOTS_PER_CORE` times the core count.
pub fn default_scan_slots() -> usize {
    available_cores() * perf::SCAN_SLOTS_PER_CORE
}
