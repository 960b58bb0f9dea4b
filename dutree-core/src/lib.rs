//! Disk usage analysis: scan a directory into a tree of sized items, keep it
//! in memory, in sled or in SQLite, and delete from it while the aggregates
//! stay consistent.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod analyze;
#[cfg(feature = "archive")]
pub mod archive;
pub mod constants;
pub mod error_handling;
pub mod export;
pub mod governor;
pub mod item;
pub mod options;
pub mod progress;
pub mod remove;
pub mod storage;
pub mod symlink;
pub mod sync;
pub mod top;

pub use analyze::{
    ignore_nothing, Analyzer, IgnoreFn, ParallelAnalyzer, ScanState, SequentialAnalyzer,
    SqliteAnalyzer, StoredAnalyzer, UringAnalyzer,
};
#[cfg(feature = "archive")]
pub use archive::{ArchiveDir, ArchiveEntry};
pub use error_handling::{ErrorRecovery, RecoveryAction, ScanError};
pub use export::{decode_json, encode_json};
pub use item::{Delta, Dir, File, Flag, HardLinkedItems, Item, ItemRef, Stats};
pub use options::{Options, OptionsBuilder};
pub use progress::{Done, Progress};
pub use remove::{empty_file, remove_item, remove_item_parallel};
pub use top::collect_top_files;
