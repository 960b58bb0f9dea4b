//! Persistence layers behind the stored and relational analyzers.

pub mod kv;
pub mod sql;

pub use kv::{ChildRecord, DirRecord, FileRecord, KvStore};
pub use sql::{Row, SqlStore};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn to_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn from_secs(s: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(s.max(0) as u64)
}
