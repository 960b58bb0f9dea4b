use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;

/// Recommended next step when a recoverable error occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    SkipEntry,
    SkipDirectory,
    Retry,
}

/// Typed per-entry scan errors; used for diagnostics and recovery hints.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("{}: cannot read directory: {source}", path.display())]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{}: cannot stat entry: {source}", path.display())]
    Stat {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{}: cannot resolve symlink: {source}", path.display())]
    Symlink {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ScanError {
    pub fn path(&self) -> &Path {
        match self {
            ScanError::ReadDir { path, .. }
            | ScanError::Stat { path, .. }
            | ScanError::Symlink { path, .. } => path,
        }
    }
}

pub trait ErrorRecovery {
    fn recovery_action(&self) -> RecoveryAction;
}

impl ErrorRecovery for ScanError {
    fn recovery_action(&self) -> RecoveryAction {
        match self {
            ScanError::ReadDir { source, .. } => match source.kind() {
                std::io::ErrorKind::Interrupted => RecoveryAction::Retry,
                _ => RecoveryAction::SkipDirectory,
            },
            ScanError::Stat { source, .. } | ScanError::Symlink { source, .. } => {
                match source.kind() {
                    std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock => {
                        RecoveryAction::Retry
                    }
                    _ => RecoveryAction::SkipEntry,
                }
            }
        }
    }
}

/// Count the error and log it. The scan keeps going.
#[inline]
pub fn record_error(counter: &AtomicU64, err: &ScanError) {
    counter.fetch_add(1, Ordering::Relaxed);
    log::warn!("{err}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreadable_directory_skips_directory() {
        let err = ScanError::ReadDir {
            path: PathBuf::from("/x"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert_eq!(err.recovery_action(), RecoveryAction::SkipDirectory);
        assert!(err.to_string().starts_with("/x: cannot read directory"));
        assert_eq!(err.path(), Path::new("/x"));
    }

    #[test]
    fn interrupted_calls_are_retried() {
        let err = ScanError::ReadDir {
            path: PathBuf::from("/x"),
            source: std::io::Error::from(std::io::ErrorKind::Interrupted),
        };
        assert_eq!(err.recovery_action(), RecoveryAction::Retry);
        let err = ScanError::Stat {
            path: PathBuf::from("/x/y"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(err.recovery_action(), RecoveryAction::SkipEntry);
    }

    #[test]
    fn record_error_counts() {
        let counter = AtomicU64::new(0);
        let err = ScanError::Stat {
            path: PathBuf::from("/a/b"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        record_error(&counter, &err);
        record_error(&counter, &err);
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }
}
