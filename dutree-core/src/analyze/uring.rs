//! io_uring accelerated analyzer: directory listing stays on `read_dir`, the
//! per-entry stat step is submitted as one batch of `IORING_OP_STATX`.

use std::{ffi::OsString, io, path::Path};

use anyhow::Result;

use super::{
    finalize,
    walk::{RawStat, StatReader, StdStat, Walk},
    Analyzer, IgnoreFn, MemorySink, ScanState,
};
use crate::{item::ItemRef, Options};

/// Batched statx on a per-thread ring, falling back to blocking stats when
/// the thread cannot get a ring.
pub struct UringStat {
    sq_depth: u32,
}

impl UringStat {
    pub fn new(sq_depth: u32) -> Self {
        Self {
            sq_depth: sq_depth.max(1),
        }
    }
}

impl StatReader for UringStat {
    fn stat_batch(&self, dir: &Path, names: &[OsString]) -> Vec<io::Result<RawStat>> {
        #[cfg(all(target_os = "linux", feature = "uring"))]
        {
            match ring::with_ring(self.sq_depth, |r| ring::statx_batch(r, dir, names)) {
                Some(Ok(stats)) => return stats,
                Some(Err(e)) => log::debug!("statx batch in {} failed: {e}", dir.display()),
                None => {}
            }
        }
        StdStat.stat_batch(dir, names)
    }
}

pub struct UringAnalyzer {
    state: ScanState,
    reader: UringStat,
}

impl UringAnalyzer {
    /// Fails when io_uring is unavailable: other platforms, builds without
    /// the `uring` feature, `DUTREE_DISABLE_URING`, or a kernel that refuses
    /// to create a ring.
    pub fn new(options: Options) -> Result<Self> {
        if options.disable_uring {
            anyhow::bail!("io_uring disabled (DUTREE_DISABLE_URING)");
        }
        #[cfg(all(target_os = "linux", feature = "uring"))]
        {
            ring::probe(options.uring_sq_depth)?;
            Ok(Self {
                reader: UringStat::new(options.uring_sq_depth),
                state: ScanState::new(options),
            })
        }
        #[cfg(not(all(target_os = "linux", feature = "uring")))]
        {
            anyhow::bail!("io_uring support is not available in this build")
        }
    }
}

impl Analyzer for UringAnalyzer {
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
        let walk = Walk::new(&sink, &self.reader, self.state.settings(), self.state.progress_hub())
            .ignore(ignore_dir, ignore_file);
        let result = walk.parallel(path, opts.threads, &pool).and_then(finalize);
        self.state.finish(result)
    }

    fn state(&self) -> &ScanState {
        &self.state
    }
}

#[cfg(all(target_os = "linux", feature = "uring"))]
mod ring {
    use std::{
        cell::RefCell,
        ffi::{CString, OsString},
        fs, io,
        os::unix::{ffi::OsStrExt, io::AsRawFd},
        path::Path,
        time::{Duration, SystemTime, UNIX_EPOCH},
    };

    use io_uring::{opcode, types, IoUring};

    use crate::analyze::walk::{Kind, RawStat};

    enum Slot {
        Untried,
        Ready(IoUring),
        Unavailable,
    }

    thread_local! {
        static RING: RefCell<Slot> = const { RefCell::new(Slot::Untried) };
    }

    pub(super) fn probe(depth: u32) -> anyhow::Result<()> {
        IoUring::new(depth.max(1))
            .map(drop)
            .map_err(|e| anyhow::anyhow!("io_uring unavailable: {e}"))
    }

    /// A failed batch. `ring_lost` means completions may still be pending,
    /// so the ring must not be used again on this thread.
    pub(super) struct BatchError {
        pub(super) error: io::Error,
        pub(super) ring_lost: bool,
    }

    impl From<io::Error> for BatchError {
        fn from(error: io::Error) -> Self {
            Self {
                error,
                ring_lost: false,
            }
        }
    }

    /// Run `f` on this thread's ring, creating it on first use. `None` when
    /// the thread has no ring.
    pub(super) fn with_ring<T>(
        depth: u32,
        f: impl FnOnce(&mut IoUring) -> Result<T, BatchError>,
    ) -> Option<io::Result<T>> {
        RING.try_with(|cell| {
            let mut slot = cell.borrow_mut();
            if matches!(*slot, Slot::Untried) {
                *slot = match IoUring::new(depth) {
                    Ok(r) => Slot::Ready(r),
                    Err(e) => {
                        log::debug!("no io_uring for this worker, using blocking stat: {e}");
                        Slot::Unavailable
                    }
                };
            }
            let Slot::Ready(r) = &mut *slot else {
                return None;
            };
            let result = f(r);
            if let Err(e) = &result {
                if e.ring_lost {
                    log::warn!("io_uring retired for this worker: {}", e.error);
                    *slot = Slot::Unavailable;
                }
            }
            Some(result.map_err(|e| e.error))
        })
        .ok()
        .flatten()
    }

    pub(super) fn statx_batch(
        ring: &mut IoUring,
        dir: &Path,
        names: &[OsString],
    ) -> Result<Vec<io::Result<RawStat>>, BatchError> {
        let dirf = fs::File::open(dir)?;
        let fd = dirf.as_raw_fd();
        let cnames = names
            .iter()
            .map(|n| CString::new(n.as_bytes()).map_err(io::Error::other))
            .collect::<io::Result<Vec<_>>>()?;
        let mut bufs: Vec<libc::statx> = (0..names.len())
            .map(|_| unsafe { std::mem::zeroed() })
            .collect();
        let mut out: Vec<Option<io::Result<RawStat>>> = (0..names.len()).map(|_| None).collect();
        let depth = (ring.params().sq_entries() as usize).max(1);

        let mut start = 0;
        while start < names.len() {
            let end = (start + depth).min(names.len());
            let pushed = {
                let mut sq = ring.submission();
                let mut pushed = 0;
                for i in start..end {
                    let buf = &mut bufs[i] as *mut libc::statx as *mut types::statx;
                    let sqe = opcode::Statx::new(types::Fd(fd), cnames[i].as_ptr(), buf)
                        .mask(libc::STATX_BASIC_STATS)
                        .flags(libc::AT_SYMLINK_NOFOLLOW)
                        .build()
                        .user_data(i as u64);
                    // SAFETY: `cnames`, `bufs` and `dirf` stay alive until every
                    // completion is reaped, or are leaked below when that cannot
                    // be guaranteed
                    if unsafe { sq.push(&sqe) }.is_err() {
                        break;
                    }
                    pushed += 1;
                }
                pushed
            };
            let mut got = 0;
            let mut failure = (pushed < end - start)
                .then(|| io::Error::other("submission queue full"));
            while failure.is_none() && got < pushed {
                match ring.submit_and_wait(pushed - got) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => failure = Some(e),
                }
                for cqe in ring.completion() {
                    let i = cqe.user_data() as usize;
                    if !(start..end).contains(&i) || out[i].is_some() {
                        log::debug!("ignoring stray io_uring completion {i}");
                        continue;
                    }
                    let res = cqe.result();
                    out[i] = Some(if res < 0 {
                        Err(io::Error::from_raw_os_error(-res))
                    } else {
                        Ok(from_statx(&bufs[i]))
                    });
                    got += 1;
                }
            }
            if let Some(error) = failure {
                if got < pushed {
                    // the kernel may still write through these pointers
                    std::mem::forget(bufs);
                    std::mem::forget(cnames);
                    std::mem::forget(dirf);
                    return Err(BatchError {
                        error,
                        ring_lost: true,
                    });
                }
                return Err(error.into());
            }
            start = end;
        }
        Ok(out
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(io::Error::other("statx completion missing"))))
            .collect())
    }

    fn from_statx(stx: &libc::statx) -> RawStat {
        let kind = match stx.stx_mode as u32 & libc::S_IFMT {
            libc::S_IFDIR => Kind::Dir,
            libc::S_IFREG => Kind::File,
            libc::S_IFLNK => Kind::Symlink,
            _ => Kind::Other,
        };
        let mtime = u64::try_from(stx.stx_mtime.tv_sec)
            .map(|s| UNIX_EPOCH + Duration::new(s, stx.stx_mtime.tv_nsec))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        RawStat {
            kind,
            size: stx.stx_size,
            blocks: stx.stx_blocks,
            ino: stx.stx_ino,
            nlink: stx.stx_nlink as u64,
            mtime,
        }
    }

}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn uring_reader_agrees_with_std() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a"), b"12345").unwrap();
        fs::create_dir(tmp.path().join("d")).unwrap();
        let names: Vec<OsString> = vec!["a".into(), "d".into(), "missing".into()];
        let reader = UringStat::new(2);
        let got = reader.stat_batch(tmp.path(), &names);
        let want = StdStat.stat_batch(tmp.path(), &names);
        assert_eq!(got.len(), 3);
        for (g, w) in got.iter().zip(&want) {
            match (g, w) {
                (Ok(g), Ok(w)) => {
                    assert_eq!(g.kind, w.kind);
                    assert_eq!(g.size, w.size);
                    assert_eq!(g.ino, w.ino);
                }
                (Err(_), Err(_)) => {}
                other => panic!("readers disagree: {other:?}"),
            }
        }
    }

    #[test]
    fn disabled_uring_is_an_error() {
        let opts = crate::OptionsBuilder::new().disable_uring(true).build();
        assert!(UringAnalyzer::new(opts).is_err());
    }
}
