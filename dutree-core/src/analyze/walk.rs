//! Traversal engine shared by every analyzer.
//!
//! The engine lists and stats directories and hands what it finds to a
//! [`TreeSink`], which decides how nodes are materialized (in memory, in sled,
//! in SQLite). Two drivers exist: a recursive single-threaded one and a
//! work-stealing one in which a directory is finalized by whichever worker
//! delivers its last child, so no worker ever blocks on its children.

use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::Backoff;
use parking_lot::Mutex;

use super::IgnoreFn;
use crate::{
    constants::sizes::BLOCK_SIZE,
    error_handling::{record_error, ErrorRecovery, RecoveryAction, ScanError},
    item::Flag,
    progress::ProgressHub,
    symlink::{self, Followed},
    sync::{AdmissionPool, FirstError, WaitCounter},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    File,
    Dir,
    Symlink,
    Other,
}

/// The subset of `stat` the engine needs.
#[derive(Clone, Copy, Debug)]
pub struct RawStat {
    pub kind: Kind,
    pub size: u64,
    /// 512-byte blocks allocated.
    pub blocks: u64,
    pub ino: u64,
    pub nlink: u64,
    pub mtime: SystemTime,
}

impl RawStat {
    pub fn from_metadata(md: &fs::Metadata) -> Self {
        let ft = md.file_type();
        let kind = if ft.is_symlink() {
            Kind::Symlink
        } else if ft.is_dir() {
            Kind::Dir
        } else if ft.is_file() {
            Kind::File
        } else {
            Kind::Other
        };
        let mtime = md.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Self {
                kind,
                size: md.len(),
                blocks: md.blocks(),
                ino: md.ino(),
                nlink: md.nlink(),
                mtime,
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                kind,
                size: md.len(),
                blocks: md.len().div_ceil(BLOCK_SIZE),
                ino: 0,
                nlink: 1,
                mtime,
            }
        }
    }
}

/// Strategy for the per-entry stat step.
pub trait StatReader: Send + Sync {
    /// Stat every entry of `dir` without following symlinks. The result is
    /// aligned with `names`.
    fn stat_batch(&self, dir: &Path, names: &[OsString]) -> Vec<io::Result<RawStat>>;
}

/// Blocking `symlink_metadata` per entry.
#[derive(Default, Clone, Copy)]
pub struct StdStat;

impl StatReader for StdStat {
    fn stat_batch(&self, dir: &Path, names: &[OsString]) -> Vec<io::Result<RawStat>> {
        names
            .iter()
            .map(|n| fs::symlink_metadata(dir.join(n)).map(|md| RawStat::from_metadata(&md)))
            .collect()
    }
}

/// Entry names of `dir`, sorted.
pub fn read_names(dir: &Path) -> io::Result<Vec<OsString>> {
    let mut names = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.file_name()))
        .collect::<io::Result<Vec<_>>>()?;
    names.sort_unstable();
    Ok(names)
}

const READ_DIR_ATTEMPTS: usize = 3;

/// List `dir` with `list`, retrying errors whose recovery hint says so.
fn list_retrying(
    dir: &Path,
    mut list: impl FnMut(&Path) -> io::Result<Vec<OsString>>,
) -> Result<Vec<OsString>, ScanError> {
    let mut attempt = 1;
    loop {
        let err = match list(dir) {
            Ok(names) => return Ok(names),
            Err(source) => ScanError::ReadDir {
                path: dir.to_path_buf(),
                source,
            },
        };
        if err.recovery_action() != RecoveryAction::Retry || attempt >= READ_DIR_ATTEMPTS {
            return Err(err);
        }
        log::debug!("retrying after: {err}");
        attempt += 1;
    }
}

/// Settings that shape how entries become nodes.
#[derive(Clone, Copy, Debug)]
pub struct WalkSettings {
    pub follow_symlinks: bool,
    pub show_annexed_size: bool,
}

/// A directory about to be materialized.
#[derive(Debug)]
pub struct DirInfo<'a> {
    pub path: &'a Path,
    pub name: &'a str,
    pub mtime: SystemTime,
    pub flag: Flag,
}

/// A non-directory entry, fully resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub usage: u64,
    pub mtime: SystemTime,
    pub flag: Flag,
    /// Inode when the file has more than one link, else 0.
    pub inode: u64,
}

pub enum Child<D> {
    File(FileInfo),
    Dir(D),
}

/// Receives the tree as it is discovered.
///
/// `open_dir` is called before any of the directory's children are opened,
/// `finish_dir` once all of them are done, with children in listing order.
pub trait TreeSink: Send + Sync {
    type Dir: Send + Sync;
    type Done: Send;

    fn open_dir(&self, parent: Option<&Self::Dir>, info: &DirInfo<'_>) -> Result<Self::Dir>;
    fn finish_dir(&self, dir: &Self::Dir, children: Vec<Child<Self::Done>>)
        -> Result<Self::Done>;
}

struct Subdir {
    path: PathBuf,
    name: String,
    mtime: SystemTime,
}

enum Slot<D> {
    Ready(Child<D>),
    Subdir(Subdir),
}

/// One traversal over one root.
pub struct Walk<'a, S: TreeSink, R: StatReader> {
    sink: &'a S,
    reader: &'a R,
    settings: WalkSettings,
    progress: &'a ProgressHub,
    ignore_dir: Option<&'a IgnoreFn>,
    ignore_file: Option<&'a IgnoreFn>,
    errors: AtomicU64,
}

impl<'a, S: TreeSink, R: StatReader> Walk<'a, S, R> {
    pub fn new(sink: &'a S, reader: &'a R, settings: WalkSettings, progress: &'a ProgressHub) -> Self {
        Self {
            sink,
            reader,
            settings,
            progress,
            ignore_dir: None,
            ignore_file: None,
            errors: AtomicU64::new(0),
        }
    }

    pub fn ignore(mut self, dir: &'a IgnoreFn, file: Option<&'a IgnoreFn>) -> Self {
        self.ignore_dir = Some(dir);
        self.ignore_file = file;
        self
    }

    /// Per-entry errors logged so far.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn record(&self, err: ScanError) {
        record_error(&self.errors, &err);
    }

    fn root_mtime(root: &Path) -> Result<SystemTime> {
        let md = fs::metadata(root).with_context(|| format!("cannot open {}", root.display()))?;
        if !md.is_dir() {
            bail!("{} is not a directory", root.display());
        }
        Ok(md.modified().unwrap_or(SystemTime::UNIX_EPOCH))
    }

    fn file_info(&self, name: String, path: &Path, mut st: RawStat) -> FileInfo {
        let mut flag = Flag::Normal;
        match st.kind {
            Kind::File => {}
            Kind::Symlink if self.settings.follow_symlinks => {
                match symlink::follow(path, self.settings.show_annexed_size) {
                    Ok(Followed::Target(md)) => {
                        st = RawStat::from_metadata(&md);
                        if st.kind != Kind::File {
                            flag = Flag::Special;
                        }
                    }
                    Ok(Followed::Dir) => {
                        flag = Flag::Special;
                        st.size = 0;
                    }
                    Ok(Followed::Annexed(size)) => {
                        st.size = size;
                        st.blocks = size.div_ceil(BLOCK_SIZE);
                        st.nlink = 1;
                    }
                    Err(e) => {
                        self.record(e);
                        flag = Flag::Special;
                        st.size = 0;
                    }
                }
            }
            Kind::Symlink => {
                flag = Flag::Special;
                st.size = 0;
            }
            Kind::Dir | Kind::Other => flag = Flag::Special,
        }
        FileInfo {
            name,
            size: st.size,
            usage: st.blocks * BLOCK_SIZE,
            mtime: st.mtime,
            flag,
            inode: if st.nlink > 1 { st.ino } else { 0 },
        }
    }

    /// List and stat one directory, open it in the sink and resolve every
    /// child that does not need its own traversal.
    fn open(
        &self,
        path: &Path,
        name: &str,
        mtime: SystemTime,
        parent: Option<&S::Dir>,
        pool: Option<&AdmissionPool>,
    ) -> Result<(S::Dir, Vec<Slot<S::Done>>)> {
        let mut flag = Flag::Normal;
        let mut entries = Vec::new();
        {
            let _permit = pool.map(|p| p.acquire());
            match list_retrying(path, read_names) {
                Ok(names) => {
                    let stats = self.reader.stat_batch(path, &names);
                    entries = names.into_iter().zip(stats).collect::<Vec<_>>();
                }
                Err(err) => {
                    self.record(err);
                    flag = Flag::Error;
                }
            }
        }

        let mut slots: Vec<Option<Slot<S::Done>>> = Vec::with_capacity(entries.len());
        let mut ignored = Vec::new();
        let (mut items, mut bytes) = (1u64, 0u64);
        for (os_name, stat) in entries {
            let child_path = path.join(&os_name);
            let child_name = os_name.to_string_lossy().into_owned();
            let st = match stat {
                Ok(st) => st,
                Err(source) => {
                    self.record(ScanError::Stat {
                        path: child_path,
                        source,
                    });
                    flag = Flag::Error;
                    continue;
                }
            };
            if st.kind == Kind::Dir {
                if self.ignore_dir.is_some_and(|f| f(&child_name, &child_path)) {
                    ignored.push((slots.len(), child_name, st.mtime));
                    slots.push(None);
                } else {
                    slots.push(Some(Slot::Subdir(Subdir {
                        path: child_path,
                        name: child_name,
                        mtime: st.mtime,
                    })));
                }
                continue;
            }
            if self.ignore_file.is_some_and(|f| f(&child_name, &child_path)) {
                continue;
            }
            let info = self.file_info(child_name, &child_path, st);
            items += 1;
            bytes += info.size;
            slots.push(Some(Slot::Ready(Child::File(info))));
        }

        let dir = self.sink.open_dir(
            parent,
            &DirInfo {
                path,
                name,
                mtime,
                flag,
            },
        )?;
        for (idx, child_name, child_mtime) in ignored {
            let child_path = path.join(&child_name);
            let empty = self.sink.open_dir(
                Some(&dir),
                &DirInfo {
                    path: &child_path,
                    name: &child_name,
                    mtime: child_mtime,
                    flag: Flag::Empty,
                },
            )?;
            slots[idx] = Some(Slot::Ready(Child::Dir(
                self.sink.finish_dir(&empty, Vec::new())?,
            )));
            items += 1;
        }
        self.progress.add(path, items, bytes);
        Ok((dir, slots.into_iter().flatten().collect()))
    }

    /// Recursive single-threaded traversal.
    pub fn sequential(&self, root: &Path) -> Result<S::Done> {
        let mtime = Self::root_mtime(root)?;
        let name = crate::item::split_root(root).0;
        log::debug!("sequential walk of {}", root.display());
        self.walk_seq(root, &name, mtime, None)
    }

    fn walk_seq(
        &self,
        path: &Path,
        name: &str,
        mtime: SystemTime,
        parent: Option<&S::Dir>,
    ) -> Result<S::Done> {
        let (dir, slots) = self.open(path, name, mtime, parent, None)?;
        let mut children = Vec::with_capacity(slots.len());
        for slot in slots {
            children.push(match slot {
                Slot::Ready(c) => c,
                Slot::Subdir(s) => Child::Dir(self.walk_seq(&s.path, &s.name, s.mtime, Some(&dir))?),
            });
        }
        self.sink.finish_dir(&dir, children)
    }

    /// Work-stealing traversal on `threads` workers; directory listing is
    /// gated by `pool`.
    pub fn parallel(&self, root: &Path, threads: usize, pool: &AdmissionPool) -> Result<S::Done> {
        let mtime = Self::root_mtime(root)?;
        let name = crate::item::split_root(root).0;
        let threads = threads.max(1);
        log::debug!(
            "parallel walk of {} on {} threads, {} scan slots",
            root.display(),
            threads,
            pool.capacity()
        );

        let workers: Vec<Worker<Job<S>>> = (0..threads).map(|_| Worker::new_fifo()).collect();
        let shared = Shared {
            injector: Injector::new(),
            stealers: workers.iter().map(|w| w.stealer()).collect(),
            wait: WaitCounter::new(),
            pool,
            root: Mutex::new(None),
            error: FirstError::new(),
        };
        shared.wait.add(1);
        shared.injector.push(Job {
            path: root.to_path_buf(),
            name,
            mtime,
            up: None,
        });

        std::thread::scope(|scope| {
            let mut spawned = 0usize;
            for (i, local) in workers.into_iter().enumerate() {
                let shared = &shared;
                let builder = std::thread::Builder::new().name(format!("dutree-scan-{i}"));
                match builder.spawn_scoped(scope, move || self.work(i, &local, shared)) {
                    Ok(_) => spawned += 1,
                    Err(e) => log::warn!("cannot spawn scan worker {i}: {e}"),
                }
            }
            if spawned == 0 {
                // no thread could be started: drain the queue here
                let local = Worker::new_fifo();
                self.work(0, &local, &shared);
            }
            shared.wait.wait();
        });

        if let Some(e) = shared.error.take() {
            return Err(e);
        }
        let result = shared
            .root
            .lock()
            .take()
            .ok_or_else(|| anyhow!("walk of {} produced no root", root.display()));
        result
    }

    fn work(&self, index: usize, local: &Worker<Job<S>>, shared: &Shared<'_, S>) {
        let backoff = Backoff::new();
        let mut next = index % shared.stealers.len().max(1);
        loop {
            let job = local.pop().or_else(|| match shared.injector.steal() {
                Steal::Success(j) => Some(j),
                Steal::Empty | Steal::Retry => {
                    let len = shared.stealers.len();
                    let mut found = None;
                    for k in 0..len {
                        if let Steal::Success(j) = shared.stealers[(next + k) % len].steal() {
                            found = Some(j);
                            break;
                        }
                    }
                    if len > 0 {
                        next = (next + 1) % len;
                    }
                    found
                }
            });
            let Some(job) = job else {
                if shared.wait.is_idle() {
                    break;
                }
                if backoff.is_completed() {
                    std::thread::sleep(Duration::from_micros(200));
                } else {
                    backoff.snooze();
                }
                continue;
            };
            backoff.reset();
            if let Err(e) = self.process(local, shared, job) {
                shared.error.set(e);
            }
            shared.wait.done();
        }
    }

    fn process(&self, local: &Worker<Job<S>>, shared: &Shared<'_, S>, job: Job<S>) -> Result<()> {
        let parent = job.up.as_ref().map(|(p, _)| &p.dir);
        let (dir, slots) = self.open(&job.path, &job.name, job.mtime, parent, Some(shared.pool))?;

        let mut children = Vec::with_capacity(slots.len());
        let mut subdirs = Vec::new();
        for (idx, slot) in slots.into_iter().enumerate() {
            match slot {
                Slot::Ready(c) => children.push(Some(c)),
                Slot::Subdir(s) => {
                    children.push(None);
                    subdirs.push((idx, s));
                }
            }
        }
        if subdirs.is_empty() {
            let done = self
                .sink
                .finish_dir(&dir, children.into_iter().flatten().collect())?;
            return self.deliver(shared, job.up, done);
        }

        let pending = Arc::new(Pending {
            dir,
            children: Mutex::new(children),
            remaining: AtomicUsize::new(subdirs.len()),
            up: job.up,
        });
        shared.wait.add(subdirs.len());
        for (idx, s) in subdirs {
            local.push(Job {
                path: s.path,
                name: s.name,
                mtime: s.mtime,
                up: Some((pending.clone(), idx)),
            });
        }
        Ok(())
    }

    /// Hand a finished directory to its parent; finalize every ancestor whose
    /// last outstanding child this was.
    fn deliver(&self, shared: &Shared<'_, S>, mut up: Option<Up<S>>, mut done: S::Done) -> Result<()> {
        loop {
            let Some((pending, idx)) = up else {
                *shared.root.lock() = Some(done);
                return Ok(());
            };
            pending.children.lock()[idx] = Some(Child::Dir(done));
            if pending.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                return Ok(());
            }
            let children = std::mem::take(&mut *pending.children.lock());
            done = self
                .sink
                .finish_dir(&pending.dir, children.into_iter().flatten().collect())?;
            up = pending.up.clone();
        }
    }
}

type Up<S> = (Arc<Pending<S>>, usize);

/// A directory waiting for its subdirectories.
struct Pending<S: TreeSink> {
    dir: S::Dir,
    children: Mutex<Vec<Option<Child<S::Done>>>>,
    remaining: AtomicUsize,
    up: Option<Up<S>>,
}

struct Job<S: TreeSink> {
    path: PathBuf,
    name: String,
    mtime: SystemTime,
    up: Option<Up<S>>,
}

struct Shared<'p, S: TreeSink> {
    injector: Injector<Job<S>>,
    stealers: Vec<Stealer<Job<S>>>,
    wait: WaitCounter,
    pool: &'p AdmissionPool,
    root: Mutex<Option<S::Done>>,
    error: FirstError,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    /// Records the shape of the tree as nested name lists.
    #[derive(Default)]
    struct Shape {
        opened: Mutex<Vec<String>>,
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Node {
        File(String, u64),
        Dir(String, Flag, Vec<Node>),
    }

    impl TreeSink for Shape {
        type Dir = (String, Flag);
        type Done = Node;

        fn open_dir(&self, _parent: Option<&Self::Dir>, info: &DirInfo<'_>) -> Result<Self::Dir> {
            self.opened.lock().push(info.name.to_string());
            Ok((info.name.to_string(), info.flag))
        }

        fn finish_dir(&self, dir: &Self::Dir, children: Vec<Child<Node>>) -> Result<Node> {
            let kids = children
                .into_iter()
                .map(|c| match c {
                    Child::File(f) => Node::File(f.name, f.size),
                    Child::Dir(d) => d,
                })
                .collect();
            Ok(Node::Dir(dir.0.clone(), dir.1, kids))
        }
    }

    fn settings() -> WalkSettings {
        WalkSettings {
            follow_symlinks: false,
            show_annexed_size: false,
        }
    }

    fn fixture() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        for d in ["b/x", "b/y", "a", "c/deep/er"] {
            fs::create_dir_all(root.join(d)).unwrap();
        }
        fs::write(root.join("z.txt"), b"12345").unwrap();
        fs::write(root.join("b/x/f"), b"1").unwrap();
        fs::write(root.join("c/deep/er/g"), b"123").unwrap();
        tmp
    }

    fn names(n: &Node) -> BTreeMap<String, usize> {
        let mut m = BTreeMap::new();
        fn go(n: &Node, m: &mut BTreeMap<String, usize>) {
            match n {
                Node::File(name, _) => {
                    m.insert(name.clone(), 0);
                }
                Node::Dir(name, _, kids) => {
                    m.insert(name.clone(), kids.len());
                    kids.iter().for_each(|k| go(k, m));
                }
            }
        }
        go(n, &mut m);
        m
    }

    #[test]
    fn drivers_build_identical_ordered_trees() {
        let tmp = fixture();
        let root = tmp.path().join("root");
        let hub = ProgressHub::new();
        let sink = Shape::default();
        let seq = Walk::new(&sink, &StdStat, settings(), &hub)
            .sequential(&root)
            .unwrap();
        let pool = AdmissionPool::new(2);
        let par = Walk::new(&sink, &StdStat, settings(), &hub)
            .parallel(&root, 4, &pool)
            .unwrap();
        assert_eq!(seq, par);
        assert!(pool.peak() <= 2);
        match &seq {
            Node::Dir(name, Flag::Normal, kids) => {
                assert_eq!(name, "root");
                let order: Vec<_> = kids
                    .iter()
                    .map(|k| match k {
                        Node::File(n, _) | Node::Dir(n, _, _) => n.as_str(),
                    })
                    .collect();
                assert_eq!(order, ["a", "b", "c", "z.txt"]);
            }
            other => panic!("unexpected root {other:?}"),
        }
        assert_eq!(names(&seq)["b"], 2);
        assert_eq!(names(&seq)["er"], 1);
    }

    #[test]
    fn ignored_directories_become_empty_nodes() {
        let tmp = fixture();
        let root = tmp.path().join("root");
        let hub = ProgressHub::new();
        let sink = Shape::default();
        let ignore_c = |name: &str, _: &Path| name == "c";
        let ignore_txt = |name: &str, _: &Path| name.ends_with(".txt");
        let tree = Walk::new(&sink, &StdStat, settings(), &hub)
            .ignore(&ignore_c, Some(&ignore_txt))
            .sequential(&root)
            .unwrap();
        let Node::Dir(_, _, kids) = tree else {
            panic!("root is a dir")
        };
        assert_eq!(kids.len(), 3);
        assert_eq!(kids[2], Node::Dir("c".into(), Flag::Empty, vec![]));
        assert!(!sink.opened.lock().iter().any(|n| n == "deep"));
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = ProgressHub::new();
        let sink = Shape::default();
        let pool = AdmissionPool::new(1);
        let walk = Walk::new(&sink, &StdStat, settings(), &hub);
        assert!(walk.sequential(&tmp.path().join("nope")).is_err());
        assert!(walk.parallel(&tmp.path().join("nope"), 2, &pool).is_err());
    }

    struct Failing;

    impl TreeSink for Failing {
        type Dir = ();
        type Done = ();

        fn open_dir(&self, _: Option<&()>, info: &DirInfo<'_>) -> Result<()> {
            if info.name == "deep" {
                bail!("refused {}", info.name);
            }
            Ok(())
        }

        fn finish_dir(&self, _: &(), _: Vec<Child<()>>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn sink_errors_abort_the_parallel_walk() {
        let tmp = fixture();
        let hub = ProgressHub::new();
        let pool = AdmissionPool::new(4);
        let err = Walk::new(&Failing, &StdStat, settings(), &hub)
            .parallel(&tmp.path().join("root"), 3, &pool)
            .unwrap_err();
        assert!(err.to_string().contains("refused deep"));
    }

    #[test]
    fn progress_reports_running_totals() {
        let tmp = fixture();
        let hub = ProgressHub::new();
        let rx = hub.receiver();
        let sink = Shape::default();
        Walk::new(&sink, &StdStat, settings(), &hub)
            .sequential(&tmp.path().join("root"))
            .unwrap();
        let p = rx.try_recv().unwrap();
        // 8 directories and 3 files
        assert_eq!(p.item_count, 11);
        assert_eq!(p.total_size, 9);
    }

    #[test]
    fn interrupted_listings_are_retried() {
        let mut calls = 0;
        let names = list_retrying(Path::new("/x"), |_| {
            calls += 1;
            if calls < 3 {
                Err(io::Error::from(io::ErrorKind::Interrupted))
            } else {
                Ok(vec!["a".into()])
            }
        })
        .unwrap();
        assert_eq!(names, vec![OsString::from("a")]);
        assert_eq!(calls, 3);
    }

    #[test]
    fn listing_gives_up_on_hard_errors() {
        let mut calls = 0;
        let err = list_retrying(Path::new("/x"), |_| {
            calls += 1;
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        })
        .unwrap_err();
        assert!(matches!(err, ScanError::ReadDir { .. }));
        assert_eq!(calls, 1);

        let mut calls = 0;
        assert!(list_retrying(Path::new("/x"), |_| {
            calls += 1;
            Err(io::Error::from(io::ErrorKind::Interrupted))
        })
        .is_err());
        assert_eq!(calls, READ_DIR_ATTEMPTS);
    }
}
