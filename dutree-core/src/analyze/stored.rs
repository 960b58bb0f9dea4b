//! Analyzer persisting the tree to sled, and the lazily loaded nodes that
//! read it back.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::SystemTime,
};

use ahash::AHashSet;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;

use super::{
    walk::{Child, DirInfo, StdStat, TreeSink, Walk},
    Analyzer, IgnoreFn, ScanState,
};
use crate::{
    item::{propagate_delta, split_root, Delta, File, Flag, HardLinkedItems, Item, ItemRef, Stats},
    storage::{ChildRecord, DirRecord, FileRecord, KvStore},
    Options,
};

/// Scans with the parallel engine and writes one record per directory.
pub struct StoredAnalyzer {
    state: ScanState,
    store: Arc<KvStore>,
}

impl StoredAnalyzer {
    pub fn new(store: Arc<KvStore>, options: Options) -> Self {
        Self {
            state: ScanState::new(options),
            store,
        }
    }

    pub fn open(db: &Path, options: Options) -> Result<Self> {
        Ok(Self::new(Arc::new(KvStore::open(db)?), options))
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }
}

impl Analyzer for StoredAnalyzer {
    fn analyze_dir(
        &self,
        path: &Path,
        ignore_dir: &IgnoreFn,
        ignore_file: Option<&IgnoreFn>,
    ) -> Result<ItemRef> {
        let _governor = self.state.governor();
        let result = (|| -> Result<ItemRef> {
            let stale = self.store.remove_subtree(path)?;
            if stale > 0 {
                log::debug!("dropped {stale} stale records under {}", path.display());
            }
            let opts = self.state.options();
            let sink = StoredSink {
                store: &self.store,
                overhead: opts.dir_overhead,
                seen: Mutex::new(AHashSet::new()),
            };
            let pool = self.state.admission_pool();
            Walk::new(&sink, &StdStat, self.state.settings(), self.state.progress_hub())
                .ignore(ignore_dir, ignore_file)
                .parallel(path, opts.threads, &pool)?;
            self.store.add_root(path)?;
            self.store.flush()?;
            let root: ItemRef = StoredDir::load(self.store.clone(), path.to_path_buf(), opts.dir_overhead)?;
            Ok(root)
        })();
        self.state.finish(result)
    }

    fn state(&self) -> &ScanState {
        &self.state
    }
}

struct StoredSink<'a> {
    store: &'a KvStore,
    overhead: u64,
    seen: Mutex<AHashSet<u64>>,
}

struct OpenDir {
    path: PathBuf,
    name: String,
    mtime: SystemTime,
    flag: Flag,
}

struct Summary {
    name: String,
    stats: Stats,
    mtime: SystemTime,
    flag: Flag,
}

impl TreeSink for StoredSink<'_> {
    type Dir = OpenDir;
    type Done = Summary;

    fn open_dir(&self, _parent: Option<&OpenDir>, info: &DirInfo<'_>) -> Result<OpenDir> {
        Ok(OpenDir {
            path: info.path.to_path_buf(),
            name: info.name.to_string(),
            mtime: info.mtime,
            flag: info.flag,
        })
    }

    fn finish_dir(&self, dir: &OpenDir, children: Vec<Child<Summary>>) -> Result<Summary> {
        let mut stats = Stats {
            items: 1,
            size: self.overhead,
            usage: self.overhead,
        };
        let mut mtime = dir.mtime;
        let mut flag = dir.flag;
        let mut records = Vec::with_capacity(children.len());
        for child in children {
            match child {
                Child::File(f) => {
                    let dup = f.inode > 0 && !self.seen.lock().insert(f.inode);
                    stats.items += 1;
                    if !dup {
                        stats.size += f.size;
                        stats.usage += f.usage;
                    }
                    mtime = mtime.max(f.mtime);
                    records.push(ChildRecord::File(FileRecord {
                        name: f.name,
                        size: f.size,
                        usage: f.usage,
                        mtime: f.mtime,
                        flag: if dup { Flag::HardLink } else { f.flag },
                        inode: f.inode,
                    }));
                }
                Child::Dir(s) => {
                    stats += s.stats;
                    mtime = mtime.max(s.mtime);
                    if s.flag.is_error() && flag != Flag::Error {
                        flag = Flag::ChildError;
                    }
                    records.push(ChildRecord::Dir { name: s.name });
                }
            }
        }
        self.store.put_dir(
            &dir.path,
            &DirRecord {
                name: dir.name.clone(),
                stats,
                mtime,
                flag,
                children: records,
            },
        )?;
        Ok(Summary {
            name: dir.name.clone(),
            stats,
            mtime,
            flag,
        })
    }
}

/// Directory backed by a sled record, read through on every access.
pub struct StoredDir {
    store: Arc<KvStore>,
    path: PathBuf,
    name: String,
    overhead: u64,
    me: Weak<StoredDir>,
}

impl StoredDir {
    pub fn load(store: Arc<KvStore>, path: PathBuf, overhead: u64) -> Result<Arc<StoredDir>> {
        let rec = store.load_dir(&path)?;
        let name = if rec.name.is_empty() {
            split_root(&path).0
        } else {
            rec.name
        };
        Ok(Arc::new_cyclic(|me| StoredDir {
            store,
            path,
            name,
            overhead,
            me: me.clone(),
        }))
    }

    fn record(&self) -> Option<DirRecord> {
        self.store
            .load_dir(&self.path)
            .map_err(|e| log::warn!("{e:#}"))
            .ok()
    }

    fn with_record<T>(&self, f: impl FnOnce(&DirRecord) -> T, default: T) -> T {
        self.record().as_ref().map(f).unwrap_or(default)
    }

    fn placeholder(&self) -> ItemRef {
        Arc::new(ParentDir {
            store: self.store.clone(),
            path: self.path.clone(),
            name: self.name.clone(),
            overhead: self.overhead,
        })
    }

    fn file_item(&self, f: &FileRecord, parent: &ItemRef) -> ItemRef {
        let file = File::new(f.name.clone(), f.size, f.usage, f.mtime, f.flag, f.inode);
        file.set_detached_parent(parent.clone());
        Arc::new(file)
    }
}

impl Item for StoredDir {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_dir(&self) -> bool {
        true
    }

    fn size(&self) -> u64 {
        self.with_record(|r| r.stats.size, 0)
    }

    fn usage(&self) -> u64 {
        self.with_record(|r| r.stats.usage, 0)
    }

    fn item_count(&self) -> u64 {
        self.with_record(|r| r.stats.items, 0)
    }

    fn mtime(&self) -> SystemTime {
        self.with_record(|r| r.mtime, SystemTime::UNIX_EPOCH)
    }

    fn flag(&self) -> Flag {
        self.with_record(|r| r.flag, Flag::Error)
    }

    fn multi_linked_inode(&self) -> u64 {
        0
    }

    fn parent(&self) -> Option<ItemRef> {
        match self.store.is_root(&self.path) {
            Ok(false) => {}
            Ok(true) => return None,
            Err(e) => {
                log::warn!("{e:#}");
                return None;
            }
        }
        let parent = self.path.parent()?;
        match self.store.try_load_dir(parent) {
            Ok(Some(_)) => StoredDir::load(self.store.clone(), parent.to_path_buf(), self.overhead)
                .map(|d| d as ItemRef)
                .map_err(|e| log::warn!("{e:#}"))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                log::warn!("{e:#}");
                None
            }
        }
    }

    fn set_parent(&self, _parent: &ItemRef) {}

    fn add_file(&self, item: ItemRef) -> Result<()> {
        let mut rec = self.store.load_dir(&self.path)?;
        rec.children.retain(|c| c.name() != item.name());
        rec.children.push(if item.is_dir() {
            ChildRecord::Dir {
                name: item.name().to_string(),
            }
        } else {
            ChildRecord::File(FileRecord {
                name: item.name().to_string(),
                size: item.size(),
                usage: item.usage(),
                mtime: item.mtime(),
                flag: item.flag(),
                inode: item.multi_linked_inode(),
            })
        });
        rec.children.sort_by(|a, b| a.name().cmp(b.name()));
        self.store.put_dir(&self.path, &rec)
    }

    fn files(&self) -> Result<Vec<ItemRef>> {
        let rec = self.store.load_dir(&self.path)?;
        let placeholder = self.placeholder();
        rec.children
            .iter()
            .map(|c| match c {
                ChildRecord::File(f) => Ok(self.file_item(f, &placeholder)),
                ChildRecord::Dir { name } => {
                    StoredDir::load(self.store.clone(), self.path.join(name), self.overhead)
                        .map(|d| d as ItemRef)
                }
            })
            .collect()
    }

    fn remove_file(&self, item: &dyn Item) -> Result<()> {
        let mut rec = self.store.load_dir(&self.path)?;
        let idx = rec
            .children
            .iter()
            .position(|c| c.name() == item.name())
            .ok_or_else(|| anyhow!("{} is not a child of {}", item.name(), self.path.display()))?;
        let removed = rec.children.remove(idx);
        let stats = match &removed {
            ChildRecord::File(f) => Stats {
                items: 1,
                size: if f.flag == Flag::HardLink { 0 } else { f.size },
                usage: if f.flag == Flag::HardLink { 0 } else { f.usage },
            },
            ChildRecord::Dir { name } => {
                let child = self.path.join(name);
                let stats = self.store.load_dir(&child)?.stats;
                self.store.remove_subtree(&child)?;
                stats
            }
        };
        self.store.put_dir(&self.path, &rec)?;
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| anyhow!("{} is no longer referenced", self.path.display()))?;
        propagate_delta(me, Delta::removal(stats))
    }

    fn item_stats(&self, links: &mut HardLinkedItems) -> Result<Stats> {
        self.update_stats(links)?;
        Ok(self.store.load_dir(&self.path)?.stats)
    }

    fn update_stats(&self, links: &mut HardLinkedItems) -> Result<()> {
        let mut rec = self.store.load_dir(&self.path)?;
        let mut stats = Stats {
            items: 1,
            size: self.overhead,
            usage: self.overhead,
        };
        let mut mtime = rec.mtime;
        let mut flag = if rec.flag == Flag::ChildError {
            Flag::Normal
        } else {
            rec.flag
        };
        for child in rec.children.iter_mut() {
            match child {
                ChildRecord::File(f) => {
                    stats.items += 1;
                    mtime = mtime.max(f.mtime);
                    if f.inode > 0 && !links.register(f.inode, self.path.join(&f.name)) {
                        f.flag = Flag::HardLink;
                        continue;
                    }
                    if f.flag == Flag::HardLink {
                        f.flag = Flag::Normal;
                    }
                    stats.size += f.size;
                    stats.usage += f.usage;
                }
                ChildRecord::Dir { name } => {
                    let sub = StoredDir::load(self.store.clone(), self.path.join(&*name), self.overhead)?;
                    stats += sub.item_stats(links)?;
                    mtime = mtime.max(sub.mtime());
                    if sub.flag().is_error() && flag != Flag::Error {
                        flag = Flag::ChildError;
                    }
                }
            }
        }
        rec.stats = stats;
        rec.mtime = mtime;
        rec.flag = flag;
        self.store.put_dir(&self.path, &rec)
    }

    fn apply_delta(&self, delta: Delta) -> Result<()> {
        let mut rec = self.store.load_dir(&self.path)?;
        rec.apply(delta);
        self.store.put_dir(&self.path, &rec)
    }
}

/// Stand-in parent for files handed out by [`StoredDir::files`]. Only its
/// identity is known; asking it for statistics is a logic error.
pub struct ParentDir {
    store: Arc<KvStore>,
    path: PathBuf,
    name: String,
    overhead: u64,
}

impl ParentDir {
    fn misuse(&self, what: &str) -> ! {
        panic!("{what} must not be called on ParentDir ({})", self.path.display())
    }
}

impl Item for ParentDir {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_dir(&self) -> bool {
        true
    }

    fn parent(&self) -> Option<ItemRef> {
        if self.store.is_root(&self.path).unwrap_or(true) {
            return None;
        }
        let parent = self.path.parent()?;
        StoredDir::load(self.store.clone(), parent.to_path_buf(), self.overhead)
            .ok()
            .map(|d| d as ItemRef)
    }

    fn size(&self) -> u64 {
        self.misuse("size")
    }

    fn usage(&self) -> u64 {
        self.misuse("usage")
    }

    fn item_count(&self) -> u64 {
        self.misuse("item_count")
    }

    fn mtime(&self) -> SystemTime {
        self.misuse("mtime")
    }

    fn flag(&self) -> Flag {
        self.misuse("flag")
    }

    fn multi_linked_inode(&self) -> u64 {
        self.misuse("multi_linked_inode")
    }

    fn set_parent(&self, _parent: &ItemRef) {
        self.misuse("set_parent")
    }

    fn add_file(&self, _item: ItemRef) -> Result<()> {
        self.misuse("add_file")
    }

    fn files(&self) -> Result<Vec<ItemRef>> {
        self.misuse("files")
    }

    fn remove_file(&self, _item: &dyn Item) -> Result<()> {
        self.misuse("remove_file")
    }

    fn item_stats(&self, _links: &mut HardLinkedItems) -> Result<Stats> {
        self.misuse("item_stats")
    }

    fn update_stats(&self, _links: &mut HardLinkedItems) -> Result<()> {
        self.misuse("update_stats")
    }

    fn apply_delta(&self, _delta: Delta) -> Result<()> {
        self.misuse("apply_delta")
    }
}
