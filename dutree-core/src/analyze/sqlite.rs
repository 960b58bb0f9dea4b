//! Relational backend: the tree lives in an SQLite `items` table and is
//! served lazily by [`SqlItem`].

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use anyhow::{anyhow, Result};

use super::{
    walk::{Child, DirInfo, StdStat, TreeSink, Walk},
    Analyzer, IgnoreFn, ScanState,
};
use crate::{
    item::{Delta, Flag, HardLinkedItems, Item, ItemRef, Stats},
    storage::{
        sql::{inode_seen, insert_row, update_row},
        Row, SqlStore,
    },
    Options,
};

const META_ROOT: &str = "root_path";
const META_SCANNED: &str = "scanned_at";

pub struct SqliteAnalyzer {
    state: ScanState,
    store: Arc<SqlStore>,
}

impl SqliteAnalyzer {
    pub fn new(store: Arc<SqlStore>, options: Options) -> Self {
        Self {
            state: ScanState::new(options),
            store,
        }
    }

    pub fn open(db: &Path, options: Options) -> Result<Self> {
        Ok(Self::new(Arc::new(SqlStore::open(db)?), options))
    }

    pub fn store(&self) -> &Arc<SqlStore> {
        &self.store
    }

    fn load_root(&self) -> Result<ItemRef> {
        let row = self
            .store
            .root()?
            .ok_or_else(|| anyhow!("database holds no root directory"))?;
        let path = match self.store.meta(META_ROOT)? {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from(&row.name),
        };
        Ok(Arc::new(SqlItem::from_row(
            self.store.clone(),
            row,
            path,
            self.state.options().dir_overhead,
        )))
    }

    fn scan(
        &self,
        path: &Path,
        ignore_dir: &IgnoreFn,
        ignore_file: Option<&IgnoreFn>,
    ) -> Result<ItemRef> {
        let opts = self.state.options();
        let sink = SqlSink {
            store: &self.store,
            overhead: opts.dir_overhead,
        };
        let pool = self.state.admission_pool();
        self.store.begin()?;
        let walked = Walk::new(&sink, &StdStat, self.state.settings(), self.state.progress_hub())
            .ignore(ignore_dir, ignore_file)
            .parallel(path, opts.threads, &pool);
        if let Err(e) = walked {
            if let Err(rb) = self.store.rollback() {
                log::warn!("rollback failed: {rb:#}");
            }
            return Err(e);
        }
        self.store
            .set_meta(META_ROOT, &path.to_string_lossy())?;
        self.store.set_meta(
            META_SCANNED,
            &crate::storage::to_secs(SystemTime::now()).to_string(),
        )?;
        self.store.commit()?;
        self.load_root()
    }
}

impl Analyzer for SqliteAnalyzer {
    fn analyze_dir(
        &self,
        path: &Path,
        ignore_dir: &IgnoreFn,
        ignore_file: Option<&IgnoreFn>,
    ) -> Result<ItemRef> {
        let _governor = self.state.governor();
        let result = match self.store.is_empty() {
            Ok(false) => {
                let stored = self.store.meta(META_ROOT).ok().flatten();
                log::debug!(
                    "database already populated (root {}), loading instead of scanning {}",
                    stored.as_deref().unwrap_or("?"),
                    path.display()
                );
                self.load_root()
            }
            Ok(true) => self.scan(path, ignore_dir, ignore_file),
            Err(e) => Err(e),
        };
        self.state.finish(result)
    }

    fn state(&self) -> &ScanState {
        &self.state
    }
}

struct SqlSink<'a> {
    store: &'a SqlStore,
    overhead: u64,
}

struct OpenRow {
    id: i64,
    mtime: SystemTime,
    flag: Flag,
}

struct Summary {
    stats: Stats,
    mtime: SystemTime,
    flag: Flag,
}

impl TreeSink for SqlSink<'_> {
    type Dir = OpenRow;
    type Done = Summary;

    fn open_dir(&self, parent: Option<&OpenRow>, info: &DirInfo<'_>) -> Result<OpenRow> {
        let id = self.store.insert(&Row {
            id: 0,
            parent_id: parent.map(|p| p.id),
            name: info.name.to_string(),
            is_dir: true,
            size: 0,
            usage: 0,
            mtime: info.mtime,
            item_count: 0,
            inode: 0,
            flag: info.flag,
        })?;
        Ok(OpenRow {
            id,
            mtime: info.mtime,
            flag: info.flag,
        })
    }

    fn finish_dir(&self, dir: &OpenRow, children: Vec<Child<Summary>>) -> Result<Summary> {
        let mut stats = Stats {
            items: 1,
            size: self.overhead,
            usage: self.overhead,
        };
        let mut mtime = dir.mtime;
        let mut flag = dir.flag;
        // one lock for the whole batch so the inode check and the insert agree
        let conn = self.store.lock();
        for child in children {
            match child {
                Child::File(f) => {
                    let dup = f.inode > 0 && inode_seen(&conn, f.inode)?;
                    stats.items += 1;
                    if !dup {
                        stats.size += f.size;
                        stats.usage += f.usage;
                    }
                    mtime = mtime.max(f.mtime);
                    insert_row(
                        &conn,
                        &Row {
                            id: 0,
                            parent_id: Some(dir.id),
                            name: f.name,
                            is_dir: false,
                            size: f.size,
                            usage: f.usage,
                            mtime: f.mtime,
                            item_count: 1,
                            inode: f.inode,
                            flag: if dup { Flag::HardLink } else { f.flag },
                        },
                    )?;
                }
                Child::Dir(s) => {
                    stats += s.stats;
                    mtime = mtime.max(s.mtime);
                    if s.flag.is_error() && flag != Flag::Error {
                        flag = Flag::ChildError;
                    }
                }
            }
        }
        update_row(&conn, dir.id, stats, mtime, flag)?;
        Ok(Summary { stats, mtime, flag })
    }
}

/// Node served from one `items` row. Statistics are read through on every
/// access so that every handle sees removals made through any other.
pub struct SqlItem {
    store: Arc<SqlStore>,
    id: i64,
    parent_id: Option<i64>,
    name: String,
    path: PathBuf,
    is_dir: bool,
    inode: u64,
    overhead: u64,
}

impl SqlItem {
    fn from_row(store: Arc<SqlStore>, row: Row, path: PathBuf, overhead: u64) -> Self {
        Self {
            store,
            overhead,
            id: row.id,
            parent_id: row.parent_id,
            name: row.name,
            path,
            is_dir: row.is_dir,
            inode: row.inode,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    fn row(&self) -> Option<Row> {
        match self.store.row(self.id) {
            Ok(Some(r)) => Some(r),
            Ok(None) => {
                log::warn!("row {} ({}) vanished", self.id, self.path.display());
                None
            }
            Err(e) => {
                log::warn!("{e:#}");
                None
            }
        }
    }

    fn child(&self, row: Row) -> ItemRef {
        let path = self.path.join(&row.name);
        Arc::new(SqlItem::from_row(self.store.clone(), row, path, self.overhead))
    }
}

impl Item for SqlItem {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }

    fn size(&self) -> u64 {
        self.row().map_or(0, |r| r.size)
    }

    fn usage(&self) -> u64 {
        self.row().map_or(0, |r| r.usage)
    }

    fn item_count(&self) -> u64 {
        self.row().map_or(0, |r| r.item_count)
    }

    fn mtime(&self) -> SystemTime {
        self.row().map_or(SystemTime::UNIX_EPOCH, |r| r.mtime)
    }

    fn flag(&self) -> Flag {
        self.row().map_or(Flag::Error, |r| r.flag)
    }

    fn multi_linked_inode(&self) -> u64 {
        self.inode
    }

    fn parent(&self) -> Option<ItemRef> {
        let id = self.parent_id?;
        let row = match self.store.row(id) {
            Ok(r) => r?,
            Err(e) => {
                log::warn!("{e:#}");
                return None;
            }
        };
        let path = self.path.parent()?.to_path_buf();
        Some(Arc::new(SqlItem::from_row(
            self.store.clone(),
            row,
            path,
            self.overhead,
        )))
    }

    fn set_parent(&self, _parent: &ItemRef) {}

    fn add_file(&self, item: ItemRef) -> Result<()> {
        if !self.is_dir {
            panic!("add_file must not be called on a file ({})", self.path.display());
        }
        if let Some(old) = self.store.child_by_name(self.id, item.name())? {
            self.store.delete(old.id)?;
        }
        self.store.insert(&Row {
            id: 0,
            parent_id: Some(self.id),
            name: item.name().to_string(),
            is_dir: item.is_dir(),
            size: item.size(),
            usage: item.usage(),
            mtime: item.mtime(),
            item_count: item.item_count(),
            inode: item.multi_linked_inode(),
            flag: item.flag(),
        })?;
        Ok(())
    }

    fn files(&self) -> Result<Vec<ItemRef>> {
        if !self.is_dir {
            return Ok(Vec::new());
        }
        Ok(self
            .store
            .children(self.id)?
            .into_iter()
            .map(|r| self.child(r))
            .collect())
    }

    fn remove_file(&self, item: &dyn Item) -> Result<()> {
        let row = self
            .store
            .child_by_name(self.id, item.name())?
            .ok_or_else(|| anyhow!("{} is not a child of {}", item.name(), self.path.display()))?;
        let stats = if row.flag == Flag::HardLink {
            Stats {
                items: 1,
                size: 0,
                usage: 0,
            }
        } else {
            row.stats()
        };
        self.store.delete(row.id)?;
        self.store.apply_delta_upward(self.id, Delta::removal(stats))
    }

    fn item_stats(&self, links: &mut HardLinkedItems) -> Result<Stats> {
        if !self.is_dir {
            let row = self
                .store
                .row(self.id)?
                .ok_or_else(|| anyhow!("row {} vanished", self.id))?;
            if row.inode > 0 && !links.register(row.inode, self.path.clone()) {
                self.store.set_flag(self.id, Flag::HardLink)?;
                return Ok(Stats {
                    items: 1,
                    size: 0,
                    usage: 0,
                });
            }
            if row.flag == Flag::HardLink {
                self.store.set_flag(self.id, Flag::Normal)?;
            }
            return Ok(row.stats());
        }
        self.update_stats(links)?;
        Ok(self
            .store
            .row(self.id)?
            .ok_or_else(|| anyhow!("row {} vanished", self.id))?
            .stats())
    }

    fn update_stats(&self, links: &mut HardLinkedItems) -> Result<()> {
        if !self.is_dir {
            return Ok(());
        }
        let row = self
            .store
            .row(self.id)?
            .ok_or_else(|| anyhow!("row {} vanished", self.id))?;
        let mut stats = Stats {
            items: 1,
            size: self.overhead,
            usage: self.overhead,
        };
        let mut mtime = row.mtime;
        let mut flag = if row.flag == Flag::ChildError {
            Flag::Normal
        } else {
            row.flag
        };
        for child in self.files()? {
            stats += child.item_stats(links)?;
            mtime = mtime.max(child.mtime());
            if child.flag().is_error() && flag != Flag::Error {
                flag = Flag::ChildError;
            }
        }
        self.store.update_aggregates(self.id, stats, mtime, flag)
    }

    fn apply_delta(&self, delta: Delta) -> Result<()> {
        let row = self
            .store
            .row(self.id)?
            .ok_or_else(|| anyhow!("row {} vanished", self.id))?;
        let mut stats = row.stats();
        let add = |v: u64, d: i64| {
            if d >= 0 {
                v.saturating_add(d as u64)
            } else {
                v.saturating_sub(d.unsigned_abs())
            }
        };
        stats.items = add(stats.items, delta.items);
        stats.size = add(stats.size, delta.size);
        stats.usage = add(stats.usage, delta.usage);
        self.store
            .update_aggregates(self.id, stats, row.mtime, row.flag)
    }
}
