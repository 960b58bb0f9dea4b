use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sled::IVec;

use crate::item::{Delta, Flag, Stats};

/// A file as stored inside its directory's record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    pub usage: u64,
    pub mtime: SystemTime,
    pub flag: Flag,
    pub inode: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildRecord {
    File(FileRecord),
    /// Subdirectory; its own record lives under its path.
    Dir { name: String },
}

impl ChildRecord {
    pub fn name(&self) -> &str {
        match self {
            ChildRecord::File(f) => &f.name,
            ChildRecord::Dir { name } => name,
        }
    }
}

/// Everything known about one directory, keyed by its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirRecord {
    pub name: String,
    pub stats: Stats,
    pub mtime: SystemTime,
    pub flag: Flag,
    pub children: Vec<ChildRecord>,
}

impl DirRecord {
    pub fn apply(&mut self, d: Delta) {
        fn add(v: u64, d: i64) -> u64 {
            if d >= 0 {
                v.saturating_add(d as u64)
            } else {
                v.saturating_sub(d.unsigned_abs())
            }
        }
        self.stats.items = add(self.stats.items, d.items);
        self.stats.size = add(self.stats.size, d.size);
        self.stats.usage = add(self.stats.usage, d.usage);
    }
}

fn encode_key(p: &Path) -> Vec<u8> {
    p.to_string_lossy().as_bytes().to_vec()
}

fn subtree_prefix(p: &Path) -> Vec<u8> {
    let mut prefix = encode_key(p);
    if prefix.last() != Some(&(std::path::MAIN_SEPARATOR as u8)) {
        prefix.push(std::path::MAIN_SEPARATOR as u8);
    }
    prefix
}

/// sled-backed directory record store. Scan roots are kept in their own
/// tree so navigation upwards stops where a scan started.
pub struct KvStore {
    db: sled::Db,
    roots: sled::Tree,
    path: PathBuf,
}

impl KvStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).with_context(|| format!("open store {}", path.display()))?;
        let roots = db.open_tree("roots")?;
        log::debug!("opened key/value store at {}", path.display());
        Ok(Self {
            db,
            roots,
            path: path.to_path_buf(),
        })
    }

    /// Flush and release the database.
    pub fn close(self) -> Result<()> {
        self.flush()?;
        log::debug!("closed key/value store at {}", self.path.display());
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn location(&self) -> &Path {
        &self.path
    }

    pub fn put_dir(&self, path: &Path, rec: &DirRecord) -> Result<()> {
        self.db
            .insert(encode_key(path), IVec::from(serde_json::to_vec(rec)?))?;
        Ok(())
    }

    pub fn load_dir(&self, path: &Path) -> Result<DirRecord> {
        self.try_load_dir(path)?
            .ok_or_else(|| anyhow!("no stored record for {}", path.display()))
    }

    pub fn try_load_dir(&self, path: &Path) -> Result<Option<DirRecord>> {
        match self.db.get(encode_key(path))? {
            Some(v) => Ok(Some(serde_json::from_slice(&v).with_context(|| {
                format!("corrupt record for {}", path.display())
            })?)),
            None => Ok(None),
        }
    }

    /// Remember `path` as the root of a scan.
    pub fn add_root(&self, path: &Path) -> Result<()> {
        self.roots.insert(encode_key(path), &[] as &[u8])?;
        Ok(())
    }

    pub fn is_root(&self, path: &Path) -> Result<bool> {
        Ok(self.roots.contains_key(encode_key(path))?)
    }

    /// Remove the record of `path` and of every directory below it, along
    /// with any scan roots in that range.
    pub fn remove_subtree(&self, path: &Path) -> Result<u64> {
        let mut removed = 0u64;
        if self.db.remove(encode_key(path))?.is_some() {
            removed += 1;
        }
        self.roots.remove(encode_key(path))?;
        let prefix = subtree_prefix(path);
        let keys: Vec<IVec> = self
            .db
            .scan_prefix(&prefix)
            .keys()
            .collect::<std::result::Result<_, _>>()?;
        for k in keys {
            self.db.remove(k)?;
            removed += 1;
        }
        let roots: Vec<IVec> = self
            .roots
            .scan_prefix(&prefix)
            .keys()
            .collect::<std::result::Result<_, _>>()?;
        for k in roots {
            self.roots.remove(k)?;
        }
        Ok(removed)
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }
}
