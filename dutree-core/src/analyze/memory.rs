use std::sync::Arc;

use anyhow::Result;

use super::walk::{Child, DirInfo, FileInfo, TreeSink};
use crate::item::{Dir, File, Item, ItemRef};

/// Builds the plain in-memory [`Dir`]/[`File`] tree.
pub struct MemorySink {
    overhead: u64,
}

impl MemorySink {
    pub fn new(overhead: u64) -> Self {
        Self { overhead }
    }
}

impl From<FileInfo> for File {
    fn from(f: FileInfo) -> Self {
        File::new(f.name, f.size, f.usage, f.mtime, f.flag, f.inode)
    }
}

impl TreeSink for MemorySink {
    type Dir = Arc<Dir>;
    type Done = ItemRef;

    fn open_dir(&self, parent: Option<&Arc<Dir>>, info: &DirInfo<'_>) -> Result<Arc<Dir>> {
        Ok(match parent {
            None => Dir::new_root(info.path, info.mtime, info.flag, self.overhead),
            Some(_) => Dir::new(info.name, info.mtime, info.flag, self.overhead),
        })
    }

    fn finish_dir(&self, dir: &Arc<Dir>, children: Vec<Child<ItemRef>>) -> Result<ItemRef> {
        for child in children {
            let item: ItemRef = match child {
                Child::File(f) => Arc::new(File::from(f)),
                Child::Dir(d) => d,
            };
            dir.add_file(item)?;
        }
        Ok(dir.clone())
    }
}
