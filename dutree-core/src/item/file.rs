use std::{
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    time::SystemTime,
};

use anyhow::Result;

use super::{
    add_signed, AtomicFlag, Delta, Flag, HardLinkedItems, Item, ItemRef, ParentLink, Stats,
};

/// Leaf node: a regular file, symlink or other non-directory entry.
pub struct File {
    name: String,
    size: AtomicU64,
    usage: AtomicU64,
    mtime: SystemTime,
    inode: u64,
    flag: AtomicFlag,
    parent: ParentLink,
}

impl File {
    pub fn new(
        name: impl Into<String>,
        size: u64,
        usage: u64,
        mtime: SystemTime,
        flag: Flag,
        inode: u64,
    ) -> Self {
        Self {
            name: name.into(),
            size: AtomicU64::new(size),
            usage: AtomicU64::new(usage),
            mtime,
            inode,
            flag: AtomicFlag::new(flag),
            parent: ParentLink::default(),
        }
    }

    /// Parent that nothing else keeps alive (storage placeholders).
    pub(crate) fn set_detached_parent(&self, parent: ItemRef) {
        self.parent.set_detached(parent);
    }
}

impl Item for File {
    fn path(&self) -> PathBuf {
        match self.parent.get() {
            Some(p) => p.path().join(&self.name),
            None => PathBuf::from(&self.name),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_dir(&self) -> bool {
        false
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn usage(&self) -> u64 {
        self.usage.load(Ordering::Acquire)
    }

    fn item_count(&self) -> u64 {
        1
    }

    fn mtime(&self) -> SystemTime {
        self.mtime
    }

    fn flag(&self) -> Flag {
        self.flag.get()
    }

    fn multi_linked_inode(&self) -> u64 {
        self.inode
    }

    fn parent(&self) -> Option<ItemRef> {
        self.parent.get()
    }

    fn set_parent(&self, parent: &ItemRef) {
        self.parent.set(parent);
    }

    fn add_file(&self, _item: ItemRef) -> Result<()> {
        panic!("add_file must not be called on a file ({})", self.name);
    }

    fn files(&self) -> Result<Vec<ItemRef>> {
        Ok(Vec::new())
    }

    fn remove_file(&self, _item: &dyn Item) -> Result<()> {
        panic!("remove_file must not be called on a file ({})", self.name);
    }

    fn item_stats(&self, links: &mut HardLinkedItems) -> Result<Stats> {
        if self.inode > 0 {
            if !links.register(self.inode, self.path()) {
                self.flag.set(Flag::HardLink);
                return Ok(Stats {
                    items: 1,
                    size: 0,
                    usage: 0,
                });
            }
            if self.flag.get() == Flag::HardLink {
                self.flag.set(Flag::Normal);
            }
        }
        Ok(Stats {
            items: 1,
            size: self.size(),
            usage: self.usage(),
        })
    }

    fn update_stats(&self, _links: &mut HardLinkedItems) -> Result<()> {
        Ok(())
    }

    fn apply_delta(&self, delta: Delta) -> Result<()> {
        add_signed(&self.size, delta.size);
        add_signed(&self.usage, delta.usage);
        Ok(())
    }
}
