use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::SystemTime,
};

use anyhow::{anyhow, Result};
use parking_lot::{Mutex, RwLock};

use super::{
    add_signed, contribution, propagate_delta, AtomicFlag, Delta, Flag, HardLinkedItems, Item, ItemRef,
    ParentLink, Stats,
};

/// In-memory directory node.
pub struct Dir {
    name: String,
    base_path: Option<PathBuf>,
    overhead: u64,
    size: AtomicU64,
    usage: AtomicU64,
    items: AtomicU64,
    mtime: Mutex<SystemTime>,
    flag: AtomicFlag,
    files: RwLock<Vec<ItemRef>>,
    parent: ParentLink,
    read_only: bool,
    me: Weak<Dir>,
}

impl Dir {
    /// Directory that will be attached under a parent with `add_file`.
    pub fn new(name: impl Into<String>, mtime: SystemTime, flag: Flag, overhead: u64) -> Arc<Dir> {
        Self::build(name.into(), None, mtime, flag, overhead, false)
    }

    /// Scan root; its path is rebuilt from `path`'s parent and file name.
    pub fn new_root(path: &Path, mtime: SystemTime, flag: Flag, overhead: u64) -> Arc<Dir> {
        let (name, base) = split_root(path);
        Self::build(name, base, mtime, flag, overhead, false)
    }

    /// Directory whose children can be listed but never removed.
    pub(crate) fn new_read_only(
        name: impl Into<String>,
        base_path: Option<PathBuf>,
        mtime: SystemTime,
        flag: Flag,
    ) -> Arc<Dir> {
        Self::build(name.into(), base_path, mtime, flag, 0, true)
    }

    fn build(
        name: String,
        base_path: Option<PathBuf>,
        mtime: SystemTime,
        flag: Flag,
        overhead: u64,
        read_only: bool,
    ) -> Arc<Dir> {
        Arc::new_cyclic(|me| Dir {
            name,
            base_path,
            overhead,
            size: AtomicU64::new(overhead),
            usage: AtomicU64::new(overhead),
            items: AtomicU64::new(1),
            mtime: Mutex::new(mtime),
            flag: AtomicFlag::new(flag),
            files: RwLock::new(Vec::new()),
            parent: ParentLink::default(),
            read_only,
            me: me.clone(),
        })
    }

    pub fn set_flag(&self, flag: Flag) {
        self.flag.set(flag);
    }

    fn me_ref(&self) -> Option<ItemRef> {
        self.me.upgrade().map(|d| d as ItemRef)
    }
}

/// Split a root path into the displayed name and the base it hangs off.
pub(crate) fn split_root(path: &Path) -> (String, Option<PathBuf>) {
    match (path.file_name(), path.parent()) {
        (Some(name), Some(parent)) => (
            name.to_string_lossy().into_owned(),
            Some(parent.to_path_buf()),
        ),
        _ => (path.to_string_lossy().into_owned(), None),
    }
}

impl Item for Dir {
    fn path(&self) -> PathBuf {
        if let Some(p) = self.parent.get() {
            return p.path().join(&self.name);
        }
        match &self.base_path {
            Some(base) => base.join(&self.name),
            None => PathBuf::from(&self.name),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_dir(&self) -> bool {
        true
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn usage(&self) -> u64 {
        self.usage.load(Ordering::Acquire)
    }

    fn item_count(&self) -> u64 {
        self.items.load(Ordering::Acquire)
    }

    fn mtime(&self) -> SystemTime {
        *self.mtime.lock()
    }

    fn flag(&self) -> Flag {
        self.flag.get()
    }

    fn multi_linked_inode(&self) -> u64 {
        0
    }

    fn parent(&self) -> Option<ItemRef> {
        self.parent.get()
    }

    fn set_parent(&self, parent: &ItemRef) {
        self.parent.set(parent);
    }

    fn add_file(&self, item: ItemRef) -> Result<()> {
        if let Some(me) = self.me_ref() {
            item.set_parent(&me);
        }
        let mut files = self.files.write();
        let at = files.partition_point(|f| f.name() < item.name());
        files.insert(at, item);
        Ok(())
    }

    fn files(&self) -> Result<Vec<ItemRef>> {
        Ok(self.files.read().clone())
    }

    fn remove_file(&self, item: &dyn Item) -> Result<()> {
        if self.read_only {
            panic!("remove_file must not be called on read-only {}", self.name);
        }
        let removed = {
            let mut files = self.files.write();
            let idx = files
                .iter()
                .position(|f| f.name() == item.name())
                .ok_or_else(|| anyhow!("{} is not a child of {}", item.name(), self.name))?;
            files.remove(idx)
        };
        let delta = Delta::removal(contribution(removed.as_ref()));
        match self.me_ref() {
            Some(me) => propagate_delta(me, delta),
            None => self.apply_delta(delta),
        }
    }

    fn item_stats(&self, links: &mut HardLinkedItems) -> Result<Stats> {
        self.update_stats(links)?;
        Ok(self.stats())
    }

    fn update_stats(&self, links: &mut HardLinkedItems) -> Result<()> {
        let mut total = Stats {
            items: 1,
            size: self.overhead,
            usage: self.overhead,
        };
        let mut mtime = self.mtime();
        let mut flag = match self.flag() {
            Flag::ChildError => Flag::Normal,
            f => f,
        };
        // snapshot so a concurrent reader is never blocked by the recursion
        let children = self.files.read().clone();
        for child in &children {
            total += child.item_stats(links)?;
            mtime = mtime.max(child.mtime());
            if child.flag().is_error() && flag != Flag::Error {
                flag = Flag::ChildError;
            }
        }
        self.items.store(total.items, Ordering::Release);
        self.size.store(total.size, Ordering::Release);
        self.usage.store(total.usage, Ordering::Release);
        *self.mtime.lock() = mtime;
        self.flag.set(flag);
        Ok(())
    }

    fn apply_delta(&self, delta: Delta) -> Result<()> {
        add_signed(&self.items, delta.items);
        add_signed(&self.size, delta.size);
        add_signed(&self.usage, delta.usage);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::item::File;

    fn file(name: &str, size: u64) -> ItemRef {
        Arc::new(File::new(
            name,
            size,
            size.div_ceil(4096) * 4096,
            SystemTime::UNIX_EPOCH,
            Flag::Normal,
            0,
        ))
    }

    fn tree() -> (Arc<Dir>, Arc<Dir>) {
        let root = Dir::new_root(Path::new("/data/root"), SystemTime::UNIX_EPOCH, Flag::Normal, 4096);
        let sub = Dir::new("sub", SystemTime::UNIX_EPOCH, Flag::Normal, 4096);
        sub.add_file(file("a", 10)).unwrap();
        sub.add_file(file("b", 20)).unwrap();
        root.add_file(sub.clone()).unwrap();
        root.add_file(file("c", 5)).unwrap();
        root.update_stats(&mut HardLinkedItems::new()).unwrap();
        (root, sub)
    }

    #[test]
    fn aggregates_include_overhead_and_children() {
        let (root, sub) = tree();
        assert_eq!(sub.item_count(), 3);
        assert_eq!(sub.size(), 4096 + 30);
        assert_eq!(root.item_count(), 5);
        assert_eq!(root.size(), 4096 * 2 + 35);
        assert_eq!(root.usage(), 4096 * 2 + 3 * 4096);
    }

    #[test]
    fn paths_follow_parent_links() {
        let (root, sub) = tree();
        assert_eq!(root.path(), PathBuf::from("/data/root"));
        assert_eq!(sub.path(), PathBuf::from("/data/root/sub"));
        let a = sub.files().unwrap()[0].clone();
        assert_eq!(a.path(), PathBuf::from("/data/root/sub/a"));
        assert_eq!(a.parent().unwrap().name(), "sub");
    }

    #[test]
    fn remove_file_patches_every_ancestor() {
        let (root, sub) = tree();
        let a = sub.files().unwrap()[0].clone();
        sub.remove_file(a.as_ref()).unwrap();
        assert_eq!(sub.item_count(), 2);
        assert_eq!(sub.size(), 4096 + 20);
        assert_eq!(root.item_count(), 4);
        assert_eq!(root.size(), 4096 * 2 + 25);

        let sub_item: ItemRef = sub.clone();
        root.remove_file(sub_item.as_ref()).unwrap();
        assert_eq!(root.item_count(), 2);
        assert_eq!(root.size(), 4096 + 5);
        assert_eq!(root.files().unwrap().len(), 1);
    }

    #[test]
    fn removing_unknown_child_is_an_error() {
        let (root, _) = tree();
        let stranger = file("nope", 1);
        assert!(root.remove_file(stranger.as_ref()).is_err());
    }

    #[test]
    fn errors_propagate_as_child_error_and_mtime_is_max() {
        let root = Dir::new_root(Path::new("/r"), SystemTime::UNIX_EPOCH, Flag::Normal, 0);
        let bad = Dir::new("bad", SystemTime::UNIX_EPOCH, Flag::Error, 0);
        let mid = Dir::new("mid", SystemTime::UNIX_EPOCH, Flag::Normal, 0);
        let later = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        mid.add_file(bad.clone()).unwrap();
        mid.add_file(Arc::new(File::new("f", 1, 0, later, Flag::Normal, 0)))
            .unwrap();
        root.add_file(mid.clone()).unwrap();
        root.update_stats(&mut HardLinkedItems::new()).unwrap();
        assert_eq!(bad.flag(), Flag::Error);
        assert_eq!(mid.flag(), Flag::ChildError);
        assert_eq!(root.flag(), Flag::ChildError);
        assert_eq!(root.mtime(), later);
    }

    #[test]
    fn add_file_keeps_name_order() {
        let root = Dir::new_root(Path::new("/r"), SystemTime::UNIX_EPOCH, Flag::Normal, 0);
        for n in ["b", "c", "a"] {
            root.add_file(file(n, 1)).unwrap();
        }
        let names: Vec<_> = root
            .files()
            .unwrap()
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    #[should_panic(expected = "read-only")]
    fn read_only_dirs_refuse_removal() {
        let d = Dir::new_read_only("z", None, SystemTime::UNIX_EPOCH, Flag::Archive);
        let f = file("f", 1);
        d.add_file(f.clone()).unwrap();
        let _ = d.remove_file(f.as_ref());
    }

    #[test]
    fn hard_links_are_counted_once_per_pass() {
        let root = Dir::new_root(Path::new("/r"), SystemTime::UNIX_EPOCH, Flag::Normal, 0);
        for name in ["x", "y"] {
            root.add_file(Arc::new(File::new(
                name,
                50,
                4096,
                SystemTime::UNIX_EPOCH,
                Flag::Normal,
                9,
            )))
            .unwrap();
        }
        root.update_stats(&mut HardLinkedItems::new()).unwrap();
        assert_eq!(root.size(), 50);
        assert_eq!(root.item_count(), 3);
        // a fresh pass gives the same answer
        root.update_stats(&mut HardLinkedItems::new()).unwrap();
        assert_eq!(root.size(), 50);
        assert_eq!(root.files().unwrap()[1].flag(), Flag::HardLink);

        // dropping the zero-sized duplicate leaves the size alone
        let y = root.files().unwrap()[1].clone();
        root.remove_file(y.as_ref()).unwrap();
        assert_eq!(root.size(), 50);
        assert_eq!(root.item_count(), 2);
    }

    #[test]
    fn child_error_clears_once_the_failed_child_is_gone() {
        let root = Dir::new_root(Path::new("/r"), SystemTime::UNIX_EPOCH, Flag::Normal, 0);
        let bad = Dir::new("bad", SystemTime::UNIX_EPOCH, Flag::Error, 0);
        root.add_file(bad.clone()).unwrap();
        root.add_file(file("ok", 3)).unwrap();
        root.update_stats(&mut HardLinkedItems::new()).unwrap();
        assert_eq!(root.flag(), Flag::ChildError);

        root.remove_file(bad.as_ref()).unwrap();
        root.update_stats(&mut HardLinkedItems::new()).unwrap();
        assert_eq!(root.flag(), Flag::Normal);
        assert_eq!(bad.flag(), Flag::Error);
    }
}
