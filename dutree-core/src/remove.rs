//! Deleting items from disk and patching the tree to match.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;

use crate::{
    constants,
    item::{propagate_delta, Delta, File, Item, ItemRef},
    sync::{AdmissionPool, FirstError},
};

fn remove_path(path: &Path, is_dir: bool) -> Result<()> {
    if is_dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
    .with_context(|| format!("remove {}", path.display()))
}

/// Delete `item` from disk, then detach it from `parent`.
pub fn remove_item(parent: &ItemRef, item: &dyn Item) -> Result<()> {
    remove_path(&item.path(), item.is_dir())?;
    parent.remove_file(item)
}

/// Like [`remove_item`], but a directory's immediate subdirectories are
/// deleted concurrently, bounded by the default number of scan slots.
pub fn remove_item_parallel(parent: &ItemRef, item: &dyn Item) -> Result<()> {
    let pool = AdmissionPool::new(constants::default_scan_slots());
    remove_item_parallel_with(parent, item, &pool)
}

/// Parallel removal gated by `pool`. On the first failure the tree is left
/// untouched and that error is returned; whatever was already deleted stays
/// deleted.
pub fn remove_item_parallel_with(
    parent: &ItemRef,
    item: &dyn Item,
    pool: &AdmissionPool,
) -> Result<()> {
    remove_tree_with(parent, item, pool, &|p: &Path| remove_path(p, true))
}

type RemoveDirFn<'a> = dyn Fn(&Path) -> Result<()> + Sync + 'a;

/// Immediate subdirectories are queued on a channel and drained by at most
/// `pool.capacity()` scoped workers, each deleting under a permit.
fn remove_tree_with(
    parent: &ItemRef,
    item: &dyn Item,
    pool: &AdmissionPool,
    remove_dir: &RemoveDirFn<'_>,
) -> Result<()> {
    if !item.is_dir() {
        return remove_item(parent, item);
    }
    let path = item.path();
    let (tx, rx) = crossbeam_channel::unbounded::<PathBuf>();
    let mut queued = 0usize;
    for entry in fs::read_dir(&path).with_context(|| format!("read_dir {}", path.display()))? {
        let entry = entry.with_context(|| format!("read_dir {}", path.display()))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            // the receiver is alive, so sending cannot fail
            let _ = tx.send(entry.path());
            queued += 1;
        }
    }
    drop(tx);

    let first = FirstError::new();
    let drain = |rx: &Receiver<PathBuf>| {
        for sub in rx.iter() {
            if first.is_set() {
                break;
            }
            let _permit = pool.acquire();
            if let Err(e) = remove_dir(&sub) {
                first.set(e);
            }
        }
    };
    std::thread::scope(|s| {
        for _ in 0..pool.capacity().min(queued) {
            let rx = rx.clone();
            let drain = &drain;
            if let Err(e) = std::thread::Builder::new()
                .name("dutree-remove".into())
                .spawn_scoped(s, move || drain(&rx))
            {
                log::debug!("remove worker spawn failed: {e}");
                break;
            }
        }
    });
    // whatever no worker picked up
    drain(&rx);

    if let Some(e) = first.take() {
        return Err(e);
    }
    remove_dir(&path)?;
    parent.remove_file(item)
}

/// Truncate a file to zero bytes and replace its node with an empty one of
/// the same name and flag. The parent keeps its item count.
pub fn empty_file(parent: &ItemRef, item: &dyn Item) -> Result<()> {
    let path = item.path();
    fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&path)
        .with_context(|| format!("truncate {}", path.display()))?;
    let mtime = fs::metadata(&path)
        .and_then(|m| m.modified())
        .unwrap_or_else(|_| SystemTime::now());
    let node: ItemRef = Arc::new(File::new(
        item.name(),
        0,
        0,
        mtime,
        item.flag(),
        item.multi_linked_inode(),
    ));
    parent.remove_file(item)?;
    parent.add_file(node)?;
    propagate_delta(
        parent.clone(),
        Delta {
            items: 1,
            ..Delta::default()
        },
    )
}
