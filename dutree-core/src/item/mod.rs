//! Tree nodes produced by the analyzers.
//!
//! Every backend hands out [`ItemRef`]s (`Arc<dyn Item>`). A directory owns its
//! children; a child only keeps a non-owning link back to its parent, used for
//! path reconstruction and for patching ancestor aggregates on removal.

use std::{
    fmt,
    ops::AddAssign,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Weak,
    },
    time::SystemTime,
};

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

mod dir;
mod file;
mod links;

pub(crate) use dir::split_root;
pub use dir::Dir;
pub use file::File;
pub use links::HardLinkedItems;

pub type ItemRef = Arc<dyn Item>;

/// Status marker of an item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Flag {
    #[default]
    Normal = b' ',
    /// Directory could not be read.
    Error = b'!',
    /// Some descendant could not be read.
    ChildError = b'.',
    /// Symlink, device, socket or other non-regular entry.
    Special = b'@',
    /// Additional link to an inode already counted.
    HardLink = b'H',
    /// Directory skipped by an ignore predicate.
    Empty = b'e',
    /// Virtual directory synthesized from an archive.
    Archive = b'Z',
}

impl Flag {
    pub fn as_char(self) -> char {
        self as u8 as char
    }

    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            ' ' => Flag::Normal,
            '!' => Flag::Error,
            '.' => Flag::ChildError,
            '@' => Flag::Special,
            'H' => Flag::HardLink,
            'e' => Flag::Empty,
            'Z' => Flag::Archive,
            _ => return None,
        })
    }

    /// Error markers propagate to ancestors as [`Flag::ChildError`].
    pub fn is_error(self) -> bool {
        matches!(self, Flag::Error | Flag::ChildError)
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Aggregated statistics of an item: `(item count, apparent size, usage)`.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub items: u64,
    pub size: u64,
    pub usage: u64,
}

impl AddAssign for Stats {
    fn add_assign(&mut self, rhs: Self) {
        self.items += rhs.items;
        self.size += rhs.size;
        self.usage += rhs.usage;
    }
}

/// Signed change applied to an item's own aggregates.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delta {
    pub items: i64,
    pub size: i64,
    pub usage: i64,
}

impl Delta {
    pub fn removal(s: Stats) -> Self {
        Self {
            items: -(s.items as i64),
            size: -(s.size as i64),
            usage: -(s.usage as i64),
        }
    }

    pub fn addition(s: Stats) -> Self {
        Self {
            items: s.items as i64,
            size: s.size as i64,
            usage: s.usage as i64,
        }
    }
}

/// Common contract of every tree node.
///
/// Operations that make no sense for a variant (adding children to a file,
/// reading sizes from a placeholder) panic: reaching them is a logic error.
pub trait Item: Send + Sync {
    fn path(&self) -> PathBuf;
    fn name(&self) -> &str;
    fn is_dir(&self) -> bool;
    /// Apparent size in bytes.
    fn size(&self) -> u64;
    /// Allocated bytes on disk.
    fn usage(&self) -> u64;
    fn item_count(&self) -> u64;
    fn mtime(&self) -> SystemTime;
    fn flag(&self) -> Flag;
    /// Inode number when the entry has more than one link, else 0.
    fn multi_linked_inode(&self) -> u64;

    fn parent(&self) -> Option<ItemRef>;
    fn set_parent(&self, parent: &ItemRef);

    fn add_file(&self, item: ItemRef) -> Result<()>;
    /// Children in listing order.
    fn files(&self) -> Result<Vec<ItemRef>>;
    /// Detach the child with `item`'s name and subtract its statistics from
    /// this node and every ancestor.
    fn remove_file(&self, item: &dyn Item) -> Result<()>;

    /// Statistics this item contributes to its parent. Directories recompute
    /// their aggregates first.
    fn item_stats(&self, links: &mut HardLinkedItems) -> Result<Stats>;
    fn update_stats(&self, links: &mut HardLinkedItems) -> Result<()>;
    /// Add `delta` to this node's own aggregates (not to its ancestors).
    fn apply_delta(&self, delta: Delta) -> Result<()>;

    fn stats(&self) -> Stats {
        Stats {
            items: self.item_count(),
            size: self.size(),
            usage: self.usage(),
        }
    }
}

impl fmt::Debug for dyn Item + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("path", &self.path())
            .field("dir", &self.is_dir())
            .field("flag", &self.flag())
            .finish()
    }
}

/// Apply `delta` to `start` and every ancestor up to the root.
pub fn propagate_delta(start: ItemRef, delta: Delta) -> Result<()> {
    let mut cur = Some(start);
    while let Some(item) = cur {
        item.apply_delta(delta)?;
        cur = item.parent();
    }
    Ok(())
}

/// What `item` adds to its parent's aggregates: repeat hard links only
/// count as an item.
pub fn contribution(item: &dyn Item) -> Stats {
    if !item.is_dir() && item.flag() == Flag::HardLink {
        return Stats {
            items: 1,
            size: 0,
            usage: 0,
        };
    }
    item.stats()
}

/// Find a direct child by name.
pub fn find_child(dir: &dyn Item, name: &str) -> Result<Option<ItemRef>> {
    Ok(dir.files()?.into_iter().find(|c| c.name() == name))
}

#[inline]
pub(crate) fn add_signed(cell: &AtomicU64, d: i64) {
    let _ = cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        Some(if d >= 0 {
            v.saturating_add(d as u64)
        } else {
            v.saturating_sub(d.unsigned_abs())
        })
    });
}

/// Flag stored in an atomic so the stats pass can mark hard links in place.
#[derive(Debug)]
pub(crate) struct AtomicFlag(AtomicU8);

impl AtomicFlag {
    pub(crate) fn new(f: Flag) -> Self {
        Self(AtomicU8::new(f as u8))
    }

    pub(crate) fn get(&self) -> Flag {
        Flag::from_char(self.0.load(Ordering::Acquire) as char).unwrap_or_default()
    }

    pub(crate) fn set(&self, f: Flag) {
        self.0.store(f as u8, Ordering::Release)
    }
}

enum Link {
    Tree(Weak<dyn Item>),
    Detached(ItemRef),
}

/// Back reference to a parent. Tree parents are held weakly; detached
/// placeholders (which nothing else owns) are held strongly.
#[derive(Default)]
pub(crate) struct ParentLink(RwLock<Option<Link>>);

impl ParentLink {
    pub(crate) fn get(&self) -> Option<ItemRef> {
        match &*self.0.read() {
            Some(Link::Tree(w)) => w.upgrade(),
            Some(Link::Detached(p)) => Some(p.clone()),
            None => None,
        }
    }

    pub(crate) fn set(&self, parent: &ItemRef) {
        *self.0.write() = Some(Link::Tree(Arc::downgrade(parent)));
    }

    pub(crate) fn set_detached(&self, parent: ItemRef) {
        *self.0.write() = Some(Link::Detached(parent));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_chars_round_trip() {
        for f in [
            Flag::Normal,
            Flag::Error,
            Flag::ChildError,
            Flag::Special,
            Flag::HardLink,
            Flag::Empty,
            Flag::Archive,
        ] {
            assert_eq!(Flag::from_char(f.as_char()), Some(f));
        }
        assert_eq!(Flag::from_char('x'), None);
    }

    #[test]
    fn add_signed_saturates() {
        let c = AtomicU64::new(10);
        add_signed(&c, -25);
        assert_eq!(c.load(Ordering::Relaxed), 0);
        add_signed(&c, 7);
        assert_eq!(c.load(Ordering::Relaxed), 7);
    }
}
