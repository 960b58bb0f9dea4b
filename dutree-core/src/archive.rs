//! Zip archives browsed as read-only virtual directories.

use std::{
    fs,
    io::BufReader,
    path::Path,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use ahash::AHashMap;
use anyhow::{Context, Result};

use crate::item::{split_root, Dir, File, Flag, HardLinkedItems, Item, ItemRef};

/// One member of an archive.
#[derive(Clone, Debug)]
pub struct ArchiveEntry {
    /// `/`-separated path inside the archive; directories may end in `/`.
    pub name: String,
    pub size: u64,
    pub compressed: u64,
    pub mtime: SystemTime,
    pub is_dir: bool,
}

/// Constructors for archive trees. Every directory they produce refuses
/// `remove_file`; the root carries [`Flag::Archive`].
pub struct ArchiveDir;

impl ArchiveDir {
    /// Build the tree rooted at `path` from a flat member list. Directories
    /// missing from the list are created from the members' paths.
    pub fn from_entries(
        path: &Path,
        entries: impl IntoIterator<Item = ArchiveEntry>,
    ) -> Result<ItemRef> {
        let (name, base) = split_root(path);
        let root = Dir::new_read_only(name, base, UNIX_EPOCH, Flag::Archive);
        let mut dirs: AHashMap<String, Arc<Dir>> = AHashMap::new();
        dirs.insert(String::new(), root.clone());

        for e in entries {
            let parts: Vec<&str> = e
                .name
                .split('/')
                .filter(|p| !p.is_empty() && *p != "." && *p != "..")
                .collect();
            let Some((leaf, parents)) = parts.split_last() else {
                continue;
            };
            if e.is_dir {
                ensure_dir(&mut dirs, &parts.join("/"), e.mtime)?;
                continue;
            }
            let parent = ensure_dir(&mut dirs, &parents.join("/"), e.mtime)?;
            parent.add_file(Arc::new(File::new(
                *leaf,
                e.size,
                e.compressed,
                e.mtime,
                Flag::Normal,
                0,
            )))?;
        }
        root.update_stats(&mut HardLinkedItems::new())?;
        Ok(root)
    }

    /// Read the member list of a zip file. Members are not decompressed;
    /// usage is their compressed size.
    pub fn open_zip(path: &Path) -> Result<ItemRef> {
        let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mtime = file
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(UNIX_EPOCH);
        let mut zip = zip::ZipArchive::new(BufReader::new(file))
            .with_context(|| format!("read zip {}", path.display()))?;
        let mut entries = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let member = zip.by_index_raw(i)?;
            entries.push(ArchiveEntry {
                name: member.name().to_string(),
                size: member.size(),
                compressed: member.compressed_size(),
                mtime,
                is_dir: member.is_dir(),
            });
        }
        log::debug!("{}: {} archive members", path.display(), entries.len());
        Self::from_entries(path, entries)
    }
}

fn ensure_dir(
    dirs: &mut AHashMap<String, Arc<Dir>>,
    prefix: &str,
    mtime: SystemTime,
) -> Result<Arc<Dir>> {
    if let Some(d) = dirs.get(prefix) {
        return Ok(d.clone());
    }
    let (parent_prefix, name) = prefix.rsplit_once('/').unwrap_or(("", prefix));
    let parent = ensure_dir(dirs, parent_prefix, mtime)?;
    let d = Dir::new_read_only(name, None, mtime, Flag::Normal);
    parent.add_file(d.clone())?;
    dirs.insert(prefix.to_string(), d.clone());
    Ok(d)
}
