use std::path::PathBuf;

use ahash::AHashMap as HashMap;

/// Inode number -> paths of the files sharing it, in the order they were met.
///
/// Lives for one stats pass; the first path registered for an inode is the
/// one that carries the size.
#[derive(Default, Debug)]
pub struct HardLinkedItems {
    map: HashMap<u64, Vec<PathBuf>>,
}

impl HardLinkedItems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `path` under `inode`. Returns true when it is the first one.
    pub fn register(&mut self, inode: u64, path: PathBuf) -> bool {
        match self.map.get_mut(&inode) {
            Some(paths) => {
                if paths.first() == Some(&path) {
                    return true;
                }
                if !paths.contains(&path) {
                    paths.push(path);
                }
                false
            }
            None => {
                self.map.insert(inode, vec![path]);
                true
            }
        }
    }

}
