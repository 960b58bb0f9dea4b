//! Symlink following, including size recovery for git-annex style links
//! whose target lives in a content-addressed object store.

use std::{fs, path::Path};

use crate::error_handling::ScanError;

/// Outcome of following a symlink.
#[derive(Debug)]
pub enum Followed {
    /// Target is not a directory; its metadata replaces the link's.
    Target(fs::Metadata),
    /// Target is a directory. The link is kept as a special entry and never
    /// recursed into.
    Dir,
    /// Target could not be resolved but its name encodes the object size.
    Annexed(u64),
}

/// Resolve the symlink at `path`.
pub fn follow(path: &Path, show_annexed_size: bool) -> Result<Followed, ScanError> {
    match fs::metadata(path) {
        Ok(md) if md.is_dir() => Ok(Followed::Dir),
        Ok(md) => Ok(Followed::Target(md)),
        Err(source) => {
            if show_annexed_size {
                if let Some(size) = fs::read_link(path)
                    .ok()
                    .and_then(|t| annexed_size(&t))
                {
                    return Ok(Followed::Annexed(size));
                }
            }
            Err(ScanError::Symlink {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}

/// Decode the size field of an annex key (`BACKEND-s<size>--<hash>`) from the
/// last component of a link target.
pub fn annexed_size(target: &Path) -> Option<u64> {
    let name = target.file_name()?.to_str()?;
    let mut rest = name;
    while let Some(pos) = rest.find("-s") {
        let after = &rest[pos + 2..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        if digits > 0 && after[digits..].starts_with('-') {
            if let Ok(size) = after[..digits].parse() {
                return Some(size);
            }
        }
        rest = after;
    }
    None
}
