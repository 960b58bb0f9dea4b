//! ncdu-compatible JSON export and import.
//!
//! Layout: `[1, 2, {progname, progver, timestamp}, root]` where a directory
//! is an array whose first element is its info object, followed by file
//! objects and nested directory arrays.

use std::{
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
    sync::Arc,
    time::SystemTime,
};

use anyhow::{anyhow, bail, Context, Result};
use serde::{
    ser::{Error as _, SerializeSeq},
    Deserialize, Serialize, Serializer,
};
use serde_json::Value;

use crate::{
    item::{Dir, File, Flag, HardLinkedItems, Item, ItemRef},
    storage::{from_secs, to_secs},
};

const MAJOR: u64 = 1;
const MINOR: u64 = 2;

#[derive(Serialize)]
struct Header {
    progname: &'static str,
    progver: &'static str,
    timestamp: i64,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

#[derive(Serialize, Deserialize)]
struct DirJson {
    name: String,
    #[serde(default)]
    mtime: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    read_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    excluded: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct FileJson {
    name: String,
    #[serde(default)]
    asize: u64,
    #[serde(default)]
    dsize: u64,
    #[serde(default)]
    mtime: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    notreg: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    ino: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    hlnkc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    excluded: Option<String>,
}

impl FileJson {
    fn of(item: &dyn Item) -> Self {
        let ino = item.multi_linked_inode();
        Self {
            name: item.name().to_string(),
            asize: item.size(),
            dsize: item.usage(),
            mtime: to_secs(item.mtime()),
            notreg: item.flag() == Flag::Special,
            ino,
            hlnkc: ino > 0,
            excluded: None,
        }
    }
}

struct DirNode<'a> {
    item: &'a dyn Item,
    root: bool,
}

impl Serialize for DirNode<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        let children = self
            .item
            .files()
            .map_err(|e| S::Error::custom(format!("{e:#}")))?;
        let flag = self.item.flag();
        let info = DirJson {
            name: if self.root {
                self.item.path().to_string_lossy().into_owned()
            } else {
                self.item.name().to_string()
            },
            mtime: to_secs(self.item.mtime()),
            read_error: flag == Flag::Error,
            excluded: (flag == Flag::Empty).then(|| "pattern".to_string()),
        };
        let mut seq = s.serialize_seq(Some(children.len() + 1))?;
        seq.serialize_element(&info)?;
        for child in &children {
            if child.is_dir() {
                seq.serialize_element(&DirNode {
                    item: child.as_ref(),
                    root: false,
                })?;
            } else {
                seq.serialize_element(&FileJson::of(child.as_ref()))?;
            }
        }
        seq.end()
    }
}

/// Write `root` and everything below it. Directories are listed through
/// [`Item::files`], so lazy backends are read as the export goes.
pub fn encode_json<W: Write>(root: &dyn Item, writer: W) -> Result<()> {
    let header = Header {
        progname: "dutree",
        progver: env!("CARGO_PKG_VERSION"),
        timestamp: to_secs(SystemTime::now()),
    };
    let mut w = BufWriter::new(writer);
    serde_json::to_writer(&mut w, &(MAJOR, MINOR, header, DirNode { item: root, root: true }))
        .context("encode export")?;
    w.flush()?;
    Ok(())
}

/// Rebuild an in-memory tree from an export. Aggregates are recomputed with
/// `overhead` added per directory, so hard links recorded with `ino` and
/// `hlnkc` are counted once again.
pub fn decode_json<R: Read>(reader: R, overhead: u64) -> Result<ItemRef> {
    let v: Value = serde_json::from_reader(BufReader::new(reader)).context("parse export")?;
    let parts = v
        .as_array()
        .ok_or_else(|| anyhow!("export is not a JSON array"))?;
    match parts.first().and_then(Value::as_u64) {
        Some(MAJOR) => {}
        other => bail!("unsupported export version {other:?}"),
    }
    let root = parts
        .get(3)
        .ok_or_else(|| anyhow!("export has no root directory"))?;
    let dir = decode_dir(root, true, overhead)?;
    dir.update_stats(&mut HardLinkedItems::new())?;
    Ok(dir)
}

fn decode_dir(v: &Value, root: bool, overhead: u64) -> Result<Arc<Dir>> {
    let (info, rest) = v
        .as_array()
        .and_then(|a| a.split_first())
        .ok_or_else(|| anyhow!("directory entry must be a non-empty array"))?;
    let info: DirJson = serde_json::from_value(info.clone()).context("directory info")?;
    let flag = if info.read_error {
        Flag::Error
    } else if info.excluded.is_some() {
        Flag::Empty
    } else {
        Flag::Normal
    };
    let mtime = from_secs(info.mtime);
    let dir = if root {
        Dir::new_root(Path::new(&info.name), mtime, flag, overhead)
    } else {
        Dir::new(info.name, mtime, flag, overhead)
    };
    for child in rest {
        if child.is_array() {
            dir.add_file(decode_dir(child, false, overhead)?)?;
            continue;
        }
        let f: FileJson = serde_json::from_value(child.clone()).context("file entry")?;
        if f.excluded.is_some() {
            continue;
        }
        let flag = if f.notreg { Flag::Special } else { Flag::Normal };
        let inode = if f.hlnkc { f.ino } else { 0 };
        dir.add_file(Arc::new(File::new(
            f.name,
            f.asize,
            f.dsize,
            from_secs(f.mtime),
            flag,
            inode,
        )))?;
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sample() -> ItemRef {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let root = Dir::new_root(Path::new("/srv/data"), t, Flag::Normal, 4096);
        let sub = Dir::new("sub", t, Flag::Normal, 4096);
        sub.add_file(Arc::new(File::new("a", 10, 4096, t, Flag::Normal, 77)))
            .unwrap();
        sub.add_file(Arc::new(File::new("link", 0, 0, t, Flag::Special, 0)))
            .unwrap();
        root.add_file(sub).unwrap();
        root.add_file(Dir::new("locked", t, Flag::Error, 4096)).unwrap();
        root.add_file(Dir::new("skipped", t, Flag::Empty, 4096)).unwrap();
        root.add_file(Arc::new(File::new("b", 10, 4096, t, Flag::Normal, 77)))
            .unwrap();
        root.update_stats(&mut HardLinkedItems::new()).unwrap();
        root
    }

    #[test]
    fn header_and_root_shape() {
        let mut buf = Vec::new();
        encode_json(sample().as_ref(), &mut buf).unwrap();
        let v: Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(v[0], 1);
        assert_eq!(v[1], 2);
        assert_eq!(v[2]["progname"], "dutree");
        assert_eq!(v[3][0]["name"], "/srv/data");
        // "b" sorts before the directories
        assert_eq!(v[3][1]["name"], "b");
        assert_eq!(v[3][1]["hlnkc"], true);
        assert_eq!(v[3][2][0]["read_error"], true);
        assert_eq!(v[3][3][0]["excluded"], "pattern");
        assert_eq!(v[3][4][2]["notreg"], true);
    }

    #[test]
    fn import_preserves_aggregates_and_flags() {
        let original = sample();
        let mut buf = Vec::new();
        encode_json(original.as_ref(), &mut buf).unwrap();
        let back = decode_json(buf.as_slice(), 4096).unwrap();
        assert_eq!(back.stats(), original.stats());
        assert_eq!(back.path(), original.path());
        assert_eq!(back.flag(), Flag::ChildError);
        let names: Vec<_> = back
            .files()
            .unwrap()
            .iter()
            .map(|c| (c.name().to_string(), c.flag()))
            .collect();
        assert_eq!(
            names,
            [
                ("b".to_string(), Flag::Normal),
                ("locked".to_string(), Flag::Error),
                ("skipped".to_string(), Flag::Empty),
                ("sub".to_string(), Flag::Normal),
            ]
        );
    }

    #[test]
    fn rejects_unknown_versions() {
        assert!(decode_json(&b"[2, 0, {}, [{\"name\": \"/\"}]]"[..], 0).is_err());
        assert!(decode_json(&b"{}"[..], 0).is_err());
    }
}
