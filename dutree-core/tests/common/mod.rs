#![allow(dead_code)]

use std::{fs, path::Path};

use dutree_core::{
    constants::sizes::DIR_OVERHEAD,
    options::{Options, OptionsBuilder},
    Item, ItemRef,
};

/// test_dir/
///   nested/
///     file2        (2 bytes)
///     subnested/
///       file       (5 bytes)
pub fn fixture(base: &Path) -> std::path::PathBuf {
    let root = base.join("test_dir");
    fs::create_dir_all(root.join("nested/subnested")).unwrap();
    fs::write(root.join("nested/subnested/file"), b"hello").unwrap();
    fs::write(root.join("nested/file2"), b"go").unwrap();
    root
}

pub fn opts() -> Options {
    OptionsBuilder::new().threads(4).scan_slots(4).const_gc(true).build()
}

pub fn child(dir: &ItemRef, name: &str) -> ItemRef {
    dir.files()
        .unwrap()
        .into_iter()
        .find(|c| c.name() == name)
        .unwrap_or_else(|| panic!("{} has no child {name}", dir.path().display()))
}

pub fn assert_fixture_totals(root: &ItemRef) {
    assert_eq!(root.name(), "test_dir");
    assert!(root.is_dir());
    assert_eq!(root.item_count(), 5);
    assert_eq!(root.size(), 7 + 3 * DIR_OVERHEAD);
    let nested = child(root, "nested");
    assert_eq!(nested.item_count(), 4);
    let file = child(&child(&nested, "subnested"), "file");
    assert_eq!(file.size(), 5);
    assert_eq!(file.path(), root.path().join("nested/subnested/file"));
}
