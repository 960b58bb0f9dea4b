mod common;

use std::fs;

use common::{child, fixture, opts};
use dutree_core::{
    collect_top_files, constants::sizes::DIR_OVERHEAD, decode_json, empty_file, encode_json,
    ignore_nothing, remove_item, remove_item_parallel, Analyzer, Item, ParallelAnalyzer,
    SequentialAnalyzer,
};

#[test]
fn remove_directory_from_memory_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fixture(tmp.path());
    let tree = SequentialAnalyzer::new(opts())
        .analyze_dir(&root, &ignore_nothing, None)
        .unwrap();
    let nested = child(&tree, "nested");
    let sub = child(&nested, "subnested");
    remove_item(&nested, sub.as_ref()).unwrap();
    assert!(!root.join("nested/subnested").exists());
    assert_eq!(nested.item_count(), 2);
    assert_eq!(tree.item_count(), 3);
    assert_eq!(tree.size(), 2 + 2 * DIR_OVERHEAD);
}

#[test]
fn remove_in_parallel_from_memory_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fixture(tmp.path());
    for i in 0..8 {
        let d = root.join(format!("nested/more{i}/deeper"));
        fs::create_dir_all(&d).unwrap();
        fs::write(d.join("x"), b"1234").unwrap();
    }
    let tree = ParallelAnalyzer::new(opts())
        .analyze_dir(&root, &ignore_nothing, None)
        .unwrap();
    assert_eq!(tree.item_count(), 5 + 8 * 3);
    let nested = child(&tree, "nested");
    remove_item_parallel(&tree, nested.as_ref()).unwrap();
    assert!(!root.join("nested").exists());
    assert_eq!(tree.item_count(), 1);
    assert_eq!(tree.size(), DIR_OVERHEAD);
    assert!(tree.files().unwrap().is_empty());
}

#[test]
fn remove_single_file() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fixture(tmp.path());
    let tree = ParallelAnalyzer::new(opts())
        .analyze_dir(&root, &ignore_nothing, None)
        .unwrap();
    let nested = child(&tree, "nested");
    let file2 = child(&nested, "file2");
    remove_item_parallel(&nested, file2.as_ref()).unwrap();
    assert!(!root.join("nested/file2").exists());
    assert_eq!(tree.item_count(), 4);
    assert_eq!(tree.size(), 5 + 3 * DIR_OVERHEAD);
}

#[test]
fn emptying_a_file_keeps_counts() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fixture(tmp.path());
    let tree = SequentialAnalyzer::new(opts())
        .analyze_dir(&root, &ignore_nothing, None)
        .unwrap();
    let sub = child(&child(&tree, "nested"), "subnested");
    let file = child(&sub, "file");
    empty_file(&sub, file.as_ref()).unwrap();
    assert_eq!(fs::metadata(root.join("nested/subnested/file")).unwrap().len(), 0);
    assert_eq!(tree.item_count(), 5);
    assert_eq!(tree.size(), 2 + 3 * DIR_OVERHEAD);
    assert_eq!(child(&sub, "file").size(), 0);
}

#[test]
fn json_export_round_trips_aggregates() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fixture(tmp.path());
    let tree = SequentialAnalyzer::new(opts())
        .analyze_dir(&root, &ignore_nothing, None)
        .unwrap();
    let out = tmp.path().join("export.json");
    encode_json(tree.as_ref(), fs::File::create(&out).unwrap()).unwrap();

    let back = decode_json(fs::File::open(&out).unwrap(), DIR_OVERHEAD).unwrap();
    assert_eq!(back.stats(), tree.stats());
    assert_eq!(back.path(), root);
    let file = child(&child(&child(&back, "nested"), "subnested"), "file");
    assert_eq!(file.size(), 5);
    assert_eq!(file.path(), root.join("nested/subnested/file"));
}

#[test]
fn top_files_of_a_scanned_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fixture(tmp.path());
    fs::write(root.join("big"), vec![0u8; 100]).unwrap();
    let tree = ParallelAnalyzer::new(opts())
        .analyze_dir(&root, &ignore_nothing, None)
        .unwrap();
    let top = collect_top_files(&tree, 2).unwrap();
    let names: Vec<_> = top.iter().map(|i| i.name().to_string()).collect();
    assert_eq!(names, ["big", "file"]);
}
