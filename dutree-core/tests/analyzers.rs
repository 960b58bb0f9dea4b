mod common;

use std::{fs, thread};

use common::{assert_fixture_totals, child, fixture, opts};
use dutree_core::{
    constants::sizes::DIR_OVERHEAD, ignore_nothing, Analyzer, Flag, Item, OptionsBuilder,
    ParallelAnalyzer, SequentialAnalyzer, UringAnalyzer,
};

#[test]
fn sequential_and_parallel_agree_on_the_fixture() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fixture(tmp.path());

    let seq = SequentialAnalyzer::new(opts())
        .analyze_dir(&root, &ignore_nothing, None)
        .unwrap();
    assert_fixture_totals(&seq);

    let par = ParallelAnalyzer::new(opts())
        .analyze_dir(&root, &ignore_nothing, None)
        .unwrap();
    assert_fixture_totals(&par);
    assert_eq!(seq.usage(), par.usage());
    assert_eq!(seq.mtime(), par.mtime());
}

#[test]
fn uring_analyzer_matches_when_available() {
    let analyzer = match UringAnalyzer::new(opts()) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("skipping: {e:#}");
            return;
        }
    };
    let tmp = tempfile::tempdir().unwrap();
    let root = fixture(tmp.path());
    let tree = analyzer.analyze_dir(&root, &ignore_nothing, None).unwrap();
    assert_fixture_totals(&tree);
}

#[test]
fn missing_root_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let missing = tmp.path().join("nope");
    assert!(SequentialAnalyzer::new(opts())
        .analyze_dir(&missing, &ignore_nothing, None)
        .is_err());
    let par = ParallelAnalyzer::new(opts());
    let done = par.done();
    assert!(par.analyze_dir(&missing, &ignore_nothing, None).is_err());
    // completion is broadcast on failure too
    assert!(done.is_done());
}

#[test]
fn ignored_directory_is_an_empty_node() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fixture(tmp.path());
    let ignore = |name: &str, _: &std::path::Path| name == "subnested";
    let tree = ParallelAnalyzer::new(opts())
        .analyze_dir(&root, &ignore, None)
        .unwrap();
    assert_eq!(tree.item_count(), 4);
    assert_eq!(tree.size(), 2 + 3 * DIR_OVERHEAD);
    let sub = child(&child(&tree, "nested"), "subnested");
    assert_eq!(sub.flag(), Flag::Empty);
    assert!(sub.files().unwrap().is_empty());
}

#[test]
fn ignored_files_are_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fixture(tmp.path());
    let ignore_file = |name: &str, _: &std::path::Path| name == "file2";
    let tree = SequentialAnalyzer::new(opts())
        .analyze_dir(&root, &ignore_nothing, Some(&ignore_file))
        .unwrap();
    assert_eq!(tree.item_count(), 4);
    assert_eq!(tree.size(), 5 + 3 * DIR_OVERHEAD);
}

#[cfg(unix)]
#[test]
fn hard_links_are_counted_once() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("d");
    fs::create_dir(&root).unwrap();
    fs::write(root.join("a.bin"), vec![1u8; 8192]).unwrap();
    fs::hard_link(root.join("a.bin"), root.join("b.bin")).unwrap();

    for tree in [
        SequentialAnalyzer::new(opts())
            .analyze_dir(&root, &ignore_nothing, None)
            .unwrap(),
        ParallelAnalyzer::new(opts())
            .analyze_dir(&root, &ignore_nothing, None)
            .unwrap(),
    ] {
        assert_eq!(tree.item_count(), 3);
        assert_eq!(tree.size(), DIR_OVERHEAD + 8192);
        let a = child(&tree, "a.bin");
        let b = child(&tree, "b.bin");
        assert!(a.multi_linked_inode() > 0);
        assert_eq!(a.multi_linked_inode(), b.multi_linked_inode());
        assert_eq!(a.flag(), Flag::Normal);
        assert_eq!(b.flag(), Flag::HardLink);
    }
}

#[cfg(unix)]
#[test]
fn symlinks_are_special_unless_followed() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fixture(tmp.path());
    std::os::unix::fs::symlink("file2", root.join("nested/link")).unwrap();

    let plain = SequentialAnalyzer::new(opts())
        .analyze_dir(&root, &ignore_nothing, None)
        .unwrap();
    let link = child(&child(&plain, "nested"), "link");
    assert_eq!(link.flag(), Flag::Special);
    assert_eq!(link.size(), 0);
    assert_eq!(plain.size(), 7 + 3 * DIR_OVERHEAD);

    let analyzer = SequentialAnalyzer::new(opts());
    analyzer.set_follow_symlinks(true);
    let followed = analyzer.analyze_dir(&root, &ignore_nothing, None).unwrap();
    let link = child(&child(&followed, "nested"), "link");
    assert_eq!(link.flag(), Flag::Normal);
    assert_eq!(link.size(), 2);
    assert_eq!(followed.item_count(), 6);
}

#[cfg(unix)]
#[test]
fn annexed_size_comes_from_the_link_target_name() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fixture(tmp.path());
    std::os::unix::fs::symlink(
        ".git/annex/objects/SHA256E-s1234--deadbeef.bin",
        root.join("annexed"),
    )
    .unwrap();
    let analyzer = SequentialAnalyzer::new(
        OptionsBuilder::new()
            .follow_symlinks(true)
            .show_annexed_size(true)
            .const_gc(true)
            .build(),
    );
    let tree = analyzer.analyze_dir(&root, &ignore_nothing, None).unwrap();
    assert_eq!(child(&tree, "annexed").size(), 1234);
}

#[cfg(unix)]
#[test]
fn unreadable_directory_is_flagged() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().unwrap();
    let root = fixture(tmp.path());
    let locked = root.join("nested/subnested");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    if fs::read_dir(&locked).is_ok() {
        // privileged user, permissions are not enforced
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }
    let tree = ParallelAnalyzer::new(opts())
        .analyze_dir(&root, &ignore_nothing, None)
        .unwrap();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

    let nested = child(&tree, "nested");
    assert_eq!(child(&nested, "subnested").flag(), Flag::Error);
    assert_eq!(nested.flag(), Flag::ChildError);
    assert_eq!(tree.flag(), Flag::ChildError);
}

#[test]
fn progress_and_done_reach_an_observer_thread() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fixture(tmp.path());
    let analyzer = ParallelAnalyzer::new(opts());
    let progress = analyzer.progress();
    let done = analyzer.done();
    let observer = thread::spawn(move || {
        done.wait();
        progress.try_iter().last()
    });
    analyzer.analyze_dir(&root, &ignore_nothing, None).unwrap();
    let last = observer.join().unwrap().expect("at least one progress update");
    assert_eq!(last.item_count, 5);
    assert_eq!(last.total_size, 7);
    assert!(progress_never_backs_up(&analyzer));

    // the next scan gets fresh channels
    analyzer.reset_progress();
    assert!(!analyzer.done().is_done());
    analyzer.analyze_dir(&root, &ignore_nothing, None).unwrap();
    assert!(analyzer.done().is_done());
    assert_eq!(analyzer.progress().try_recv().unwrap().item_count, 5);
}

fn progress_never_backs_up(a: &ParallelAnalyzer) -> bool {
    a.progress().len() <= 1
}

#[test]
fn admission_peak_stays_within_capacity() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("wide");
    for i in 0..32 {
        for j in 0..4 {
            fs::create_dir_all(root.join(format!("d{i}/e{j}"))).unwrap();
        }
        fs::write(root.join(format!("d{i}/f")), b"x").unwrap();
    }
    let analyzer = ParallelAnalyzer::new(
        OptionsBuilder::new()
            .threads(8)
            .scan_slots(2)
            .const_gc(true)
            .build(),
    );
    let tree = analyzer.analyze_dir(&root, &ignore_nothing, None).unwrap();
    assert_eq!(tree.item_count(), 1 + 32 * 6);
    let peak = analyzer.last_peak();
    assert!((1..=2).contains(&peak), "peak {peak}");
}
