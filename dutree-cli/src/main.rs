use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use crossbeam_channel::{select, Receiver};
use dutree_core::{
    collect_top_files, encode_json, Analyzer, Done, Item, ItemRef, Options, OptionsBuilder,
    ParallelAnalyzer, Progress, SequentialAnalyzer, SqliteAnalyzer, StoredAnalyzer,
    UringAnalyzer,
};
use humansize::{format_size, BINARY};

mod ignore;

use ignore::IgnoreRules;

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
enum BackendArg {
    Sequential,
    Parallel,
    Stored,
    Sqlite,
    Uring,
}

#[derive(Parser, Debug)]
#[command(
    name = "dutree",
    version,
    about = "dutree - disk usage analyzer",
    after_help = "Examples:\n\
      Scan the current dir and list the 20 largest files\n\
        dutree . --top 20\n\
      Keep the tree in SQLite and reuse it on the next run\n\
        dutree /srv --backend sqlite --db /tmp/srv.db\n\
      Skip hidden entries and build outputs\n\
        dutree . --no-hidden --ignore-glob '**/target' --ignore-regex '/node_modules$'\n\
    "
)]
struct Args {
    /// Directory to scan
    #[arg(value_name = "PATH", default_value = ".")]
    path: PathBuf,

    /// Analyzer backend
    #[arg(long, value_enum, default_value_t = BackendArg::Parallel)]
    backend: BackendArg,

    /// Database path for the stored and sqlite backends
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Directory to skip (repeatable)
    #[arg(long = "ignore-dir", value_name = "PATH")]
    ignore_dir: Vec<PathBuf>,

    /// Skip entries whose full path matches (repeatable)
    #[arg(long = "ignore-regex", value_name = "RE")]
    ignore_regex: Vec<String>,

    /// Skip entries whose name or path matches the glob (repeatable)
    #[arg(long = "ignore-glob", value_name = "GLOB")]
    ignore_glob: Vec<String>,

    /// Skip hidden files and directories
    #[arg(long = "no-hidden", action = ArgAction::SetTrue)]
    no_hidden: bool,

    /// Follow symlinks to files
    #[arg(long = "follow-symlinks", action = ArgAction::SetTrue)]
    follow_symlinks: bool,

    /// Size dangling git-annex links from their target name
    #[arg(long = "show-annexed-size", action = ArgAction::SetTrue)]
    show_annexed_size: bool,

    /// Show the N largest files
    #[arg(long, default_value_t = 20)]
    top: usize,

    /// Write an ncdu-compatible JSON export to this path
    #[arg(long, value_name = "FILE")]
    json: Option<PathBuf>,

    /// Keep the memory governor off
    #[arg(long = "const-gc", action = ArgAction::SetTrue)]
    const_gc: bool,

    /// Number of worker threads (defaults to CPU count)
    #[arg(long)]
    threads: Option<usize>,

    /// Do not print live progress to stderr
    #[arg(long = "no-progress", action = ArgAction::SetTrue)]
    no_progress: bool,
}

fn build_analyzer(args: &Args, opt: Options) -> Result<Box<dyn Analyzer>> {
    let db = || {
        args.db
            .clone()
            .with_context(|| format!("--db is required for the {:?} backend", args.backend))
    };
    Ok(match args.backend {
        BackendArg::Sequential => Box::new(SequentialAnalyzer::new(opt)),
        BackendArg::Parallel => Box::new(ParallelAnalyzer::new(opt)),
        BackendArg::Stored => Box::new(StoredAnalyzer::open(&db()?, opt)?),
        BackendArg::Sqlite => Box::new(SqliteAnalyzer::open(&db()?, opt)?),
        BackendArg::Uring => match UringAnalyzer::new(opt.clone()) {
            Ok(a) => Box::new(a),
            Err(e) => {
                log::warn!("{e:#}; falling back to the parallel backend");
                Box::new(ParallelAnalyzer::new(opt))
            }
        },
    })
}

/// Print the latest snapshot at most every 100ms until the scan is done.
fn report_progress(rx: Receiver<Progress>, done: Done) {
    let every = Duration::from_millis(100);
    let mut last: Option<Instant> = None;
    loop {
        select! {
            recv(rx) -> msg => {
                let Ok(p) = msg else { break };
                if last.map_or(true, |t| t.elapsed() >= every) {
                    eprint!(
                        "\rscanning … {} items, {} | {}\x1b[K",
                        p.item_count,
                        format_size(p.total_size, BINARY),
                        short_path(&p.current_path)
                    );
                    last = Some(Instant::now());
                }
            }
            recv(done.receiver()) -> _ => break,
        }
    }
    if last.is_some() {
        eprint!("\r\x1b[K");
    }
}

fn short_path(p: &Path) -> String {
    let s = p.display().to_string();
    const MAX: usize = 60;
    let n = s.chars().count();
    if n <= MAX {
        return s;
    }
    let tail: String = s.chars().skip(n - (MAX - 1)).collect();
    format!("…{tail}")
}

#[cfg(feature = "archive")]
fn scan_archive(path: &Path) -> Option<Result<ItemRef>> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    (path.is_file() && matches!(ext.as_str(), "zip" | "jar"))
        .then(|| dutree_core::ArchiveDir::open_zip(path))
}

#[cfg(not(feature = "archive"))]
fn scan_archive(_path: &Path) -> Option<Result<ItemRef>> {
    None
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let root = std::fs::canonicalize(&args.path)
        .with_context(|| format!("cannot open {}", args.path.display()))?;
    let mut builder = OptionsBuilder::new()
        .follow_symlinks(args.follow_symlinks)
        .show_annexed_size(args.show_annexed_size)
        .const_gc(args.const_gc);
    if let Some(t) = args.threads {
        builder = builder.threads(t);
    }
    let opt = builder.build();

    let t0 = Instant::now();
    let (tree, backend) = match scan_archive(&root) {
        Some(tree) => (tree?, "archive".to_string()),
        None => {
            if !root.is_dir() {
                bail!("{} is not a directory", root.display());
            }
            let rules = Arc::new(IgnoreRules::new(
                &args.ignore_dir,
                &args.ignore_regex,
                &args.ignore_glob,
                args.no_hidden,
            )?);
            let analyzer = build_analyzer(&args, opt)?;
            let reporter = (!args.no_progress).then(|| {
                let rx = analyzer.progress();
                let done = analyzer.done();
                thread::Builder::new()
                    .name("dutree-progress".into())
                    .spawn(move || report_progress(rx, done))
            });
            let ignore = {
                let rules = rules.clone();
                move |name: &str, path: &Path| rules.is_ignored(name, path)
            };
            let ignore: &dutree_core::IgnoreFn = &ignore;
            let ignore_file = (!rules.is_empty()).then_some(ignore);
            let result = analyzer.analyze_dir(&root, ignore, ignore_file);
            if let Some(Ok(h)) = reporter {
                let _ = h.join();
            }
            (result?, format!("{:?}", args.backend).to_lowercase())
        }
    };
    let dt = t0.elapsed();

    if args.top > 0 {
        let top = collect_top_files(&tree, args.top)?;
        println!("Top {} files under {}:", top.len(), root.display());
        for (i, item) in top.iter().enumerate() {
            println!(
                "{:>3}. {:>10} | disk={:>10} | {}{}",
                i + 1,
                format_size(item.size(), BINARY),
                format_size(item.usage(), BINARY),
                item.path().display(),
                match item.flag().as_char() {
                    ' ' => String::new(),
                    c => format!(" [{c}]"),
                }
            );
        }
        println!();
    }

    println!("Summary:");
    println!("  Root: {}", tree.path().display());
    println!("  Backend: {backend}");
    println!("  Elapsed: {:.3}s", dt.as_secs_f64());
    println!(
        "  Total: items={} | size={} | disk={}",
        tree.item_count(),
        format_size(tree.size(), BINARY),
        format_size(tree.usage(), BINARY)
    );
    if tree.flag().is_error() {
        println!("  Note: some directories could not be read");
    }

    if let Some(json_path) = &args.json {
        let file = File::create(json_path)
            .with_context(|| format!("create {}", json_path.display()))?;
        encode_json(tree.as_ref(), file)?;
        println!("wrote JSON: {}", json_path.display());
    }
    Ok(())
}
