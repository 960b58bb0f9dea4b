use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::RegexSet;

/// Ignore rules assembled from the command line. One entry is skipped when
/// any rule matches it.
#[derive(Default)]
pub struct IgnoreRules {
    paths: Vec<PathBuf>,
    regex: Option<RegexSet>,
    globs: Option<GlobSet>,
    hidden: bool,
}

impl IgnoreRules {
    pub fn new(paths: &[PathBuf], regexes: &[String], globs: &[String], no_hidden: bool) -> Result<Self> {
        let paths = paths
            .iter()
            .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
            .collect();
        let regex = if regexes.is_empty() {
            None
        } else {
            Some(RegexSet::new(regexes).context("invalid --ignore-regex")?)
        };
        let globs = if globs.is_empty() {
            None
        } else {
            let mut b = GlobSetBuilder::new();
            for g in globs {
                b.add(Glob::new(g).with_context(|| format!("invalid --ignore-glob {g}"))?);
            }
            Some(b.build()?)
        };
        Ok(Self {
            paths,
            regex,
            globs,
            hidden: no_hidden,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.regex.is_none() && self.globs.is_none() && !self.hidden
    }

    pub fn is_ignored(&self, name: &str, path: &Path) -> bool {
        if self.hidden && name.starts_with('.') {
            return true;
        }
        if self.paths.iter().any(|p| p == path) {
            return true;
        }
        if let Some(re) = &self.regex {
            if re.is_match(&path.to_string_lossy()) {
                return true;
            }
        }
        if let Some(g) = &self.globs {
            if g.is_match(path) || g.is_match(name) {
                return true;
            }
        }
        false
    }
}
