//! Directory walker that produces the path corpus.


use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::CorpusConfig;

#[derive(Debug, Clone)]
pub struct CorpusBuilder {
    roots: Vec<PathBuf>,
    ignore: GlobSet,
    follow_links: bool,
    max_depth: Option<usize>,
}

impl CorpusBuilder {
    #[inline]
    pub fn from_config(config: &CorpusConfig) -> Result<Self> {
        Ok(Self {
            roots: config.resolve_roots(),
            ignore: build_globset(&config.ignore)?,
            follow_links: config.follow_links,
            max_depth: config.max_depth,
        })
    }

    #[inline]
    pub fn with_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.roots = roots;
        self
    }

    #[inline]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Walk every root and return the roots plus their descendants.
    ///
    /// Entries whose name matches an ignore pattern are skipped together with
    /// everything below them. Unreadable entries and missing roots are logged
    /// and skipped. Order is deterministic: roots in configuration order,
    /// each walked depth-first with siblings sorted by name.
    #[inline]
    pub fn scan(&self) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();

        for root in &self.roots {
            if !root.exists() {
                warn!("Skipping missing root {}", root.display());
                continue;
            }

            debug!("Scanning {}", root.display());
            let before = paths.len();

            let mut walker = WalkDir::new(root)
                .follow_links(self.follow_links)
                .sort_by_file_name();
            if let Some(depth) = self.max_depth {
                walker = walker.max_depth(depth);
            }

            let entries = walker.into_iter().filter_entry(|entry| {
                entry.depth() == 0 || !self.ignore.is_match(entry.file_name())
            });

            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Skipping unreadable entry: {}", e);
                        continue;
                    }
                };

                let Some(path) = entry.path().to_str() else {
                    debug!("Skipping non UTF-8 path {}", entry.path().display());
                    continue;
                };

                if seen.insert(path.to_string()) {
                    paths.push(path.to_string());
                }
            }

            debug!("Found {} paths under {}", paths.len() - before, root.display());
        }

        info!("Corpus scan found {} paths", paths.len());
        Ok(paths)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern).with_context(|| format!("Invalid ignore pattern: {pattern}"))?,
        );
    }
    builder.build().context("Failed to compile ignore patterns")
}
