//! File discovery source
//!
//! Polls the input location for files matching a glob-style pattern and
//! yields each file exactly once across the source's lifetime. The set of
//! already-returned paths grows monotonically; it is owned by the dispatch
//! loop and never shared.

use glob::Pattern;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use styleflow_common::{Result, StyleFlowError, METRICS};
use tracing::debug;

/// Incremental directory scanner.
pub struct FileSource {
    root: PathBuf,
    pattern: Pattern,
    seen: HashSet<PathBuf>,
}

impl FileSource {
    /// Create a source over `root` with a glob-style filename pattern such
    /// as `*.jpg`.
    pub fn new(root: impl Into<PathBuf>, pattern: &str) -> Result<Self> {
        let compiled = Pattern::new(pattern).map_err(|e| {
            StyleFlowError::config(format!("Invalid file pattern {:?}: {}", pattern, e))
        })?;

        Ok(Self {
            root: root.into(),
            pattern: compiled,
            seen: HashSet::new(),
        })
    }

    /// The location being polled.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Matching files not returned by any prior call, in sorted order.
    ///
    /// A listing failure is surfaced to the caller as-is; the source does
    /// not retry and does not mark anything seen on the failed call.
    pub fn new_files(&mut self) -> Result<Vec<PathBuf>> {
        let mut fresh = Vec::new();

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            let path = entry.path();
            let matches = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| self.pattern.matches(name))
                .unwrap_or(false);
            if !matches || self.seen.contains(&path) {
                continue;
            }

            fresh.push(path);
        }

        fresh.sort();
        for path in &fresh {
            self.seen.insert(path.clone());
        }

        if !fresh.is_empty() {
            METRICS
                .pipeline
                .files_discovered_total
                .inc_by(fresh.len() as u64);
            debug!("Discovered {} new files under {}", fresh.len(), self.root.display());
        }

        Ok(fresh)
    }

    /// Number of files returned so far.
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}
