//! The engine's output directory viewed as an append-only mailbox.
//!
//! Names are delivered at most once: after `mark_processed` a name never shows
//! up in `poll_new` again, even if the engine rewrites the file.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

/// Extensions treated as result tables.
pub const ARTIFACT_EXTENSIONS: &[&str] = &["xlsx", "csv"];

/// Marker of the engine's aggregate file, which is not a per-image result.
const SUMMARY_MARKER: &str = "summaryall";

/// Prefix of the lock file a spreadsheet application keeps next to an open workbook.
const LOCK_PREFIX: &str = "~$";

pub fn is_artifact_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    if lower.contains(SUMMARY_MARKER) || lower.starts_with(LOCK_PREFIX) {
        return false;
    }
    Path::new(&lower)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| ARTIFACT_EXTENSIONS.contains(&ext))
}

#[derive(Debug)]
pub struct OutputMailbox {
    dir: PathBuf,
    processed: HashSet<String>,
}

impl OutputMailbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            processed: HashSet::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All artifact names currently present, sorted. A missing directory is empty.
    pub fn list(&self) -> io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| is_artifact_name(name))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Artifact names not yet marked processed.
    pub fn poll_new(&self) -> io::Result<Vec<String>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|name| !self.processed.contains(name))
            .collect())
    }

    /// Returns `false` if the name had already been processed.
    pub fn mark_processed(&mut self, name: &str) -> bool {
        self.processed.insert(name.to_string())
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}
