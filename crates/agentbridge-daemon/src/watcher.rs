//! Mailbox scanner.
//!
//! Polls the mailbox directory for files matching the configured glob and
//! yields them oldest first. Files already being processed, and duplicates
//! that were already reported, are filtered out until they change.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use agentbridge_core::{Error, Result};
use dashmap::{DashMap, DashSet};
use globset::{GlobBuilder, GlobMatcher};
use tokio::fs;
use tracing::debug;

/// A mailbox file observed by one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub name: String,
    pub modified: SystemTime,
    pub len: u64,
}

pub struct MailboxWatcher {
    dir: PathBuf,
    matcher: GlobMatcher,
    in_flight: DashSet<PathBuf>,
    /// Duplicates already reported, keyed by path with the (mtime, len) they had.
    reported: DashMap<PathBuf, (SystemTime, u64)>,
}

impl MailboxWatcher {
    pub fn new(dir: impl Into<PathBuf>, pattern: &str) -> Result<Self> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| Error::config(format!("invalid mailbox pattern '{pattern}': {e}")))?
            .compile_matcher();
        Ok(Self {
            dir: dir.into(),
            matcher,
            in_flight: DashSet::new(),
            reported: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Matching files ordered by (modification time, name). Hidden files,
    /// in-flight files and unchanged reported duplicates are skipped.
    pub async fn scan(&self) -> Result<Vec<Candidate>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !self.matcher.is_match(&name) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let path = entry.path();
            if self.in_flight.contains(&path) {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let len = meta.len();
            if self.reported.get(&path).is_some_and(|seen| *seen == (modified, len)) {
                continue;
            }
            found.push(Candidate { path, name, modified, len });
        }

        found.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
        // Forget reported duplicates that have left the mailbox.
        self.reported.retain(|path, _| path.exists());
        Ok(found)
    }

    /// Mark a file as being processed. False if it already was.
    pub fn claim(&self, candidate: &Candidate) -> bool {
        self.in_flight.insert(candidate.path.clone())
    }

    pub fn release(&self, path: &Path) {
        self.in_flight.remove(path);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Remember a duplicate so it is not reported again while unchanged.
    /// Returns true the first time.
    pub fn report_duplicate(&self, candidate: &Candidate) -> bool {
        let key = (candidate.modified, candidate.len);
        let first = self.reported.get(&candidate.path).map_or(true, |seen| *seen != key);
        if first {
            debug!(file = %candidate.name, "Duplicate noted");
            self.reported.insert(candidate.path.clone(), key);
        }
        first
    }
}
