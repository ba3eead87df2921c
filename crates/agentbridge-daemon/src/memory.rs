//! Processed-artifact memory.
//!
//! A persisted set of fingerprints. Once a fingerprint is recorded it is never
//! removed, so every artifact is processed at most once for the lifetime of the
//! store. The file is rewritten in full on every insert.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use agentbridge_core::{now_rfc3339, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::layout::{read_json, write_json_atomic};

/// On-disk shape of the memory file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub hashes: Vec<String>,
    pub last_updated: String,
    pub count: usize,
}

pub struct MemoryTracker {
    path: PathBuf,
    hashes: BTreeSet<String>,
}

impl MemoryTracker {
    /// Hydrate from `path`. A missing file is an empty store; a corrupt one is an error.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let hashes = match read_json::<MemorySnapshot>(&path).await? {
            Some(snapshot) => {
                info!("Loaded {} fingerprints from {}", snapshot.hashes.len(), path.display());
                snapshot.hashes.into_iter().collect()
            }
            None => BTreeSet::new(),
        };
        Ok(Self { path, hashes })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_processed(&self, fingerprint: &str) -> bool {
        self.hashes.contains(fingerprint)
    }

    /// Record a fingerprint. Returns `false` when it was already present, in
    /// which case nothing is written. The in-memory set only changes after the
    /// file has been persisted.
    pub async fn track_processing(
        &mut self,
        fingerprint: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<bool> {
        if self.hashes.contains(fingerprint) {
            return Ok(false);
        }

        let mut hashes: Vec<String> = self.hashes.iter().cloned().collect();
        hashes.push(fingerprint.to_string());
        hashes.sort();
        let snapshot = MemorySnapshot {
            count: hashes.len(),
            hashes,
            last_updated: now_rfc3339(),
        };
        write_json_atomic(&self.path, &snapshot).await?;
        self.hashes.insert(fingerprint.to_string());

        match metadata {
            Some(meta) => debug!(fingerprint, %meta, count = self.hashes.len(), "Tracked artifact"),
            None => debug!(fingerprint, count = self.hashes.len(), "Tracked artifact"),
        }
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}
