//! Directory layout of the file exchange and the JSON file helpers every
//! component writes through.

use std::path::{Path, PathBuf};

use agentbridge_core::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tracing::debug;

use crate::config::PathsConfig;

/// Resolved directories, shared by every component.
#[derive(Debug, Clone)]
pub struct BridgeLayout {
    pub root: PathBuf,
    pub mailbox: PathBuf,
    pub archive: PathBuf,
    pub failed: PathBuf,
    pub validated: PathBuf,
    pub outbox: PathBuf,
    pub state: PathBuf,
    pub heartbeats: PathBuf,
    pub resume: PathBuf,
    pub captures: PathBuf,
    pub patches: PathBuf,
    pub memory_file: PathBuf,
}

impl BridgeLayout {
    pub fn from_config(paths: &PathsConfig) -> Self {
        Self {
            root: paths.root.clone(),
            mailbox: paths.resolve(&paths.mailbox),
            archive: paths.resolve(&paths.archive),
            failed: paths.resolve(&paths.failed),
            validated: paths.resolve(&paths.validated),
            outbox: paths.resolve(&paths.outbox),
            state: paths.resolve(&paths.state),
            heartbeats: paths.resolve(&paths.heartbeats),
            resume: paths.resolve(&paths.resume),
            captures: paths.resolve(&paths.captures),
            patches: paths.resolve(&paths.patches),
            memory_file: paths.resolve(&paths.memory_file),
        }
    }

    /// Default layout under `root`.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let paths = PathsConfig {
            root: root.into(),
            ..PathsConfig::default()
        };
        Self::from_config(&paths)
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.mailbox,
            &self.archive,
            &self.failed,
            &self.validated,
            &self.outbox,
            &self.state,
            &self.heartbeats,
            &self.resume,
            &self.captures,
            &self.patches,
        ] {
            fs::create_dir_all(dir).await?;
        }
        if let Some(parent) = self.memory_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    pub fn state_file(&self, agent_id: &str) -> PathBuf {
        self.state.join(format!("{agent_id}.json"))
    }

    pub fn heartbeat_file(&self, agent_id: &str) -> PathBuf {
        self.heartbeats.join(format!("{agent_id}.json"))
    }

    pub fn resume_file(&self, agent_id: &str) -> PathBuf {
        self.resume.join(format!("{agent_id}.json"))
    }

    pub fn outbox_file(&self, agent_id: &str) -> PathBuf {
        self.outbox.join(format!("agent-{agent_id}.json"))
    }

    pub fn capture_file(&self, agent_id: &str) -> PathBuf {
        self.captures.join(format!("{agent_id}.txt"))
    }

    /// Move a processed artifact into archive/. Keeps its name unless that is
    /// taken, see [`move_into`].
    pub async fn archive(&self, src: &Path, tag: &str) -> Result<PathBuf> {
        move_into(src, &self.archive, tag).await
    }

    /// Move a terminally failed artifact into failed/. Keeps its name unless
    /// that is taken, see [`move_into`].
    pub async fn dead_letter(&self, src: &Path, tag: &str) -> Result<PathBuf> {
        move_into(src, &self.failed, tag).await
    }
}

/// Move `src` into `dir` without replacing anything already there.
///
/// The file keeps its name when it is free. Otherwise it becomes
/// `<stem>-<tag>.<ext>`, and if that is taken too (or `tag` is empty) a
/// random suffix is added. Falls back to copy + remove across filesystems.
pub async fn move_into(src: &Path, dir: &Path, tag: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir).await?;
    let dest = free_destination(src, dir, tag).await?;
    if fs::rename(src, &dest).await.is_err() {
        fs::copy(src, &dest).await?;
        fs::remove_file(src).await?;
    }
    debug!("Moved {} -> {}", src.display(), dest.display());
    Ok(dest)
}

async fn free_destination(src: &Path, dir: &Path, tag: &str) -> Result<PathBuf> {
    let name = src.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("no file name in {}", src.display()),
        )
    })?;
    let dest = dir.join(name);
    if !fs::try_exists(&dest).await? {
        return Ok(dest);
    }

    let stem = src.file_stem().and_then(|s| s.to_str()).unwrap_or("artifact");
    let ext = src
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    if !tag.is_empty() {
        let tagged = dir.join(format!("{stem}-{tag}{ext}"));
        if !fs::try_exists(&tagged).await? {
            return Ok(tagged);
        }
    }
    loop {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let random = match tag {
            "" => dir.join(format!("{stem}-{}{ext}", &suffix[..8])),
            _ => dir.join(format!("{stem}-{tag}-{}{ext}", &suffix[..8])),
        };
        if !fs::try_exists(&random).await? {
            return Ok(random);
        }
    }
}

/// Write pretty JSON through a temp file and rename, so readers never see a torn file.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, json).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Read and parse a JSON file. `Ok(None)` when the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// File stems of `*.json` entries in `dir`, sorted. A missing dir is empty.
pub async fn list_json_stems(dir: &Path) -> Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut ids = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            ids.push(stem.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}
