// src/state_manager.rs

use crate::models::Manifest;
use std::collections::HashSet;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("manifest not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("manifest {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StateError + '_ {
    move |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Manages the persistence of one run manifest as a pretty-printed JSON file.
///
/// Only one task should call [`StateManager::save`] at a time; the scheduler
/// funnels every update through a single aggregation loop for that reason.
#[derive(Debug, Clone)]
pub struct StateManager {
    path: PathBuf,
}

impl StateManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// A manager writing to the manifest's default location under its destination root.
    pub fn for_manifest(manifest: &Manifest) -> Self {
        Self::new(manifest.default_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the file on disk with `manifest`. The previous contents stay
    /// intact until the new ones are fully written.
    pub async fn save(&self, manifest: &Manifest) -> Result<(), StateError> {
        let data = serde_json::to_vec_pretty(manifest)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error(parent))?;
        }

        let temp_path = self.temp_path();
        {
            let mut file = tokio::fs::File::create(&temp_path)
                .await
                .map_err(io_error(&temp_path))?;
            file.write_all(&data).await.map_err(io_error(&temp_path))?;
            file.sync_all().await.map_err(io_error(&temp_path))?;
        }
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(io_error(&self.path))?;
        Ok(())
    }

    /// Loads and validates the manifest. Entries come back exactly as they
    /// were persisted, `in_progress` included.
    pub async fn load(&self) -> Result<Manifest, StateError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StateError::NotFound(self.path.clone()))
            }
            Err(e) => return Err(io_error(&self.path)(e)),
        };

        let manifest: Manifest = serde_json::from_str(&raw).map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        validate(&manifest).map_err(|reason| StateError::Corrupt {
            path: self.path.clone(),
            reason,
        })?;
        Ok(manifest)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name: OsString = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

/// Checks the invariants serde cannot: identity and target uniqueness.
fn validate(manifest: &Manifest) -> Result<(), String> {
    let mut keys = HashSet::new();
    let mut targets = HashSet::new();
    for entry in &manifest.entries {
        let (course, kind, id) = entry.item.key();
        if !keys.insert((course, kind, id)) {
            return Err(format!("duplicate entry {course}/{kind}/{id}"));
        }
        if !targets.insert(entry.target_path.as_path()) {
            return Err(format!(
                "duplicate target path {}",
                entry.target_path.display()
            ));
        }
    }
    Ok(())
}
