//! Caller-facing operations: plan a run, execute it, resume it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::ContentSource;
use crate::enumerator::enumerate;
use crate::manager::{DownloadManager, ManagerError};
use crate::models::{Manifest, ManifestEntry, SourceKind};
use crate::paths::PathResolver;
use crate::resume::load_for_resume;
use crate::state_manager::{StateError, StateManager};

pub const DEFAULT_CONCURRENCY: usize = 12;

/// Run-level failures. Per-item problems never show up here; they end up in
/// the entry's `failed` state instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("manifest not found: {}", .0.display())]
    ManifestNotFound(PathBuf),
    #[error("manifest {} is corrupt: {reason}", .path.display())]
    ManifestCorrupt { path: PathBuf, reason: String },
    #[error("invalid run parameters: {0}")]
    InvalidRunParameters(String),
    #[error("manifest storage error: {0}")]
    Storage(StateError),
}

impl From<StateError> for EngineError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(path) => EngineError::ManifestNotFound(path),
            StateError::Corrupt { path, reason } => EngineError::ManifestCorrupt { path, reason },
            other => EngineError::Storage(other),
        }
    }
}

impl From<ManagerError> for EngineError {
    fn from(e: ManagerError) -> Self {
        match e {
            ManagerError::InvalidConcurrency(n) => {
                EngineError::InvalidRunParameters(format!("concurrency must be at least 1, got {n}"))
            }
            ManagerError::State(e) => e.into(),
        }
    }
}

/// Defaults stamped onto newly planned manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    pub concurrency: usize,
    pub overwrite: bool,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.concurrency == 0 {
            return Err(ManagerError::InvalidConcurrency(self.concurrency).into());
        }
        Ok(())
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            overwrite: false,
        }
    }
}

pub struct Engine {
    source: Arc<dyn ContentSource>,
    config: RunConfig,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(source: Arc<dyn ContentSource>, config: RunConfig) -> Self {
        Self {
            source,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Enumerates the courses and builds a manifest with every entry `pending`.
    /// Nothing is written to disk.
    ///
    /// `dest_root` is made absolute against the current directory, so the
    /// manifest resumes to the same place from anywhere.
    pub async fn plan(
        &self,
        course_refs: &[String],
        kinds: &[SourceKind],
        dest_root: &Path,
    ) -> Result<Manifest, EngineError> {
        self.config.validate()?;
        let dest_root = std::path::absolute(dest_root).map_err(|e| {
            EngineError::InvalidRunParameters(format!(
                "cannot resolve destination {}: {e}",
                dest_root.display()
            ))
        })?;

        let enumeration = enumerate(self.source.as_ref(), course_refs, kinds).await;

        let mut manifest = Manifest::new(
            dest_root.clone(),
            self.config.concurrency,
            self.config.overwrite,
        );
        manifest.base_url = self.source.origin();
        let mut resolver = PathResolver::new();
        for item in enumeration.items {
            let target = resolver.claim(&dest_root, &item);
            manifest.entries.push(ManifestEntry::new(item, target));
        }
        manifest.warnings = enumeration.warnings;

        info!(
            run_id = %manifest.run_id,
            entries = manifest.entries.len(),
            warnings = manifest.warnings.len(),
            "Planned run"
        );
        Ok(manifest)
    }

    /// Executes every entry of `manifest`, persisting it at its default path.
    ///
    /// Entries whose file already exists are skipped unless `overwrite` is set,
    /// so executing a finished manifest again fetches nothing.
    pub async fn execute(
        &self,
        mut manifest: Manifest,
        concurrency: usize,
        overwrite: bool,
    ) -> Result<Manifest, EngineError> {
        if concurrency == 0 {
            return Err(ManagerError::InvalidConcurrency(concurrency).into());
        }
        manifest.concurrency = concurrency;
        manifest.overwrite_policy = overwrite;

        let indices: Vec<usize> = (0..manifest.entries.len()).collect();
        let manager = self.manager(StateManager::for_manifest(&manifest));
        Ok(manager.run(manifest, &indices, concurrency, overwrite).await?)
    }

    /// Continues the run persisted at `manifest_path` with its own parameters.
    pub async fn resume(&self, manifest_path: &Path) -> Result<Manifest, EngineError> {
        self.resume_with_destination(manifest_path, None).await
    }

    /// Like [`Engine::resume`], but rejects a destination that differs from
    /// the one the manifest was planned for.
    ///
    /// Either way, a manifest planned against another Canvas instance than
    /// this engine's source is rejected before anything is fetched.
    pub async fn resume_with_destination(
        &self,
        manifest_path: &Path,
        dest_override: Option<&Path>,
    ) -> Result<Manifest, EngineError> {
        let plan = load_for_resume(manifest_path).await?;
        let manifest = plan.manifest;

        if let Some(dest) = dest_override {
            if !same_location(dest, &manifest.dest_root).await {
                return Err(EngineError::InvalidRunParameters(format!(
                    "destination {} conflicts with the manifest's {}",
                    dest.display(),
                    manifest.dest_root.display()
                )));
            }
        }
        if let (Some(recorded), Some(current)) = (&manifest.base_url, self.source.origin()) {
            if *recorded != current {
                return Err(EngineError::InvalidRunParameters(format!(
                    "manifest was planned against {recorded}, not {current}"
                )));
            }
        }
        if manifest.concurrency == 0 {
            return Err(EngineError::InvalidRunParameters(
                "manifest records a concurrency of 0".to_string(),
            ));
        }

        let concurrency = manifest.concurrency;
        let overwrite = manifest.overwrite_policy;
        let manager = self.manager(StateManager::new(manifest_path));
        Ok(manager
            .run(manifest, &plan.retryable, concurrency, overwrite)
            .await?)
    }

    fn manager(&self, state_manager: StateManager) -> DownloadManager {
        DownloadManager::new(self.source.clone(), state_manager)
            .with_cancellation(self.cancel.clone())
    }
}

async fn same_location(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (
        tokio::fs::canonicalize(a).await,
        tokio::fs::canonicalize(b).await,
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
