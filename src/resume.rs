use std::path::Path;

use tracing::{info, warn};

use crate::models::{EntryStatus, Manifest};
use crate::state_manager::{StateError, StateManager};

/// `last_error` of an entry that was still in flight when its run died.
pub const INTERRUPTED: &str = "interrupted";

/// A persisted manifest ready to be continued.
#[derive(Debug)]
pub struct ResumePlan {
    pub manifest: Manifest,
    /// Indices of `failed` and `pending` entries, in manifest order.
    pub retryable: Vec<usize>,
}

/// Reads the manifest at `manifest_path` and works out what is left to do.
pub async fn load_for_resume(manifest_path: &Path) -> Result<ResumePlan, StateError> {
    let mut manifest = StateManager::new(manifest_path).load().await?;
    let interrupted = reclassify_interrupted(&mut manifest);
    if interrupted > 0 {
        warn!(run_id = %manifest.run_id, interrupted, "Previous run was interrupted");
    }
    let retryable = manifest.retryable_indices();
    info!(run_id = %manifest.run_id, retryable = retryable.len(), total = manifest.entries.len(), "Loaded manifest for resume");
    Ok(ResumePlan {
        manifest,
        retryable,
    })
}

/// Turns every `in_progress` entry into a `failed` one. Returns how many changed.
pub fn reclassify_interrupted(manifest: &mut Manifest) -> usize {
    let mut changed = 0;
    for entry in manifest
        .entries
        .iter_mut()
        .filter(|entry| entry.status == EntryStatus::InProgress)
    {
        entry.mark_failed(INTERRUPTED);
        changed += 1;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DownloadableItem, ManifestEntry, SourceKind};
    use tempfile::TempDir;

    fn manifest_with(statuses: &[EntryStatus], dest: &Path) -> Manifest {
        let mut manifest = Manifest::new(dest.to_path_buf(), 3, false);
        for (i, status) in statuses.iter().enumerate() {
            let item = DownloadableItem {
                item_id: i.to_string(),
                course_ref: "c".into(),
                source_kind: SourceKind::Files,
                suggested_name: format!("{i}.txt"),
                size_hint: None,
            };
            let mut entry = ManifestEntry::new(item, dest.join(format!("{i}.txt")));
            entry.status = *status;
            manifest.entries.push(entry);
        }
        manifest
    }

    #[tokio::test]
    async fn picks_failed_and_pending_and_reclassifies_in_progress() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest_with(
            &[
                EntryStatus::Success,
                EntryStatus::Failed,
                EntryStatus::Pending,
                EntryStatus::InProgress,
                EntryStatus::Skipped,
            ],
            dir.path(),
        );
        let store = StateManager::for_manifest(&manifest);
        store.save(&manifest).await.unwrap();

        let plan = load_for_resume(store.path()).await.unwrap();

        assert_eq!(plan.retryable, vec![1, 2, 3]);
        let interrupted = &plan.manifest.entries[3];
        assert_eq!(interrupted.status, EntryStatus::Failed);
        assert_eq!(interrupted.last_error.as_deref(), Some(INTERRUPTED));
        assert_eq!(plan.manifest.entries[0].status, EntryStatus::Success);
        assert_eq!(plan.manifest.entries[4].status, EntryStatus::Skipped);
    }

    #[tokio::test]
    async fn missing_manifest_is_reported() {
        let dir = TempDir::new().unwrap();
        let err = load_for_resume(&dir.path().join("missing.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn clean_manifest_needs_no_reclassification() {
        let mut manifest = manifest_with(&[EntryStatus::Success, EntryStatus::Failed], Path::new("/d"));
        assert_eq!(reclassify_interrupted(&mut manifest), 0);
    }
}
