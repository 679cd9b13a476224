use std::io;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::api::{ContentSource, RemoteError};
use crate::integrity::BodyDigest;
use crate::models::{ManifestEntry, SourceKind};

/// Why one entry could not be materialized.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] RemoteError),
    #[error("write to {} failed: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn write_error(path: &Path) -> impl FnOnce(io::Error) -> DownloadError + '_ {
    move |source| DownloadError::Write {
        path: path.to_path_buf(),
        source,
    }
}

/// What a worker did with one entry.
#[derive(Debug)]
pub enum EntryOutcome {
    Downloaded { bytes: u64, sha256: String },
    Skipped,
    Failed(DownloadError),
}

/// The slice of a manifest entry a worker needs, detached from the manifest.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub index: usize,
    pub course_ref: String,
    pub kind: SourceKind,
    pub item_id: String,
    pub target_path: PathBuf,
    pub temp_path: PathBuf,
}

impl WorkItem {
    pub fn from_entry(index: usize, entry: &ManifestEntry) -> Self {
        Self {
            index,
            course_ref: entry.item.course_ref.clone(),
            kind: entry.item.source_kind,
            item_id: entry.item.item_id.clone(),
            target_path: entry.target_path.clone(),
            temp_path: entry.temporary_path(),
        }
    }
}

/// Downloads a single entry: skip check, streamed write to the temporary
/// path, then rename onto the target.
pub struct DownloadWorker;

impl DownloadWorker {
    pub async fn run(source: &dyn ContentSource, work: &WorkItem, overwrite: bool) -> EntryOutcome {
        if !overwrite && tokio::fs::metadata(&work.target_path).await.is_ok() {
            debug!(item_id = %work.item_id, path = %work.target_path.display(), "Target exists, skipping");
            return EntryOutcome::Skipped;
        }

        match Self::download(source, work).await {
            Ok((bytes, sha256)) => EntryOutcome::Downloaded { bytes, sha256 },
            Err(e) => {
                discard_partial(&work.temp_path).await;
                EntryOutcome::Failed(e)
            }
        }
    }

    async fn download(
        source: &dyn ContentSource,
        work: &WorkItem,
    ) -> Result<(u64, String), DownloadError> {
        let mut stream = source
            .fetch_item(&work.course_ref, work.kind, &work.item_id)
            .await?;

        if let Some(parent) = work.target_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(write_error(parent))?;
        }

        let temp = &work.temp_path;
        let mut file = File::create(temp).await.map_err(write_error(temp))?;
        let mut digest = BodyDigest::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk?;
            file.write_all(&bytes).await.map_err(write_error(temp))?;
            digest.update(&bytes);
        }
        file.flush().await.map_err(write_error(temp))?;
        file.sync_all().await.map_err(write_error(temp))?;
        drop(file);

        // Readers of the target only ever see a complete body.
        tokio::fs::rename(temp, &work.target_path)
            .await
            .map_err(write_error(&work.target_path))?;

        Ok(digest.finish())
    }
}

/// Best-effort removal of an abandoned temporary file.
pub async fn discard_partial(temp_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp_path).await {
        if e.kind() != io::ErrorKind::NotFound {
            debug!(path = %temp_path.display(), error = %e, "Could not remove partial file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DownloadableItem;
    use crate::testing::MockSource;
    use tempfile::TempDir;

    fn work(dir: &TempDir, id: &str, name: &str) -> WorkItem {
        let item = DownloadableItem {
            item_id: id.to_string(),
            course_ref: "c".to_string(),
            source_kind: SourceKind::Files,
            suggested_name: name.to_string(),
            size_hint: None,
        };
        let entry = ManifestEntry::new(item, dir.path().join("c/files").join(name));
        WorkItem::from_entry(0, &entry)
    }

    #[tokio::test]
    async fn existing_target_is_skipped_without_fetching() {
        let dir = TempDir::new().unwrap();
        let work = work(&dir, "1", "a.pdf");
        tokio::fs::create_dir_all(work.target_path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&work.target_path, b"old").await.unwrap();

        let source = MockSource::new();
        let outcome = DownloadWorker::run(&source, &work, false).await;

        assert!(matches!(outcome, EntryOutcome::Skipped));
        assert!(source.fetches().is_empty());
        assert_eq!(tokio::fs::read(&work.target_path).await.unwrap(), b"old");
    }

    #[tokio::test]
    async fn overwrite_replaces_existing_target() {
        let dir = TempDir::new().unwrap();
        let work = work(&dir, "1", "a.pdf");
        tokio::fs::create_dir_all(work.target_path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&work.target_path, b"old").await.unwrap();

        let source = MockSource::new().with_body("1", b"fresh body");
        let outcome = DownloadWorker::run(&source, &work, true).await;

        assert!(matches!(outcome, EntryOutcome::Downloaded { bytes: 10, .. }));
        assert_eq!(tokio::fs::read(&work.target_path).await.unwrap(), b"fresh body");
    }

    #[tokio::test]
    async fn writes_body_and_reports_digest() {
        let dir = TempDir::new().unwrap();
        let work = work(&dir, "1", "a.pdf");
        let source = MockSource::new().with_body("1", b"hello world");

        let outcome = DownloadWorker::run(&source, &work, false).await;

        match outcome {
            EntryOutcome::Downloaded { bytes, sha256 } => {
                assert_eq!(bytes, 11);
                assert_eq!(
                    sha256,
                    "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(tokio::fs::read(&work.target_path).await.unwrap(), b"hello world");
        assert!(tokio::fs::metadata(&work.temp_path).await.is_err());
    }

    #[tokio::test]
    async fn remote_failure_leaves_nothing_on_disk() {
        let dir = TempDir::new().unwrap();
        let work = work(&dir, "1", "a.pdf");
        let source = MockSource::new().with_fetch_failures(
            "1",
            1,
            RemoteError::Forbidden("locked".into()),
        );

        let outcome = DownloadWorker::run(&source, &work, false).await;

        match outcome {
            EntryOutcome::Failed(DownloadError::Fetch(RemoteError::Forbidden(_))) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(tokio::fs::metadata(&work.target_path).await.is_err());
    }

    #[tokio::test]
    async fn broken_stream_never_reaches_target() {
        let dir = TempDir::new().unwrap();
        let work = work(&dir, "1", "a.pdf");
        let source = MockSource::new()
            .with_body("1", b"partial body")
            .with_broken_stream("1");

        let outcome = DownloadWorker::run(&source, &work, false).await;

        assert!(matches!(outcome, EntryOutcome::Failed(DownloadError::Fetch(_))));
        assert!(tokio::fs::metadata(&work.target_path).await.is_err());
        assert!(tokio::fs::metadata(&work.temp_path).await.is_err());
    }

    #[tokio::test]
    async fn local_write_error_is_reported() {
        let dir = TempDir::new().unwrap();
        let work = work(&dir, "1", "a.pdf");
        // A regular file where the course directory should be.
        tokio::fs::write(dir.path().join("c"), b"not a dir").await.unwrap();

        let source = MockSource::new();
        let outcome = DownloadWorker::run(&source, &work, false).await;

        assert!(matches!(outcome, EntryOutcome::Failed(DownloadError::Write { .. })));
    }
}
