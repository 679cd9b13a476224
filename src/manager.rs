// src/manager.rs

use crate::api::ContentSource;
use crate::downloader::{discard_partial, DownloadWorker, EntryOutcome, WorkItem};
use crate::models::{Manifest, ManifestEntry};
use crate::queue::WorkQueue;
use crate::state_manager::{StateError, StateManager};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),
    #[error("state manager error: {0}")]
    State(#[from] StateError),
}

/// Messages from workers to the aggregation loop, the only place that
/// touches the manifest while a run is in flight.
#[derive(Debug)]
enum WorkerEvent {
    Claimed { index: usize },
    Finished { index: usize, outcome: EntryOutcome },
}

/// Executes manifest entries with a fixed pool of workers.
pub struct DownloadManager {
    source: Arc<dyn ContentSource>,
    state_manager: StateManager,
    cancel: CancellationToken,
}

impl DownloadManager {
    pub fn new(source: Arc<dyn ContentSource>, state_manager: StateManager) -> Self {
        Self {
            source,
            state_manager,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling `token` stops the run: workers abandon their current entry
    /// and claim nothing further.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[cfg(test)]
    pub fn state_manager(&self) -> &StateManager {
        &self.state_manager
    }

    /// Runs the entries at `indices` with exactly `min(concurrency, indices.len())`
    /// workers and returns the updated manifest.
    ///
    /// The manifest is persisted before the first claim, after every finished
    /// entry and once more at the end. Entries abandoned by cancellation stay
    /// `in_progress`.
    pub async fn run(
        &self,
        mut manifest: Manifest,
        indices: &[usize],
        concurrency: usize,
        overwrite: bool,
    ) -> Result<Manifest, ManagerError> {
        if concurrency == 0 {
            return Err(ManagerError::InvalidConcurrency(concurrency));
        }

        let work: Vec<WorkItem> = indices
            .iter()
            .filter_map(|&index| manifest.entries.get(index).map(|e| WorkItem::from_entry(index, e)))
            .collect();
        let total = work.len();
        self.state_manager.save(&manifest).await?;
        if total == 0 {
            return Ok(manifest);
        }

        let pool_size = concurrency.min(total);
        info!(run_id = %manifest.run_id, total, workers = pool_size, overwrite, "Starting run");

        let queue = Arc::new(WorkQueue::new(work));
        let (tx, mut rx) = mpsc::channel(pool_size * 2);
        let mut handles = Vec::with_capacity(pool_size);
        for worker_id in 0..pool_size {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                self.source.clone(),
                queue.clone(),
                tx.clone(),
                overwrite,
                self.cancel.clone(),
            )));
        }
        drop(tx);

        let mut done = 0;
        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Claimed { index } => manifest.entries[index].mark_in_progress(),
                WorkerEvent::Finished { index, outcome } => {
                    done += 1;
                    apply_outcome(&mut manifest.entries[index], outcome, done, total);
                    if let Err(e) = self.state_manager.save(&manifest).await {
                        warn!(path = %self.state_manager.path().display(), error = %e, "Failed to persist manifest");
                    }
                }
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }

        if self.cancel.is_cancelled() {
            info!(run_id = %manifest.run_id, finished = done, total, "Run cancelled");
        }
        self.state_manager.save(&manifest).await?;
        Ok(manifest)
    }
}

async fn worker_loop(
    worker_id: usize,
    source: Arc<dyn ContentSource>,
    queue: Arc<WorkQueue>,
    tx: mpsc::Sender<WorkerEvent>,
    overwrite: bool,
    cancel: CancellationToken,
) {
    debug!(worker_id, "Worker starting");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(work) = queue.claim().await else {
            break;
        };
        if tx.send(WorkerEvent::Claimed { index: work.index }).await.is_err() {
            break;
        }

        let outcome = tokio::select! {
            outcome = DownloadWorker::run(source.as_ref(), &work, overwrite) => outcome,
            _ = cancel.cancelled() => {
                discard_partial(&work.temp_path).await;
                debug!(worker_id, item_id = %work.item_id, "Abandoned entry on cancellation");
                break;
            }
        };

        let finished = WorkerEvent::Finished {
            index: work.index,
            outcome,
        };
        if tx.send(finished).await.is_err() {
            break;
        }
    }
    debug!(worker_id, "Worker finished");
}

fn apply_outcome(entry: &mut ManifestEntry, outcome: EntryOutcome, done: usize, total: usize) {
    let item_id = entry.item.item_id.clone();
    match outcome {
        EntryOutcome::Downloaded { bytes, sha256 } => {
            entry.mark_success(bytes, sha256);
            info!(%item_id, bytes, done, total, path = %entry.target_path.display(), "Downloaded");
        }
        EntryOutcome::Skipped => {
            entry.mark_skipped();
            info!(%item_id, done, total, "Skipped existing file");
        }
        EntryOutcome::Failed(e) => {
            warn!(%item_id, done, total, error = %e, "Download failed");
            entry.mark_failed(e.to_string());
        }
    }
}
