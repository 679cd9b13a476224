use std::collections::VecDeque;
use tokio::sync::Mutex;

use crate::downloader::WorkItem;

/// Entries waiting for a worker.
///
/// Popping an item is the claim: once handed out it is gone from the queue,
/// so no two workers ever hold the same entry.
#[derive(Debug, Default)]
pub struct WorkQueue {
    queue: Mutex<VecDeque<WorkItem>>,
}

impl WorkQueue {
    /// Create a queue holding `items` in the given order.
    pub fn new(items: impl IntoIterator<Item = WorkItem>) -> Self {
        Self {
            queue: Mutex::new(items.into_iter().collect()),
        }
    }

    /// Take the next unclaimed item, if any.
    pub async fn claim(&self) -> Option<WorkItem> {
        let mut queue = self.queue.lock().await;
        queue.pop_front()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceKind;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn item(index: usize) -> WorkItem {
        WorkItem {
            index,
            course_ref: "c".into(),
            kind: SourceKind::Files,
            item_id: index.to_string(),
            target_path: PathBuf::from(format!("/t/{index}")),
            temp_path: PathBuf::from(format!("/t/{index}.part")),
        }
    }

    #[tokio::test]
    async fn claims_in_fifo_order() {
        let queue = WorkQueue::new((0..4).map(item));
        assert_eq!(queue.len().await, 4);
        for expected in 0..4 {
            assert_eq!(queue.claim().await.map(|w| w.index), Some(expected));
        }
        assert!(queue.claim().await.is_none());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_an_item() {
        let queue = Arc::new(WorkQueue::new((0..200).map(item)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(work) = queue.claim().await {
                    mine.push(work.index);
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for index in handle.await.unwrap() {
                assert!(seen.insert(index), "index {index} claimed twice");
            }
        }
        assert_eq!(seen.len(), 200);
    }
}
