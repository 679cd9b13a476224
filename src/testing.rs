//! Scripted [`ContentSource`] for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};

use crate::api::{ByteStream, ContentSource, RemoteError, RemoteItem};
use crate::models::SourceKind;

type Listing = Result<Vec<RemoteItem>, RemoteError>;

#[derive(Default)]
pub struct MockSource {
    listings: HashMap<(String, SourceKind), Listing>,
    bodies: HashMap<String, Vec<u8>>,
    failures: Mutex<HashMap<String, (usize, RemoteError)>>,
    broken_streams: HashSet<String>,
    hanging: HashSet<String>,
    delay: Option<Duration>,
    origin: Option<String>,
    list_calls: AtomicUsize,
    fetches: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(mut self, course: &str, kind: SourceKind, items: Vec<RemoteItem>) -> Self {
        self.listings.insert((course.to_string(), kind), Ok(items));
        self
    }

    pub fn with_list_error(mut self, course: &str, kind: SourceKind, error: RemoteError) -> Self {
        self.listings.insert((course.to_string(), kind), Err(error));
        self
    }

    pub fn with_body(mut self, remote_id: &str, body: &[u8]) -> Self {
        self.bodies.insert(remote_id.to_string(), body.to_vec());
        self
    }

    /// The next `times` fetches of `remote_id` fail with `error`.
    pub fn with_fetch_failures(self, remote_id: &str, times: usize, error: RemoteError) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(remote_id.to_string(), (times, error));
        self
    }

    /// The body stream yields one chunk and then errors.
    pub fn with_broken_stream(mut self, remote_id: &str) -> Self {
        self.broken_streams.insert(remote_id.to_string());
        self
    }

    /// The fetch never completes.
    pub fn with_hang(mut self, remote_id: &str) -> Self {
        self.hanging.insert(remote_id.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_string());
        self
    }

    pub fn body_of(&self, remote_id: &str) -> Vec<u8> {
        self.bodies
            .get(remote_id)
            .cloned()
            .unwrap_or_else(|| format!("content of {remote_id}").into_bytes())
    }

    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentSource for MockSource {
    async fn list_items(&self, course_ref: &str, kind: SourceKind) -> Listing {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.listings
            .get(&(course_ref.to_string(), kind))
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fetch_item(
        &self,
        _course_ref: &str,
        _kind: SourceKind,
        remote_id: &str,
    ) -> Result<ByteStream, RemoteError> {
        self.fetches.lock().unwrap().push(remote_id.to_string());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.hanging.contains(remote_id) {
            futures_util::future::pending::<()>().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some((remaining, error)) = failures.get_mut(remote_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(error.clone());
                }
            }
        }

        let body = self.body_of(remote_id);
        let mid = body.len() / 2;
        let first = Bytes::copy_from_slice(&body[..mid]);
        let second = Bytes::copy_from_slice(&body[mid..]);

        if self.broken_streams.contains(remote_id) {
            let chunks = vec![
                Ok(first),
                Err(RemoteError::Unavailable("connection reset".into())),
            ];
            return Ok(stream::iter(chunks).boxed());
        }
        Ok(stream::iter(vec![Ok(first), Ok(second)]).boxed())
    }

    fn origin(&self) -> Option<String> {
        self.origin.clone()
    }
}
