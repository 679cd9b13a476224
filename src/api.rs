//! The contract the engine needs from a remote course API.
//!
//! The engine never talks HTTP itself; it lists and fetches through
//! [`ContentSource`]. [`crate::canvas::CanvasClient`] is the production
//! implementation.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::models::SourceKind;

/// A remote body, delivered chunk by chunk.
pub type ByteStream = BoxStream<'static, Result<Bytes, RemoteError>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("remote forbidden: {0}")]
    Forbidden(String),
    #[error("remote not found: {0}")]
    NotFound(String),
}

/// What the remote side says about one listable item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    pub remote_id: String,
    pub display_name: String,
    pub size: Option<u64>,
    /// False for items with nothing to download (a page without a body,
    /// a file without a download URL).
    pub has_content: bool,
}

impl RemoteItem {
    pub fn new(remote_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            display_name: display_name.into(),
            size: None,
            has_content: true,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn without_content(mut self) -> Self {
        self.has_content = false;
        self
    }
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Lists the items of one source kind for a course, in the API's own order.
    async fn list_items(
        &self,
        course_ref: &str,
        kind: SourceKind,
    ) -> Result<Vec<RemoteItem>, RemoteError>;

    /// Opens the body of one item.
    async fn fetch_item(
        &self,
        course_ref: &str,
        kind: SourceKind,
        remote_id: &str,
    ) -> Result<ByteStream, RemoteError>;

    /// Identifies the remote this source reads from. Recorded in manifests so
    /// a resume talks to the same instance.
    fn origin(&self) -> Option<String> {
        None
    }
}
