pub mod api;
pub mod canvas;
pub mod config;
pub mod downloader;
pub mod engine;
pub mod enumerator;
pub mod integrity;
pub mod manager;
pub mod models;
pub mod paths;
pub mod queue;
pub mod resume;
pub mod state_manager;

#[cfg(test)]
mod testing;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::api::{ByteStream, ContentSource, RemoteError, RemoteItem};
    pub use crate::canvas::CanvasClient;
    pub use crate::engine::{Engine, EngineError, RunConfig};
    pub use crate::models::{EntryStatus, Manifest, ManifestEntry, SourceKind, StatusCounts};
}
