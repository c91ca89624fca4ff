//! Upload bookkeeping: offsets, lengths, metadata and expiry.
//!
//! A tracker owns `UploadResource` records and nothing else. Every mutation
//! is atomic for a single id; there is no ordering across ids.

pub mod memory;
pub mod sqlite;

use crate::models::{UploadLength, UploadMetadata, UploadResource};
use async_trait::async_trait;
use thiserror::Error;

pub use memory::InMemoryUploadTracker;
pub use sqlite::SqliteUploadTracker;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("upload `{0}` not found")]
    NotFound(String),
    #[error("upload `{0}` already exists")]
    AlreadyExists(String),
    #[error("offset {offset} is not valid for upload `{id}`")]
    InvalidOffset { id: String, offset: u64 },
    #[error("length {length} cannot be declared for upload `{id}`")]
    InvalidLength { id: String, length: u64 },
    #[error("stored record for upload `{0}` is corrupt: {1}")]
    Corrupt(String, String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type TrackerResult<T> = Result<T, TrackerError>;

#[async_trait]
pub trait UploadTracker: Send + Sync + 'static {
    /// Start tracking a new upload at offset 0.
    async fn create(
        &self,
        id: &str,
        length: UploadLength,
        metadata: UploadMetadata,
    ) -> TrackerResult<UploadResource>;

    /// Record a new offset. Offsets never move backwards or past the length.
    async fn patch(&self, id: &str, offset: u64) -> TrackerResult<UploadResource>;

    /// Current state, or `None` if the id is not (or no longer) tracked.
    async fn head(&self, id: &str) -> TrackerResult<Option<UploadResource>>;

    /// Settle a deferred length. Fails if the length is already known.
    async fn update_length(&self, id: &str, length: u64) -> TrackerResult<UploadResource>;

    /// Ids whose expiry has passed. With `remove` set they are also dropped.
    async fn list_expired(&self, remove: bool) -> TrackerResult<Vec<String>>;

    /// Stop tracking the given ids. Unknown ids are ignored.
    async fn remove(&self, ids: &[String]) -> TrackerResult<()>;

    /// Whether `id` was tracked once and has since been removed.
    async fn was_removed(&self, _id: &str) -> TrackerResult<bool> {
        Ok(false)
    }

    /// Remember the full-payload checksum of an upload.
    async fn record_checksum(&self, _id: &str, _checksum: &str) -> TrackerResult<()> {
        Ok(())
    }

    /// Content-addressed lookup, for trackers that support deduplication.
    async fn find_by_checksum(&self, _checksum: &str) -> TrackerResult<Option<UploadResource>> {
        Ok(None)
    }

    /// Cheap readiness check.
    async fn ping(&self) -> TrackerResult<()> {
        Ok(())
    }
}
