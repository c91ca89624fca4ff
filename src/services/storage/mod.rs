//! Byte storage for upload payloads.
//!
//! A backend knows nothing about the protocol: it keeps one blob per upload
//! id and supports offset writes, truncation, streaming reads and removal.

pub mod local_disk;

use crate::services::stream::{ByteStream, ChunkStream};
use async_trait::async_trait;
use std::io;
use thiserror::Error;

pub use local_disk::LocalDiskStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("blob `{0}` already exists")]
    AlreadyExists(String),
    #[error("invalid blob id `{0}`")]
    InvalidId(String),
    #[error("offset {offset} is past the end of blob `{id}` ({len} bytes)")]
    OffsetOutOfRange { id: String, offset: u64, len: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Backend trait for upload payload storage.
///
/// Implementations must be safe to share across request tasks. Callers
/// guarantee at most one concurrent `write` per id.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Allocate an empty blob. Fails if one already exists for `id`.
    async fn create(&self, id: &str) -> StorageResult<()>;

    /// Write `body` sequentially starting at `offset` and return the offset
    /// after the last durably written byte.
    ///
    /// An error from `body` is an interrupted transfer, not a failure: the
    /// bytes written before it are kept and their end offset is returned.
    async fn write(&self, id: &str, offset: u64, body: &mut ChunkStream<'_>) -> StorageResult<u64>;

    /// Cut the blob back to `offset` bytes.
    async fn rollback(&self, id: &str, offset: u64) -> StorageResult<()>;

    /// Stream the blob's current contents.
    async fn read(&self, id: &str) -> StorageResult<ByteStream>;

    /// Remove blobs. Missing ids are ignored.
    async fn remove(&self, ids: &[String]) -> StorageResult<()>;

    /// Cheap readiness check.
    async fn probe(&self) -> StorageResult<()> {
        Ok(())
    }
}
