//! Local disk storage: one file per upload directly beneath `base_path`.
//!
//! A file's length always equals the upload's committed offset. Rollback is a
//! plain truncation, so checksum-protected writes can be retried at the same
//! offset.

use super::{Storage, StorageError, StorageResult};
use crate::services::stream::{ByteStream, ChunkStream};
use async_trait::async_trait;
use futures::StreamExt;
use std::{
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MAX_ID_LEN: usize = 128;

#[derive(Clone, Debug)]
pub struct LocalDiskStorage {
    /// Directory holding one file per upload.
    pub base_path: PathBuf,
}

impl LocalDiskStorage {
    /// Open storage rooted at `base_path`, creating the directory if needed.
    pub async fn open(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();
        match fs::metadata(&base_path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(StorageError::Io(std::io::Error::other(format!(
                    "upload path {} is not a directory",
                    base_path.display()
                ))));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&base_path).await?;
                debug!("created upload directory {}", base_path.display());
            }
            Err(err) => return Err(err.into()),
        }
        Ok(Self { base_path })
    }

    /// Reject ids that could escape `base_path`.
    fn ensure_id_safe(id: &str) -> StorageResult<()> {
        if id.is_empty()
            || id.len() > MAX_ID_LEN
            || !id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(StorageError::InvalidId(id.to_string()));
        }
        Ok(())
    }

    fn blob_path(&self, id: &str) -> StorageResult<PathBuf> {
        Self::ensure_id_safe(id)?;
        Ok(self.base_path.join(id))
    }

    async fn open_existing(&self, id: &str, path: &Path) -> StorageResult<File> {
        OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|err| not_found_or_io(id, err))
    }
}

fn not_found_or_io(id: &str, err: std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(id.to_string())
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl Storage for LocalDiskStorage {
    async fn create(&self, id: &str) -> StorageResult<()> {
        let path = self.blob_path(id)?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, id: &str, offset: u64, body: &mut ChunkStream<'_>) -> StorageResult<u64> {
        let path = self.blob_path(id)?;
        let mut file = self.open_existing(id, &path).await?;

        let len = file.metadata().await?.len();
        if offset > len {
            return Err(StorageError::OffsetOutOfRange {
                id: id.to_string(),
                offset,
                len,
            });
        }
        file.seek(SeekFrom::Start(offset)).await?;

        let mut written: u64 = 0;
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    debug!(
                        "body for upload {} interrupted after {} bytes: {}",
                        id, written, err
                    );
                    break;
                }
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        let end = offset + written;
        file.flush().await?;
        file.set_len(end).await?;
        file.sync_data().await?;
        Ok(end)
    }

    async fn rollback(&self, id: &str, offset: u64) -> StorageResult<()> {
        let path = self.blob_path(id)?;
        let file = self.open_existing(id, &path).await?;
        let len = file.metadata().await?.len();
        if offset < len {
            file.set_len(offset).await?;
            file.sync_data().await?;
            debug!("rolled back upload {} from {} to {} bytes", id, len, offset);
        }
        Ok(())
    }

    async fn read(&self, id: &str) -> StorageResult<ByteStream> {
        let path = self.blob_path(id)?;
        let file = File::open(&path)
            .await
            .map_err(|err| not_found_or_io(id, err))?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn remove(&self, ids: &[String]) -> StorageResult<()> {
        for id in ids {
            let path = self.blob_path(id)?;
            match fs::remove_file(&path).await {
                Ok(_) => debug!("removed blob {}", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("blob {} already missing", path.display());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }
        Ok(())
    }

    /// Write, read back and delete a scratch file under `base_path`.
    async fn probe(&self) -> StorageResult<()> {
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read_back = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read_back? != b"readyz" {
            return Err(StorageError::Io(std::io::Error::other(
                "probe file content mismatch",
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use std::io;
    use tempfile::TempDir;

    async fn storage() -> (TempDir, LocalDiskStorage) {
        let dir = TempDir::new().unwrap();
        let storage = LocalDiskStorage::open(dir.path().join("blobs")).await.unwrap();
        (dir, storage)
    }

    fn body(parts: Vec<io::Result<Bytes>>) -> ByteStream {
        stream::iter(parts).boxed()
    }

    async fn contents(storage: &LocalDiskStorage, id: &str) -> Vec<u8> {
        let mut out = Vec::new();
        let mut stream = storage.read(id).await.unwrap();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn create_is_exclusive() {
        let (_dir, storage) = storage().await;
        storage.create("abc").await.unwrap();
        assert!(matches!(
            storage.create("abc").await,
            Err(StorageError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn writes_sequentially_at_offset() {
        let (_dir, storage) = storage().await;
        storage.create("abc").await.unwrap();

        let mut first = body(vec![Ok(Bytes::from_static(b"hello "))]);
        assert_eq!(storage.write("abc", 0, &mut first).await.unwrap(), 6);
        let mut second = body(vec![Ok(Bytes::from_static(b"world"))]);
        assert_eq!(storage.write("abc", 6, &mut second).await.unwrap(), 11);

        assert_eq!(contents(&storage, "abc").await, b"hello world");
    }

    #[tokio::test]
    async fn interrupted_body_keeps_prefix() {
        let (_dir, storage) = storage().await;
        storage.create("abc").await.unwrap();

        let mut cut = body(vec![
            Ok(Bytes::from_static(b"12345")),
            Err(io::Error::new(io::ErrorKind::ConnectionAborted, "client left")),
            Ok(Bytes::from_static(b"never")),
        ]);
        assert_eq!(storage.write("abc", 0, &mut cut).await.unwrap(), 5);
        assert_eq!(contents(&storage, "abc").await, b"12345");
    }

    #[tokio::test]
    async fn rollback_truncates() {
        let (_dir, storage) = storage().await;
        storage.create("abc").await.unwrap();
        let mut data = body(vec![Ok(Bytes::from_static(b"abcdef"))]);
        storage.write("abc", 0, &mut data).await.unwrap();

        storage.rollback("abc", 2).await.unwrap();
        assert_eq!(contents(&storage, "abc").await, b"ab");
    }

    #[tokio::test]
    async fn rejects_offset_past_end() {
        let (_dir, storage) = storage().await;
        storage.create("abc").await.unwrap();
        let mut data = body(vec![Ok(Bytes::from_static(b"x"))]);
        assert!(matches!(
            storage.write("abc", 3, &mut data).await,
            Err(StorageError::OffsetOutOfRange { len: 0, .. })
        ));
    }

    #[tokio::test]
    async fn missing_and_unsafe_ids() {
        let (_dir, storage) = storage().await;
        let mut data = body(vec![]);
        assert!(matches!(
            storage.write("nope", 0, &mut data).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.create("../escape").await,
            Err(StorageError::InvalidId(_))
        ));
        storage.remove(&["nope".to_string()]).await.unwrap();
    }

    #[tokio::test]
    async fn probe_leaves_no_files() {
        let (_dir, storage) = storage().await;
        storage.probe().await.unwrap();
        let mut entries = fs::read_dir(&storage.base_path).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
