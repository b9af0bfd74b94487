//! Local filesystem backend.
//!
//! Payloads live under `base_path/{shard}/{shard}/{id}` where the shards are
//! the first two bytes of MD5(id), keeping directory fan-out small. Every
//! accepted chunk is fsynced before the new length is reported.

use super::{ByteStream, StorageBackend, StorageError, StorageResult, check_range};
use async_trait::async_trait;
use futures::StreamExt;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct FileStorage {
    /// Base directory on disk where upload payloads are stored.
    pub base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Generate two-level shard identifiers for an upload id.
    fn object_shards(id: &str) -> (String, String) {
        let digest = md5::compute(id);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Path of the payload file for `id`. Parent directories may not exist yet.
    pub fn object_path(&self, id: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(id);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(id);
        path
    }

    async fn open_existing(&self, id: &str, write: bool) -> StorageResult<File> {
        let path = self.object_path(id);
        OpenOptions::new()
            .read(true)
            .write(write)
            .open(&path)
            .await
            .map_err(|err| not_found_or_io(id, err))
    }

    /// Remove empty shard directories up to (not including) `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn create_object(&self, id: &str) -> StorageResult<()> {
        let path = self.object_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => {
                file.sync_all().await?;
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(id.to_string()))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn write_at(&self, id: &str, offset: u64, mut data: ByteStream) -> StorageResult<u64> {
        let mut file = self.open_existing(id, true).await?;
        let current = file.metadata().await?.len();
        if current != offset {
            return Err(StorageError::OffsetMismatch {
                id: id.to_string(),
                expected: offset,
                actual: current,
            });
        }
        file.seek(SeekFrom::Start(offset)).await?;

        let mut written: u64 = 0;
        let outcome: io::Result<()> = async {
            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await
        }
        .await;

        if let Err(err) = outcome {
            debug!(
                upload_id = %id,
                offset,
                written,
                "write failed, rolling object back: {}",
                err
            );
            // Roll back whatever reached the file before the failure.
            if let Err(rollback) = file.set_len(offset).await {
                tracing::error!(upload_id = %id, "rollback to {} failed: {}", offset, rollback);
            }
            let _ = file.sync_all().await;
            return Err(StorageError::Io(err));
        }

        Ok(offset + written)
    }

    async fn read_range(&self, id: &str, start: u64, end: u64) -> StorageResult<ByteStream> {
        let mut file = self.open_existing(id, false).await?;
        let len = file.metadata().await?.len();
        check_range(id, start, end, len)?;
        file.seek(SeekFrom::Start(start)).await?;
        Ok(ReaderStream::new(file.take(end - start)).boxed())
    }

    async fn length(&self, id: &str) -> StorageResult<u64> {
        let path = self.object_path(id);
        let meta = fs::metadata(&path)
            .await
            .map_err(|err| not_found_or_io(id, err))?;
        Ok(meta.len())
    }

    async fn truncate(&self, id: &str, len: u64) -> StorageResult<()> {
        let file = self.open_existing(id, true).await?;
        let current = file.metadata().await?.len();
        if len > current {
            return Err(StorageError::InvalidRange {
                id: id.to_string(),
                start: 0,
                end: len,
                len: current,
            });
        }
        file.set_len(len).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        let path = self.object_path(id);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed payload file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload file {} already missing", path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn probe(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read_back = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read_back? != b"readyz" {
            return Err(StorageError::Io(io::Error::new(
                ErrorKind::InvalidData,
                "probe file content mismatch",
            )));
        }
        Ok(())
    }
}

fn not_found_or_io(id: &str, err: io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(id.to_string())
    } else {
        StorageError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::test_support::{chunks, exercise_backend};
    use tempfile::TempDir;

    #[tokio::test]
    async fn satisfies_backend_contract() {
        let dir = TempDir::new().unwrap();
        exercise_backend(&FileStorage::new(dir.path())).await;
    }

    #[tokio::test]
    async fn payload_lands_in_sharded_path() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        let id = "ffeeddccbbaa99887766554433221100";

        storage.create_object(id).await.unwrap();
        storage.write_at(id, 0, chunks(&[b"abc"])).await.unwrap();

        let path = storage.object_path(id);
        assert!(path.starts_with(dir.path()));
        assert_eq!(path.components().count(), dir.path().components().count() + 3);
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn delete_prunes_empty_shards() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        let id = "0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f";

        storage.create_object(id).await.unwrap();
        let shard = storage.object_path(id).parent().unwrap().to_path_buf();
        storage.delete(id).await.unwrap();

        assert!(!shard.exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = "1234567890abcdef1234567890abcdef";
        {
            let storage = FileStorage::new(dir.path());
            storage.create_object(id).await.unwrap();
            storage.write_at(id, 0, chunks(&[b"persist"])).await.unwrap();
        }
        let reopened = FileStorage::new(dir.path());
        assert_eq!(reopened.length(id).await.unwrap(), 7);
    }
}
