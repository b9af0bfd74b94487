//! Byte storage for upload payloads.
//!
//! Every backend stores one append-only object per upload id. Writes must
//! start exactly at the current object length, and a write that fails part
//! way leaves the object at its previous length.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::io;
use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Lazily produced payload bytes, used for both writes and reads.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("object `{0}` already exists")]
    AlreadyExists(String),
    #[error("object `{id}` has length {actual}, write requested at {expected}")]
    OffsetMismatch {
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("range {start}..{end} is outside object `{id}` of length {len}")]
    InvalidRange {
        id: String,
        start: u64,
        end: u64,
        len: u64,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage contract shared by every backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs and readiness output.
    fn name(&self) -> &'static str;

    /// Create an empty object for `id`.
    async fn create_object(&self, id: &str) -> StorageResult<()>;

    /// Append `data` at `offset`, which must equal the current length.
    ///
    /// Returns the new length. If `data` yields an error, the object is
    /// truncated back to `offset` and the error is returned.
    async fn write_at(&self, id: &str, offset: u64, data: ByteStream) -> StorageResult<u64>;

    /// Stream the bytes in `[start, end)`.
    async fn read_range(&self, id: &str, start: u64, end: u64) -> StorageResult<ByteStream>;

    async fn length(&self, id: &str) -> StorageResult<u64>;

    /// Shrink the object to `len` bytes. Growing is not allowed.
    async fn truncate(&self, id: &str, len: u64) -> StorageResult<()>;

    /// Remove the object. Missing objects are not an error.
    async fn delete(&self, id: &str) -> StorageResult<()>;

    /// Cheap round trip proving the backend is usable.
    async fn probe(&self) -> StorageResult<()>;
}

pub(crate) fn check_range(id: &str, start: u64, end: u64, len: u64) -> StorageResult<()> {
    if start > end || end > len {
        return Err(StorageError::InvalidRange {
            id: id.to_string(),
            start,
            end,
            len,
        });
    }
    Ok(())
}
