//! Per-upload descriptors: declared length, offset, metadata and
//! bookkeeping for completion delivery and expiry.
//!
//! The store is the single source of truth for an upload's offset. Offset
//! updates are read-modify-write atomic per id and never move backwards.

use crate::models::upload::{NewUpload, Upload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryMetadataStore;
pub use sqlite::SqliteMetadataStore;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("upload `{0}` not found")]
    NotFound(String),
    #[error("upload `{id}` cannot move offset from {current} to {requested}")]
    InvalidOffset {
        id: String,
        current: u64,
        requested: u64,
    },
    #[error("upload `{0}` already has a declared length")]
    AlreadySet(String),
    #[error("stored record for upload is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Generate a fresh upload id: a v4 UUID rendered as 32 lowercase hex chars.
pub fn new_upload_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Insert a new upload at offset 0 and return it with its generated id.
    async fn create(&self, new: NewUpload) -> MetadataResult<Upload>;

    async fn get(&self, id: &str) -> MetadataResult<Upload>;

    /// Move the offset forward to `new_offset`.
    ///
    /// Fails with `InvalidOffset` if `new_offset` is below the current offset
    /// or beyond the declared length.
    async fn advance_offset(&self, id: &str, new_offset: u64) -> MetadataResult<Upload>;

    /// Fix a deferred length. Fails with `AlreadySet` if one is recorded.
    async fn set_length(&self, id: &str, length: u64) -> MetadataResult<Upload>;

    /// Record that the completion sink acknowledged this upload.
    async fn mark_notified(&self, id: &str) -> MetadataResult<()>;

    /// Remove the record. Returns whether a record existed.
    async fn delete(&self, id: &str) -> MetadataResult<bool>;

    /// Uploads whose last mutation happened before `before`, oldest first.
    async fn list_inactive(&self, before: DateTime<Utc>) -> MetadataResult<Vec<Upload>>;

    /// Completed uploads the sink has not acknowledged yet.
    async fn list_pending_notifications(&self) -> MetadataResult<Vec<Upload>>;

    async fn list_all(&self) -> MetadataResult<Vec<Upload>>;

    async fn ping(&self) -> MetadataResult<()>;
}
