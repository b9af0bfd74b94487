//! In-process metadata store, paired with `MemoryStorage` for tests and
//! ephemeral runs.

use super::{MetadataError, MetadataResult, MetadataStore, new_upload_id};
use crate::models::upload::{NewUpload, Upload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryMetadataStore {
    uploads: RwLock<HashMap<String, Upload>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn collect_sorted<F>(&self, keep: F) -> Vec<Upload>
    where
        F: Fn(&Upload) -> bool,
    {
        let uploads = self.uploads.read().await;
        let mut matching: Vec<Upload> = uploads.values().filter(|u| keep(u)).cloned().collect();
        matching.sort_by_key(|u| u.updated_at);
        matching
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, new: NewUpload) -> MetadataResult<Upload> {
        let now = Utc::now();
        let upload = Upload {
            id: new_upload_id(),
            declared_length: new.declared_length,
            offset: 0,
            metadata: new.metadata,
            concat: new.concat,
            completion_notified: false,
            created_at: now,
            updated_at: now,
        };
        self.uploads
            .write()
            .await
            .insert(upload.id.clone(), upload.clone());
        Ok(upload)
    }

    async fn get(&self, id: &str) -> MetadataResult<Upload> {
        self.uploads
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(id.to_string()))
    }

    async fn advance_offset(&self, id: &str, new_offset: u64) -> MetadataResult<Upload> {
        let mut uploads = self.uploads.write().await;
        let upload = uploads
            .get_mut(id)
            .ok_or_else(|| MetadataError::NotFound(id.to_string()))?;
        let beyond_length = upload.declared_length.is_some_and(|len| new_offset > len);
        if new_offset < upload.offset || beyond_length {
            return Err(MetadataError::InvalidOffset {
                id: id.to_string(),
                current: upload.offset,
                requested: new_offset,
            });
        }
        upload.offset = new_offset;
        upload.updated_at = Utc::now();
        Ok(upload.clone())
    }

    async fn set_length(&self, id: &str, length: u64) -> MetadataResult<Upload> {
        let mut uploads = self.uploads.write().await;
        let upload = uploads
            .get_mut(id)
            .ok_or_else(|| MetadataError::NotFound(id.to_string()))?;
        if upload.declared_length.is_some() {
            return Err(MetadataError::AlreadySet(id.to_string()));
        }
        upload.declared_length = Some(length);
        upload.updated_at = Utc::now();
        Ok(upload.clone())
    }

    async fn mark_notified(&self, id: &str) -> MetadataResult<()> {
        let mut uploads = self.uploads.write().await;
        let upload = uploads
            .get_mut(id)
            .ok_or_else(|| MetadataError::NotFound(id.to_string()))?;
        upload.completion_notified = true;
        Ok(())
    }

    async fn delete(&self, id: &str) -> MetadataResult<bool> {
        Ok(self.uploads.write().await.remove(id).is_some())
    }

    async fn list_inactive(&self, before: DateTime<Utc>) -> MetadataResult<Vec<Upload>> {
        Ok(self.collect_sorted(|u| u.updated_at < before).await)
    }

    async fn list_pending_notifications(&self) -> MetadataResult<Vec<Upload>> {
        Ok(self
            .collect_sorted(|u| u.is_complete() && !u.completion_notified)
            .await)
    }

    async fn list_all(&self) -> MetadataResult<Vec<Upload>> {
        let mut all = self.collect_sorted(|_| true).await;
        all.sort_by_key(|u| u.created_at);
        Ok(all)
    }

    async fn ping(&self) -> MetadataResult<()> {
        Ok(())
    }
}
