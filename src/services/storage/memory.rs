//! In-process backend. Nothing survives a restart; used for tests and
//! throwaway deployments.

use super::{ByteStream, StorageBackend, StorageError, StorageResult, check_range};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, BytesMut>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_object(&self, id: &str) -> StorageResult<()> {
        let mut objects = self.objects.write().await;
        if objects.contains_key(id) {
            return Err(StorageError::AlreadyExists(id.to_string()));
        }
        objects.insert(id.to_string(), BytesMut::new());
        Ok(())
    }

    async fn write_at(&self, id: &str, offset: u64, mut data: ByteStream) -> StorageResult<u64> {
        {
            let objects = self.objects.read().await;
            let object = objects
                .get(id)
                .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
            if object.len() as u64 != offset {
                return Err(StorageError::OffsetMismatch {
                    id: id.to_string(),
                    expected: offset,
                    actual: object.len() as u64,
                });
            }
        }

        // Buffer the whole chunk first so a failing stream never touches the object.
        let mut staged = BytesMut::new();
        while let Some(chunk) = data.next().await {
            staged.extend_from_slice(&chunk?);
        }

        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if object.len() as u64 != offset {
            return Err(StorageError::OffsetMismatch {
                id: id.to_string(),
                expected: offset,
                actual: object.len() as u64,
            });
        }
        object.extend_from_slice(&staged);
        Ok(object.len() as u64)
    }

    async fn read_range(&self, id: &str, start: u64, end: u64) -> StorageResult<ByteStream> {
        let objects = self.objects.read().await;
        let object = objects
            .get(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        check_range(id, start, end, object.len() as u64)?;
        let bytes = Bytes::copy_from_slice(&object[start as usize..end as usize]);
        Ok(stream::once(async move { Ok(bytes) }).boxed())
    }

    async fn length(&self, id: &str) -> StorageResult<u64> {
        let objects = self.objects.read().await;
        objects
            .get(id)
            .map(|object| object.len() as u64)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn truncate(&self, id: &str, len: u64) -> StorageResult<()> {
        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        check_range(id, 0, len, object.len() as u64)?;
        object.truncate(len as usize);
        Ok(())
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        self.objects.write().await.remove(id);
        Ok(())
    }

    async fn probe(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::test_support::exercise_backend;

    #[tokio::test]
    async fn satisfies_backend_contract() {
        exercise_backend(&MemoryStorage::new()).await;
    }
}
