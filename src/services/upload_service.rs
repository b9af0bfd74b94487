//! src/services/upload_service.rs
//!
//! UploadService: the resumable upload state machine. It validates every
//! request against the metadata store, moves bytes through the storage
//! backend and keeps the two consistent: the stored byte length of an upload
//! always equals its recorded offset.
//!
//! States: `Created → Receiving → Completed`; a terminated upload is gone.

use crate::{
    errors::{UploadError, UploadResult},
    models::{
        metadata::UploadMetadata,
        upload::{Concat, NewUpload, Upload},
    },
    services::{
        coordinator::TransferCoordinator,
        hooks::{CreationHook, CreationRequest, RequestedLength, passthrough_hook},
        metadata_store::{MetadataError, MetadataStore},
        storage::{ByteStream, StorageBackend, StorageError},
    },
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::{io, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Marker carried inside the io error that stops an oversized payload.
#[derive(Debug, Error)]
#[error("payload exceeds the {limit} bytes still accepted")]
struct PayloadTooLarge {
    limit: u64,
}

/// Outcome of the startup consistency pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub checked: usize,
    /// Objects cut back to the recorded offset.
    pub truncated: usize,
    /// Objects shorter than the recorded offset, or missing.
    pub inconsistent: usize,
}

#[derive(Clone)]
pub struct UploadService {
    pub storage: Arc<dyn StorageBackend>,
    pub store: Arc<dyn MetadataStore>,
    pub coordinator: Arc<TransferCoordinator>,
    creation_hook: CreationHook,
    max_size: Option<u64>,
    retention: Option<Duration>,
}

impl UploadService {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        store: Arc<dyn MetadataStore>,
        coordinator: Arc<TransferCoordinator>,
    ) -> Self {
        Self {
            storage,
            store,
            coordinator,
            creation_hook: passthrough_hook(),
            max_size: None,
            retention: None,
        }
    }

    pub fn with_creation_hook(mut self, hook: CreationHook) -> Self {
        self.creation_hook = hook;
        self
    }

    /// Largest declared length accepted at creation.
    pub fn with_max_size(mut self, max_size: Option<u64>) -> Self {
        self.max_size = max_size;
        self
    }

    /// Inactivity window after which the reaper removes an upload.
    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    pub fn max_size(&self) -> Option<u64> {
        self.max_size
    }

    /// When `upload` becomes eligible for expiry, if expiry is enabled.
    pub fn expires_at(&self, upload: &Upload) -> Option<DateTime<Utc>> {
        let retention = chrono::Duration::from_std(self.retention?).ok()?;
        Some(upload.updated_at + retention)
    }

    fn check_length(&self, length: i64) -> UploadResult<u64> {
        if length < 0 {
            return Err(UploadError::InvalidLength(format!(
                "length must not be negative, got {}",
                length
            )));
        }
        let length = length as u64;
        if let Some(limit) = self.max_size {
            if length > limit {
                return Err(UploadError::LengthExceeded { limit });
            }
        }
        Ok(length)
    }

    /// Create an upload. Final concatenations are assembled right away.
    pub async fn create(&self, request: CreationRequest) -> UploadResult<Upload> {
        if let Concat::Final(parts) = &request.concat {
            let metadata = (self.creation_hook)(&request);
            return self.concatenate(parts.clone(), metadata).await;
        }

        let declared_length = match request.length {
            RequestedLength::Declared(length) => Some(self.check_length(length)?),
            RequestedLength::Deferred => None,
        };
        let metadata = (self.creation_hook)(&request);

        let upload = self
            .create_record(NewUpload {
                declared_length,
                metadata,
                concat: request.concat.clone(),
            })
            .await?;

        info!(
            upload_id = %upload.id,
            declared_length = ?upload.declared_length,
            concat = upload.concat.kind(),
            "created upload"
        );

        if upload.is_complete() {
            self.coordinator
                .notify_completed(self.store.as_ref(), &upload)
                .await;
        }
        Ok(upload)
    }

    /// Insert the metadata row and its empty payload object together.
    async fn create_record(&self, new: NewUpload) -> UploadResult<Upload> {
        let upload = self.store.create(new).await?;
        if let Err(err) = self.storage.create_object(&upload.id).await {
            if let Err(cleanup) = self.store.delete(&upload.id).await {
                error!(upload_id = %upload.id, "could not remove orphaned record: {}", cleanup);
            }
            return Err(UploadError::StorageUnavailable(err.to_string()));
        }
        Ok(upload)
    }

    /// Current state of an upload; no side effects.
    pub async fn head(&self, id: &str) -> UploadResult<Upload> {
        Ok(self.store.get(id).await?)
    }

    /// Append one chunk at `expected_offset`.
    ///
    /// `content_length`, when known, lets an oversized chunk be refused
    /// before any byte is read. Either the whole chunk is accepted and the
    /// offset advanced, or nothing changes.
    pub async fn append(
        &self,
        id: &str,
        expected_offset: u64,
        payload: ByteStream,
        content_length: Option<u64>,
    ) -> UploadResult<Upload> {
        self.append_declaring(id, expected_offset, None, payload, content_length)
            .await
    }

    /// Like [`append`](Self::append), additionally fixing the length of a
    /// deferred upload. The length is only recorded when the chunk is
    /// accepted, so a rejected request can be retried unchanged.
    pub async fn append_declaring(
        &self,
        id: &str,
        expected_offset: u64,
        declare_length: Option<i64>,
        payload: ByteStream,
        content_length: Option<u64>,
    ) -> UploadResult<Upload> {
        let declare_length = declare_length
            .map(|length| self.check_length(length))
            .transpose()?;
        let _lock = self.coordinator.lock(id).await;

        let upload = self.store.get(id).await?;
        if matches!(upload.concat, Concat::Final(_)) {
            return Err(UploadError::Forbidden(
                "final concatenated uploads cannot be modified".into(),
            ));
        }
        if expected_offset != upload.offset {
            return Err(UploadError::OffsetMismatch {
                id: id.to_string(),
                expected: expected_offset,
                actual: upload.offset,
            });
        }
        if let Some(length) = declare_length {
            if upload.declared_length.is_some() {
                return Err(UploadError::AlreadySet(id.to_string()));
            }
            if length < upload.offset {
                return Err(UploadError::InvalidLength(format!(
                    "length {} is below the {} bytes already received",
                    length, upload.offset
                )));
            }
        }

        let limit = match declare_length {
            Some(length) => Some(length - upload.offset),
            None => upload
                .remaining()
                .or_else(|| self.max_size.map(|max| max.saturating_sub(upload.offset))),
        };
        if let (Some(limit), Some(incoming)) = (limit, content_length) {
            if incoming > limit {
                return Err(UploadError::LengthExceeded { limit });
            }
        }
        let payload = match limit {
            Some(limit) => limit_payload(payload, limit),
            None => payload,
        };

        self.discard_unacknowledged_tail(&upload).await?;

        let new_length = match self.storage.write_at(id, upload.offset, payload).await {
            Ok(length) => length,
            Err(StorageError::Io(err)) => {
                if let Some(too_large) = payload_too_large(&err) {
                    return Err(UploadError::LengthExceeded {
                        limit: too_large.limit,
                    });
                }
                return Err(UploadError::StorageUnavailable(err.to_string()));
            }
            Err(StorageError::NotFound(_)) => return Err(UploadError::Terminated(id.to_string())),
            Err(other) => return Err(other.into()),
        };

        let mut updated = match self.store.advance_offset(id, new_length).await {
            Ok(updated) => updated,
            Err(MetadataError::NotFound(_)) => {
                // Terminated mid-write; make sure no bytes outlive the record.
                if let Err(cleanup) = self.storage.delete(id).await {
                    error!(upload_id = %id, "could not remove bytes of terminated upload: {}", cleanup);
                }
                return Err(UploadError::Terminated(id.to_string()));
            }
            Err(err) => {
                if let Err(rollback) = self.storage.truncate(id, upload.offset).await {
                    error!(
                        upload_id = %id,
                        "offset advance failed and rollback to {} failed: {}",
                        upload.offset,
                        rollback
                    );
                }
                return Err(err.into());
            }
        };
        if let Some(length) = declare_length {
            updated = self.store.set_length(id, length).await?;
            info!(upload_id = %id, length, "declared deferred length");
        }

        debug!(
            upload_id = %id,
            from = upload.offset,
            to = updated.offset,
            "appended chunk"
        );

        if updated.is_complete() && !upload.is_complete() {
            info!(upload_id = %id, length = updated.offset, "upload completed");
            self.coordinator
                .notify_completed(self.store.as_ref(), &updated)
                .await;
        }
        Ok(updated)
    }

    /// Cut bytes left past the recorded offset by an append that never
    /// finished, e.g. one whose task was dropped mid-write.
    async fn discard_unacknowledged_tail(&self, upload: &Upload) -> UploadResult<()> {
        let stored = match self.storage.length(&upload.id).await {
            Ok(stored) => stored,
            Err(StorageError::NotFound(_)) => return Err(UploadError::Terminated(upload.id.clone())),
            Err(err) => return Err(err.into()),
        };
        if stored > upload.offset {
            warn!(
                upload_id = %upload.id,
                stored,
                offset = upload.offset,
                "discarding bytes of an unfinished append"
            );
            self.storage.truncate(&upload.id, upload.offset).await?;
        }
        Ok(())
    }

    /// Fix the length of a deferred upload. Allowed exactly once.
    pub async fn set_deferred_length(&self, id: &str, length: i64) -> UploadResult<Upload> {
        let length = self.check_length(length)?;
        let _lock = self.coordinator.lock(id).await;

        let upload = self.store.get(id).await?;
        if upload.declared_length.is_some() {
            return Err(UploadError::AlreadySet(id.to_string()));
        }
        if length < upload.offset {
            return Err(UploadError::InvalidLength(format!(
                "length {} is below the {} bytes already received",
                length, upload.offset
            )));
        }

        let updated = self.store.set_length(id, length).await?;
        info!(upload_id = %id, length, "declared deferred length");
        if updated.is_complete() {
            self.coordinator
                .notify_completed(self.store.as_ref(), &updated)
                .await;
        }
        Ok(updated)
    }

    /// Remove an upload's record and bytes. A second call reports `NotFound`.
    ///
    /// Bytes are removed before the record; a failed storage delete leaves
    /// the upload in place.
    pub async fn terminate(&self, id: &str) -> UploadResult<()> {
        self.store.get(id).await?;
        self.storage.delete(id).await?;
        if !self.store.delete(id).await? {
            return Err(UploadError::NotFound(id.to_string()));
        }
        info!(upload_id = %id, "terminated upload");
        Ok(())
    }

    /// Stream accepted bytes in `[start, end)`; `end` defaults to the offset.
    pub async fn read(
        &self,
        id: &str,
        start: u64,
        end: Option<u64>,
    ) -> UploadResult<(Upload, ByteStream)> {
        let upload = self.store.get(id).await?;
        let end = end.unwrap_or(upload.offset).min(upload.offset);
        if start > end {
            return Err(UploadError::InvalidLength(format!(
                "range starts at {} beyond the {} bytes available",
                start, end
            )));
        }
        let stream = self.storage.read_range(id, start, end).await?;
        Ok((upload, stream))
    }

    /// Build a final upload from completed partial uploads, in order.
    pub async fn concatenate(
        &self,
        parts: Vec<String>,
        metadata: UploadMetadata,
    ) -> UploadResult<Upload> {
        if parts.is_empty() {
            return Err(UploadError::InvalidConcat(
                "final upload needs at least one partial upload".into(),
            ));
        }

        let mut sources = Vec::with_capacity(parts.len());
        for part in &parts {
            let upload = match self.store.get(part).await {
                Ok(upload) => upload,
                Err(MetadataError::NotFound(_)) => {
                    return Err(UploadError::InvalidConcat(format!(
                        "partial upload `{}` does not exist",
                        part
                    )));
                }
                Err(err) => return Err(err.into()),
            };
            if upload.concat != Concat::Partial {
                return Err(UploadError::InvalidConcat(format!(
                    "upload `{}` is not a partial upload",
                    part
                )));
            }
            if !upload.is_complete() {
                return Err(UploadError::InvalidConcat(format!(
                    "partial upload `{}` is not complete",
                    part
                )));
            }
            sources.push(upload);
        }

        let total: u64 = sources.iter().map(|u| u.offset).sum();
        if let Some(limit) = self.max_size {
            if total > limit {
                return Err(UploadError::LengthExceeded { limit });
            }
        }

        let target = self
            .create_record(NewUpload {
                declared_length: Some(total),
                metadata,
                concat: Concat::Final(parts),
            })
            .await?;

        let assembled = self.copy_parts(&target.id, &sources).await;
        let length = match assembled {
            Ok(length) => length,
            Err(err) => {
                if let Err(cleanup) = self.storage.delete(&target.id).await {
                    error!(upload_id = %target.id, "could not remove partial final object: {}", cleanup);
                }
                if let Err(cleanup) = self.store.delete(&target.id).await {
                    error!(upload_id = %target.id, "could not remove failed final record: {}", cleanup);
                }
                return Err(err);
            }
        };

        let upload = self.store.advance_offset(&target.id, length).await?;
        info!(
            upload_id = %upload.id,
            parts = sources.len(),
            length,
            "assembled final upload"
        );
        self.coordinator
            .notify_completed(self.store.as_ref(), &upload)
            .await;
        Ok(upload)
    }

    async fn copy_parts(&self, target: &str, sources: &[Upload]) -> UploadResult<u64> {
        let mut offset = 0;
        for source in sources {
            let stream = self.storage.read_range(&source.id, 0, source.offset).await?;
            offset = self.storage.write_at(target, offset, stream).await?;
        }
        Ok(offset)
    }

    /// Terminate uploads idle for longer than `retention`.
    ///
    /// Completed uploads are only removed when `include_completed` is set
    /// and their completion event has been delivered.
    pub async fn reap_expired(
        &self,
        retention: Duration,
        include_completed: bool,
    ) -> UploadResult<usize> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|err| UploadError::InvalidLength(format!("retention out of range: {}", err)))?;
        let cutoff = Utc::now() - retention;

        let mut removed = 0;
        for upload in self.store.list_inactive(cutoff).await? {
            let eligible = if upload.is_complete() {
                include_completed && upload.completion_notified
            } else {
                true
            };
            if !eligible {
                continue;
            }
            match self.terminate(&upload.id).await {
                Ok(()) => removed += 1,
                Err(UploadError::NotFound(_)) => {}
                Err(err) => warn!(upload_id = %upload.id, "could not reap upload: {}", err),
            }
        }
        Ok(removed)
    }

    pub async fn redeliver_pending(&self) -> usize {
        self.coordinator
            .redeliver_pending(self.store.as_ref())
            .await
    }

    /// Reconcile stored byte lengths with recorded offsets after a restart.
    ///
    /// A crash between a storage write and the offset advance leaves extra
    /// bytes behind; those are cut back. Shorter or missing objects cannot
    /// be repaired and are reported.
    pub async fn recover(&self) -> UploadResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for upload in self.store.list_all().await? {
            report.checked += 1;
            match self.storage.length(&upload.id).await {
                Ok(length) if length == upload.offset => {}
                Ok(length) if length > upload.offset => {
                    warn!(
                        upload_id = %upload.id,
                        stored = length,
                        offset = upload.offset,
                        "dropping bytes beyond recorded offset"
                    );
                    self.storage.truncate(&upload.id, upload.offset).await?;
                    report.truncated += 1;
                }
                Ok(length) => {
                    error!(
                        upload_id = %upload.id,
                        stored = length,
                        offset = upload.offset,
                        "stored object is shorter than recorded offset"
                    );
                    report.inconsistent += 1;
                }
                Err(StorageError::NotFound(_)) => {
                    error!(upload_id = %upload.id, "stored object is missing");
                    report.inconsistent += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(report)
    }
}

fn limit_payload(payload: ByteStream, limit: u64) -> ByteStream {
    let mut seen: u64 = 0;
    payload
        .map(move |chunk| {
            let chunk = chunk?;
            seen += chunk.len() as u64;
            if seen > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    PayloadTooLarge { limit },
                ));
            }
            Ok(chunk)
        })
        .boxed()
}

fn payload_too_large(err: &io::Error) -> Option<&PayloadTooLarge> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<PayloadTooLarge>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        hooks::filename_header_hook,
        metadata_store::MemoryMetadataStore,
        notify::{ChannelCompletionSink, CompletionEvent},
        storage::{
            FileStorage, MemoryStorage, StorageResult,
            test_support::{broken, chunks, collect},
        },
    };
    use bytes::Bytes;
    use futures::stream;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        service: UploadService,
        events: mpsc::Receiver<CompletionEvent>,
    }

    fn harness_on(storage: Arc<dyn StorageBackend>) -> Harness {
        let (sink, events) = ChannelCompletionSink::channel(16);
        let service = UploadService::new(
            storage,
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(TransferCoordinator::new(Arc::new(sink))),
        );
        Harness { service, events }
    }

    fn harness() -> Harness {
        harness_on(Arc::new(MemoryStorage::new()))
    }

    /// One harness per storage backend; file payloads live in `dir`.
    fn harnesses(dir: &TempDir) -> [Harness; 2] {
        [harness(), harness_on(Arc::new(FileStorage::new(dir.path())))]
    }

    fn declared(length: i64) -> CreationRequest {
        CreationRequest::new(RequestedLength::Declared(length), UploadMetadata::new())
    }

    fn body(data: &[u8]) -> ByteStream {
        let data = Bytes::copy_from_slice(data);
        stream::once(async move { Ok(data) }).boxed()
    }

    #[tokio::test]
    async fn single_append_completes_and_notifies_once() {
        let mut h = harness();
        let mut req = declared(24);
        req.metadata.insert("filename", "test.txt");
        let upload = h.service.create(req).await.unwrap();
        assert_eq!(upload.state(), crate::models::upload::UploadState::Created);

        let done = h
            .service
            .append(&upload.id, 0, body(b"abcdefghijklmnopqrstuvwx"), Some(24))
            .await
            .unwrap();
        assert_eq!(done.offset, 24);
        assert_eq!(done.state(), crate::models::upload::UploadState::Completed);

        let event = h.events.recv().await.unwrap();
        assert_eq!(event.id, upload.id);
        assert_eq!(event.length, 24);
        assert_eq!(event.metadata.get("filename"), Some("test.txt"));

        // An empty append at the end neither fails nor re-notifies.
        h.service.append(&upload.id, 24, body(b""), Some(0)).await.unwrap();
        assert!(h.events.try_recv().is_err());
        assert!(h.service.head(&upload.id).await.unwrap().completion_notified);
    }

    #[tokio::test]
    async fn wrong_offset_is_rejected_without_side_effects() {
        let dir = TempDir::new().unwrap();
        for h in harnesses(&dir) {
            let upload = h.service.create(declared(24)).await.unwrap();
            let after = h
                .service
                .append(&upload.id, 0, body(b"0123456789"), None)
                .await
                .unwrap();
            assert_eq!(after.offset, 10);

            let err = h
                .service
                .append(&upload.id, 5, body(b"0123456789"), None)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                UploadError::OffsetMismatch {
                    expected: 5,
                    actual: 10,
                    ..
                }
            ));
            assert_eq!(h.service.head(&upload.id).await.unwrap().offset, 10);
            assert_eq!(h.service.storage.length(&upload.id).await.unwrap(), 10);
        }
    }

    #[tokio::test]
    async fn sequential_appends_keep_storage_and_offset_equal() {
        let dir = TempDir::new().unwrap();
        for h in harnesses(&dir) {
            let upload = h.service.create(declared(9)).await.unwrap();
            let mut offset = 0;
            for part in [&b"abc"[..], b"de", b"", b"fghi"] {
                offset = h
                    .service
                    .append(&upload.id, offset, body(part), None)
                    .await
                    .unwrap()
                    .offset;
                assert_eq!(h.service.storage.length(&upload.id).await.unwrap(), offset);
            }
            assert_eq!(offset, 9);
            let (_, stream) = h.service.read(&upload.id, 0, None).await.unwrap();
            assert_eq!(collect(stream).await, b"abcdefghi");
        }
    }

    #[tokio::test]
    async fn overflow_is_rejected_with_or_without_length_hint() {
        let dir = TempDir::new().unwrap();
        for h in harnesses(&dir) {
            let upload = h.service.create(declared(4)).await.unwrap();

            let err = h
                .service
                .append(&upload.id, 0, body(b"12345"), Some(5))
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::LengthExceeded { limit: 4 }));

            let err = h
                .service
                .append(&upload.id, 0, chunks(&[b"123", b"45"]), None)
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::LengthExceeded { limit: 4 }));
            assert_eq!(h.service.head(&upload.id).await.unwrap().offset, 0);
            assert_eq!(h.service.storage.length(&upload.id).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn interrupted_chunk_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        for h in harnesses(&dir) {
            let upload = h.service.create(declared(10)).await.unwrap();
            h.service.append(&upload.id, 0, body(b"ab"), None).await.unwrap();

            let err = h
                .service
                .append(&upload.id, 2, broken(b"cd"), None)
                .await
                .unwrap_err();
            assert!(err.is_transient());
            assert_eq!(h.service.head(&upload.id).await.unwrap().offset, 2);
            assert_eq!(h.service.storage.length(&upload.id).await.unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn abandoned_append_does_not_block_resume() {
        let dir = TempDir::new().unwrap();
        let h = harness_on(Arc::new(FileStorage::new(dir.path())));
        let upload = h.service.create(declared(10)).await.unwrap();

        let stalled = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"abcd"))])
            .chain(stream::pending())
            .boxed();
        let task = {
            let service = h.service.clone();
            let id = upload.id.clone();
            tokio::spawn(async move { service.append(&id, 0, stalled, None).await })
        };
        for _ in 0..200 {
            if h.service.storage.length(&upload.id).await.unwrap() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.service.storage.length(&upload.id).await.unwrap(), 4);
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        // The client resumes from the offset HEAD reports.
        assert_eq!(h.service.head(&upload.id).await.unwrap().offset, 0);
        let done = h
            .service
            .append(&upload.id, 0, body(b"0123456789"), Some(10))
            .await
            .unwrap();
        assert_eq!(done.offset, 10);
        let (_, stream) = h.service.read(&upload.id, 0, None).await.unwrap();
        assert_eq!(collect(stream).await, b"0123456789");
    }

    #[tokio::test]
    async fn length_sent_with_rejected_chunk_is_not_recorded() {
        let mut h = harness();
        let upload = h
            .service
            .create(CreationRequest::new(
                RequestedLength::Deferred,
                UploadMetadata::new(),
            ))
            .await
            .unwrap();
        h.service
            .append(&upload.id, 0, body(b"0123456789"), None)
            .await
            .unwrap();

        let err = h
            .service
            .append_declaring(&upload.id, 5, Some(20), body(b"56789"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::OffsetMismatch { actual: 10, .. }));

        let err = h
            .service
            .append_declaring(&upload.id, 10, Some(12), body(b"abcde"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::LengthExceeded { limit: 2 }));
        assert_eq!(h.service.head(&upload.id).await.unwrap().declared_length, None);

        let done = h
            .service
            .append_declaring(&upload.id, 10, Some(20), body(b"abcdefghij"), None)
            .await
            .unwrap();
        assert_eq!(done.declared_length, Some(20));
        assert!(done.is_complete());
        assert_eq!(h.events.recv().await.unwrap().length, 20);

        assert!(matches!(
            h.service
                .append_declaring(&upload.id, 20, Some(20), body(b""), None)
                .await,
            Err(UploadError::AlreadySet(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_appends_are_serialized() {
        let h = harness();
        let upload = h.service.create(declared(8)).await.unwrap();

        let a = {
            let service = h.service.clone();
            let id = upload.id.clone();
            tokio::spawn(async move { service.append(&id, 0, body(b"aaaa"), None).await })
        };
        let b = {
            let service = h.service.clone();
            let id = upload.id.clone();
            tokio::spawn(async move { service.append(&id, 0, body(b"bbbb"), None).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1);
        let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(matches!(
            loser,
            UploadError::OffsetMismatch { actual: 4, .. }
        ));
        assert_eq!(h.service.head(&upload.id).await.unwrap().offset, 4);
        assert_eq!(h.service.coordinator.active_locks(), 0);
    }

    #[tokio::test]
    async fn deferred_length_can_be_set_once() {
        let mut h = harness();
        let upload = h
            .service
            .create(CreationRequest::new(
                RequestedLength::Deferred,
                UploadMetadata::new(),
            ))
            .await
            .unwrap();
        h.service.append(&upload.id, 0, body(b"hello"), None).await.unwrap();

        assert!(matches!(
            h.service.set_deferred_length(&upload.id, 3).await,
            Err(UploadError::InvalidLength(_))
        ));
        let fixed = h.service.set_deferred_length(&upload.id, 5).await.unwrap();
        assert!(fixed.is_complete());
        assert_eq!(h.events.recv().await.unwrap().length, 5);

        assert!(matches!(
            h.service.set_deferred_length(&upload.id, 5).await,
            Err(UploadError::AlreadySet(_))
        ));
    }

    #[tokio::test]
    async fn invalid_lengths_are_rejected() {
        let h = harness();
        assert!(matches!(
            h.service.create(declared(-1)).await,
            Err(UploadError::InvalidLength(_))
        ));

        let limited = h.service.clone().with_max_size(Some(10));
        assert!(matches!(
            limited.create(declared(11)).await,
            Err(UploadError::LengthExceeded { limit: 10 })
        ));
        assert!(h.service.store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_length_upload_completes_on_create() {
        let mut h = harness();
        let upload = h.service.create(declared(0)).await.unwrap();
        assert!(upload.is_complete());
        assert_eq!(h.events.recv().await.unwrap().id, upload.id);
    }

    #[tokio::test]
    async fn terminate_then_everything_is_not_found() {
        let h = harness();
        let upload = h.service.create(declared(4)).await.unwrap();
        h.service.terminate(&upload.id).await.unwrap();

        assert!(matches!(
            h.service.terminate(&upload.id).await,
            Err(UploadError::NotFound(_))
        ));
        assert!(matches!(
            h.service.head(&upload.id).await,
            Err(UploadError::NotFound(_))
        ));
        assert!(matches!(
            h.service.append(&upload.id, 0, body(b"x"), None).await,
            Err(UploadError::NotFound(_))
        ));
        assert!(matches!(
            h.service.set_deferred_length(&upload.id, 4).await,
            Err(UploadError::NotFound(_))
        ));
        assert!(matches!(
            h.service.storage.length(&upload.id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn creation_hook_shapes_metadata() {
        let h = harness();
        let service = h.service.clone().with_creation_hook(filename_header_hook());
        let mut req = declared(1);
        req.headers
            .insert("filename", axum::http::HeaderValue::from_static("a.txt"));
        let upload = service.create(req).await.unwrap();
        assert_eq!(upload.metadata.get("filename"), Some("a.txt"));
    }

    #[tokio::test]
    async fn partial_uploads_concatenate_in_order() {
        let mut h = harness();
        let mut partial = declared(3);
        partial.concat = Concat::Partial;
        let first = h.service.create(partial.clone()).await.unwrap();
        let second = h.service.create(partial).await.unwrap();

        let mut final_req = declared(0);
        final_req.concat = Concat::Final(vec![first.id.clone(), second.id.clone()]);
        assert!(matches!(
            h.service.create(final_req.clone()).await,
            Err(UploadError::InvalidConcat(_))
        ));

        h.service.append(&second.id, 0, body(b"def"), None).await.unwrap();
        h.service.append(&first.id, 0, body(b"abc"), None).await.unwrap();
        h.events.recv().await.unwrap();
        h.events.recv().await.unwrap();

        let assembled = h.service.create(final_req).await.unwrap();
        assert_eq!(assembled.offset, 6);
        assert!(assembled.is_complete());
        assert_eq!(h.events.recv().await.unwrap().id, assembled.id);

        let (_, stream) = h.service.read(&assembled.id, 0, None).await.unwrap();
        assert_eq!(collect(stream).await, b"abcdef");
        assert!(matches!(
            h.service.append(&assembled.id, 6, body(b""), None).await,
            Err(UploadError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn failed_assembly_leaves_no_final_upload() {
        let h = harness();
        let mut partial = declared(3);
        partial.concat = Concat::Partial;
        let part = h.service.create(partial).await.unwrap();
        h.service.append(&part.id, 0, body(b"abc"), None).await.unwrap();
        // Lose the partial's bytes behind the store's back.
        h.service.storage.truncate(&part.id, 1).await.unwrap();

        let mut final_req = declared(0);
        final_req.concat = Concat::Final(vec![part.id.clone()]);
        assert!(h.service.create(final_req).await.is_err());

        let remaining = h.service.store.list_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, part.id);
    }

    #[tokio::test]
    async fn terminate_removes_bytes_and_record() {
        let dir = TempDir::new().unwrap();
        for h in harnesses(&dir) {
            let upload = h.service.create(declared(4)).await.unwrap();
            h.service.append(&upload.id, 0, body(b"ab"), None).await.unwrap();
            h.service.terminate(&upload.id).await.unwrap();

            assert!(h.service.store.list_all().await.unwrap().is_empty());
            assert!(matches!(
                h.service.storage.length(&upload.id).await,
                Err(StorageError::NotFound(_))
            ));
        }
    }

    /// Memory storage whose deletes always fail.
    struct StuckStorage(MemoryStorage);

    #[async_trait::async_trait]
    impl StorageBackend for StuckStorage {
        fn name(&self) -> &'static str {
            "stuck"
        }
        async fn create_object(&self, id: &str) -> StorageResult<()> {
            self.0.create_object(id).await
        }
        async fn write_at(
            &self,
            id: &str,
            offset: u64,
            data: ByteStream,
        ) -> StorageResult<u64> {
            self.0.write_at(id, offset, data).await
        }
        async fn read_range(
            &self,
            id: &str,
            start: u64,
            end: u64,
        ) -> StorageResult<ByteStream> {
            self.0.read_range(id, start, end).await
        }
        async fn length(&self, id: &str) -> StorageResult<u64> {
            self.0.length(id).await
        }
        async fn truncate(&self, id: &str, len: u64) -> StorageResult<()> {
            self.0.truncate(id, len).await
        }
        async fn delete(&self, _id: &str) -> StorageResult<()> {
            Err(StorageError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "read-only volume",
            )))
        }
        async fn probe(&self) -> StorageResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_byte_removal_keeps_the_record() {
        let h = harness_on(Arc::new(StuckStorage(MemoryStorage::new())));
        let upload = h.service.create(declared(4)).await.unwrap();
        h.service.append(&upload.id, 0, body(b"ab"), None).await.unwrap();

        assert!(h.service.terminate(&upload.id).await.is_err());
        let kept = h.service.head(&upload.id).await.unwrap();
        assert_eq!(kept.offset, 2);
        assert_eq!(h.service.recover().await.unwrap().checked, 1);
    }

    #[tokio::test]
    async fn reaper_removes_only_stale_incomplete_uploads() {
        let h = harness();
        let stale = h.service.create(declared(10)).await.unwrap();
        let done = h.service.create(declared(0)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let fresh = h.service.create(declared(10)).await.unwrap();

        let removed = h
            .service
            .reap_expired(Duration::from_millis(150), false)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(h.service.head(&stale.id).await.is_err());
        assert!(h.service.head(&done.id).await.is_ok());
        assert!(h.service.head(&fresh.id).await.is_ok());

        let removed = h
            .service
            .reap_expired(Duration::from_millis(150), true)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(h.service.head(&done.id).await.is_err());
    }

    #[tokio::test]
    async fn recovery_truncates_unacknowledged_bytes() {
        let dir = TempDir::new().unwrap();
        for h in harnesses(&dir) {
            let upload = h.service.create(declared(10)).await.unwrap();
            h.service.append(&upload.id, 0, body(b"abc"), None).await.unwrap();
            // Simulate a crash after the write but before the offset advance.
            h.service
                .storage
                .write_at(&upload.id, 3, body(b"de"))
                .await
                .unwrap();

            let report = h.service.recover().await.unwrap();
            assert_eq!(
                report,
                RecoveryReport {
                    checked: 1,
                    truncated: 1,
                    inconsistent: 0
                }
            );
            assert_eq!(h.service.storage.length(&upload.id).await.unwrap(), 3);
        }
    }

    #[tokio::test]
    async fn failed_delivery_is_retried() {
        let (sink, mut events) = ChannelCompletionSink::channel(1);
        let service = UploadService::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(TransferCoordinator::new(Arc::new(sink))),
        );
        // Close the subscriber so later deliveries fail.
        let first = service.create(declared(0)).await.unwrap();
        assert_eq!(events.recv().await.unwrap().id, first.id);
        events.close();

        let second = service.create(declared(0)).await.unwrap();
        assert!(!service.head(&second.id).await.unwrap().completion_notified);
        assert_eq!(service.redeliver_pending().await, 0);
        assert_eq!(
            service.store.list_pending_notifications().await.unwrap().len(),
            1
        );
    }
}
