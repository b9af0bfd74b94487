//! Completion notifications.
//!
//! Delivery is at-least-once: an event whose delivery fails stays pending
//! and is retried by the reaper, and a crash between delivery and the
//! acknowledgement being recorded replays it. Sinks must dedupe by id.

use crate::models::{metadata::UploadMetadata, upload::Upload};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

/// Emitted once an upload's offset reaches its declared length.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletionEvent {
    pub id: String,
    pub length: u64,
    pub metadata: UploadMetadata,
}

impl CompletionEvent {
    pub fn from_upload(upload: &Upload) -> Self {
        Self {
            id: upload.id.clone(),
            length: upload.offset,
            metadata: upload.metadata.clone(),
        }
    }
}

#[derive(Debug, Error)]
#[error("completion sink failed for upload `{id}`: {reason}")]
pub struct SinkError {
    pub id: String,
    pub reason: String,
}

#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn deliver(&self, event: &CompletionEvent) -> Result<(), SinkError>;
}

/// Writes each completion to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogCompletionSink;

#[async_trait]
impl CompletionSink for LogCompletionSink {
    async fn deliver(&self, event: &CompletionEvent) -> Result<(), SinkError> {
        tracing::info!(
            upload_id = %event.id,
            length = event.length,
            filename = event.metadata.get("filename").unwrap_or_default(),
            "Upload {} finished",
            event.id
        );
        Ok(())
    }
}

/// Forwards events into a bounded channel; delivery waits for capacity and
/// fails once the receiver is gone.
#[derive(Clone, Debug)]
pub struct ChannelCompletionSink {
    tx: mpsc::Sender<CompletionEvent>,
}

impl ChannelCompletionSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CompletionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CompletionSink for ChannelCompletionSink {
    async fn deliver(&self, event: &CompletionEvent) -> Result<(), SinkError> {
        self.tx.send(event.clone()).await.map_err(|_| SinkError {
            id: event.id.clone(),
            reason: "subscriber dropped".into(),
        })
    }
}
