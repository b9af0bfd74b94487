//! Creation hook: a pure function deciding the metadata an upload is stored
//! with. It runs synchronously inside Create and sees the whole request.

use crate::models::{metadata::UploadMetadata, upload::Concat};
use axum::http::HeaderMap;
use std::sync::Arc;

/// Length as sent by the client, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedLength {
    Declared(i64),
    Deferred,
}

#[derive(Debug, Clone)]
pub struct CreationRequest {
    pub length: RequestedLength,
    pub metadata: UploadMetadata,
    pub concat: Concat,
    /// Request headers, for hooks that derive metadata from them.
    pub headers: HeaderMap,
}

impl CreationRequest {
    pub fn new(length: RequestedLength, metadata: UploadMetadata) -> Self {
        Self {
            length,
            metadata,
            concat: Concat::None,
            headers: HeaderMap::new(),
        }
    }
}

pub type CreationHook = Arc<dyn Fn(&CreationRequest) -> UploadMetadata + Send + Sync>;

/// Keep the client's metadata as sent.
pub fn passthrough_hook() -> CreationHook {
    Arc::new(|req: &CreationRequest| req.metadata.clone())
}

/// Copy a non-empty `filename` request header into the `filename` metadata
/// entry, overriding what the client put in `Upload-Metadata`.
pub fn filename_header_hook() -> CreationHook {
    Arc::new(|req: &CreationRequest| {
        let mut metadata = req.metadata.clone();
        if let Some(name) = req
            .headers
            .get("filename")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            metadata.insert("filename", name);
        }
        metadata
    })
}
