//! Shared state handed to every handler.

use crate::{auth::AuthPolicy, services::upload_service::UploadService};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub service: UploadService,
    pub auth: Arc<dyn AuthPolicy>,
    /// Public prefix of upload URLs, always ending in `/` (e.g. `/files/`).
    pub base_path: String,
}

impl AppState {
    pub fn new(service: UploadService, auth: Arc<dyn AuthPolicy>, base_path: &str) -> Self {
        Self {
            service,
            auth,
            base_path: normalize_base_path(base_path),
        }
    }

    pub fn upload_url(&self, id: &str) -> String {
        format!("{}{}", self.base_path, id)
    }
}

/// `files`, `/files` and `/files/` all become `/files/`.
pub fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}
