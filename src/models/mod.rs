//! Core data models for the resumable upload service.
//!
//! `Upload` is the single entity; it maps to the `uploads` table through
//! `UploadRow` and serializes naturally as JSON via `serde`.

pub mod metadata;
pub mod upload;
