//! Upload engine: storage backends, metadata stores, the protocol state
//! machine and the coordinator that serializes work per upload.

pub mod coordinator;
pub mod hooks;
pub mod metadata_store;
pub mod notify;
pub mod storage;
pub mod upload_service;
