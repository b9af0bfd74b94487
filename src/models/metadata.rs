//! User-supplied key/value metadata attached to an upload.
//!
//! On the wire this travels in the `Upload-Metadata` header as a
//! comma-separated list of `key base64(value)` pairs. The value part is
//! optional, in which case the key maps to an empty string.

use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataParseError {
    #[error("metadata pair `{0}` has an empty key")]
    EmptyKey(String),
    #[error("metadata key `{0}` contains whitespace or a comma")]
    InvalidKey(String),
    #[error("metadata key `{0}` appears more than once")]
    DuplicateKey(String),
    #[error("metadata value for `{0}` is not valid base64")]
    InvalidBase64(String),
    #[error("metadata value for `{0}` is not valid UTF-8")]
    InvalidUtf8(String),
}

/// Ordered string map, immutable once the upload exists.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct UploadMetadata(BTreeMap<String, String>);

impl UploadMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an `Upload-Metadata` header value.
    pub fn parse_header(raw: &str) -> Result<Self, MetadataParseError> {
        let mut entries = BTreeMap::new();
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let mut parts = pair.splitn(2, ' ');
            let key = parts.next().unwrap_or_default();
            let encoded = parts.next().map(str::trim).unwrap_or("");

            if key.is_empty() {
                return Err(MetadataParseError::EmptyKey(pair.to_string()));
            }
            if key.chars().any(|c| c.is_whitespace() || c == ',') {
                return Err(MetadataParseError::InvalidKey(key.to_string()));
            }

            let value = if encoded.is_empty() {
                String::new()
            } else {
                let bytes = general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|_| MetadataParseError::InvalidBase64(key.to_string()))?;
                String::from_utf8(bytes)
                    .map_err(|_| MetadataParseError::InvalidUtf8(key.to_string()))?
            };

            if entries.insert(key.to_string(), value).is_some() {
                return Err(MetadataParseError::DuplicateKey(key.to_string()));
            }
        }
        Ok(Self(entries))
    }

    /// Render back into the `Upload-Metadata` header form.
    pub fn to_header(&self) -> String {
        self.0
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key.clone()
                } else {
                    format!("{} {}", key, general_purpose::STANDARD.encode(value))
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for UploadMetadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
