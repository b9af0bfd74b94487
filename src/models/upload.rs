//! Represents one resumable transfer and its persisted row form.

use crate::models::metadata::UploadMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state derived from offset and declared length.
///
/// `Terminated` is never stored: a terminated upload no longer exists.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Created,
    Receiving,
    Completed,
}

/// Role of an upload in the concatenation extension.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "parts")]
pub enum Concat {
    #[default]
    None,
    /// Building block for a later final upload.
    Partial,
    /// Assembled from the listed partial uploads, in order.
    Final(Vec<String>),
}

impl Concat {
    pub fn kind(&self) -> &'static str {
        match self {
            Concat::None => "none",
            Concat::Partial => "partial",
            Concat::Final(_) => "final",
        }
    }
}

/// One in-progress or completed upload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Upload {
    /// Opaque identifier, 32 lowercase hex characters.
    pub id: String,

    /// Total expected size; `None` while the length is deferred.
    pub declared_length: Option<u64>,

    /// Bytes durably accepted so far.
    pub offset: u64,

    pub metadata: UploadMetadata,

    pub concat: Concat,

    /// Whether the completion sink has acknowledged this upload.
    pub completion_notified: bool,

    pub created_at: DateTime<Utc>,

    /// Last successful mutation; drives expiry.
    pub updated_at: DateTime<Utc>,
}

impl Upload {
    pub fn is_complete(&self) -> bool {
        self.declared_length == Some(self.offset)
    }

    pub fn state(&self) -> UploadState {
        if self.is_complete() {
            UploadState::Completed
        } else if self.offset == 0 {
            UploadState::Created
        } else {
            UploadState::Receiving
        }
    }

    /// Bytes still accepted before the declared length is reached.
    pub fn remaining(&self) -> Option<u64> {
        self.declared_length.map(|len| len.saturating_sub(self.offset))
    }
}

/// Input to `MetadataStore::create`.
#[derive(Clone, Debug, Default)]
pub struct NewUpload {
    pub declared_length: Option<u64>,
    pub metadata: UploadMetadata,
    pub concat: Concat,
}

/// Row layout of the `uploads` table.
#[derive(Clone, FromRow, Debug)]
pub struct UploadRow {
    pub id: String,
    pub declared_length: Option<i64>,
    pub upload_offset: i64,
    pub metadata: String,
    pub concat_kind: String,
    pub partial_refs: String,
    pub completion_notified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<UploadRow> for Upload {
    type Error = serde_json::Error;

    fn try_from(row: UploadRow) -> Result<Self, Self::Error> {
        let concat = match row.concat_kind.as_str() {
            "partial" => Concat::Partial,
            "final" => Concat::Final(serde_json::from_str(&row.partial_refs)?),
            _ => Concat::None,
        };
        Ok(Upload {
            id: row.id,
            declared_length: row.declared_length.map(|len| len.max(0) as u64),
            offset: row.upload_offset.max(0) as u64,
            metadata: serde_json::from_str(&row.metadata)?,
            concat,
            completion_notified: row.completion_notified,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(declared_length: Option<u64>, offset: u64) -> Upload {
        Upload {
            id: "0123456789abcdef0123456789abcdef".into(),
            declared_length,
            offset,
            metadata: UploadMetadata::new(),
            concat: Concat::None,
            completion_notified: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn state_follows_offset() {
        assert_eq!(upload(Some(24), 0).state(), UploadState::Created);
        assert_eq!(upload(Some(24), 10).state(), UploadState::Receiving);
        assert_eq!(upload(Some(24), 24).state(), UploadState::Completed);
        assert_eq!(upload(Some(0), 0).state(), UploadState::Completed);
    }

    #[test]
    fn deferred_upload_is_never_complete() {
        let up = upload(None, 10);
        assert!(!up.is_complete());
        assert_eq!(up.state(), UploadState::Receiving);
        assert_eq!(up.remaining(), None);
    }

    #[test]
    fn row_conversion_reads_final_refs() {
        let row = UploadRow {
            id: "ab".into(),
            declared_length: Some(8),
            upload_offset: 8,
            metadata: r#"{"filename":"a.bin"}"#.into(),
            concat_kind: "final".into(),
            partial_refs: r#"["p1","p2"]"#.into(),
            completion_notified: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let up = Upload::try_from(row).unwrap();
        assert_eq!(up.concat, Concat::Final(vec!["p1".into(), "p2".into()]));
        assert_eq!(up.metadata.get("filename"), Some("a.bin"));
        assert!(up.is_complete());
    }
}
