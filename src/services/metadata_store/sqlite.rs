//! SQLite-backed metadata store.
//!
//! One row per upload in the `uploads` table, keyed by the same id that names
//! the payload object, so the offset recorded here can be audited against
//! the stored byte length.

use super::{MetadataError, MetadataResult, MetadataStore, new_upload_id};
use crate::models::upload::{Concat, NewUpload, Upload, UploadRow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

const INIT_MIGRATION: &str = include_str!("../../../migrations/0001_init.sql");

const UPLOAD_COLUMNS: &str = "id, declared_length, upload_offset, metadata, concat_kind, \
     partial_refs, completion_notified, created_at, updated_at";

#[derive(Clone)]
pub struct SqliteMetadataStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> MetadataResult<()> {
        let statements = INIT_MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            tracing::debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    async fn fetch_many(&self, sql: &str, before: Option<DateTime<Utc>>) -> MetadataResult<Vec<Upload>> {
        let mut query = sqlx::query_as::<_, UploadRow>(sql);
        if let Some(before) = before {
            query = query.bind(before);
        }
        let rows = query.fetch_all(&*self.db).await?;
        rows.into_iter()
            .map(|row| Upload::try_from(row).map_err(MetadataError::from))
            .collect()
    }

    /// Classify a conditional update that matched no row.
    async fn explain_miss(&self, id: &str, requested: u64) -> MetadataError {
        match self.get(id).await {
            Ok(upload) => MetadataError::InvalidOffset {
                id: id.to_string(),
                current: upload.offset,
                requested,
            },
            Err(err) => err,
        }
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn create(&self, new: NewUpload) -> MetadataResult<Upload> {
        let now = Utc::now();
        let partial_refs = match &new.concat {
            Concat::Final(parts) => serde_json::to_string(parts)?,
            _ => "[]".to_string(),
        };

        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "INSERT INTO uploads (
                id, declared_length, upload_offset, metadata, concat_kind,
                partial_refs, completion_notified, created_at, updated_at
             ) VALUES (?, ?, 0, ?, ?, ?, 0, ?, ?)
             RETURNING {UPLOAD_COLUMNS}"
        ))
        .bind(new_upload_id())
        .bind(new.declared_length.map(|len| len as i64))
        .bind(serde_json::to_string(&new.metadata)?)
        .bind(new.concat.kind())
        .bind(partial_refs)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;

        Ok(Upload::try_from(row)?)
    }

    async fn get(&self, id: &str) -> MetadataResult<Upload> {
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => MetadataError::NotFound(id.to_string()),
            other => MetadataError::Sqlx(other),
        })?;
        Ok(Upload::try_from(row)?)
    }

    async fn advance_offset(&self, id: &str, new_offset: u64) -> MetadataResult<Upload> {
        let requested = new_offset as i64;
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "UPDATE uploads SET upload_offset = ?, updated_at = ?
             WHERE id = ? AND upload_offset <= ?
               AND (declared_length IS NULL OR declared_length >= ?)
             RETURNING {UPLOAD_COLUMNS}"
        ))
        .bind(requested)
        .bind(Utc::now())
        .bind(id)
        .bind(requested)
        .bind(requested)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(row) => Ok(Upload::try_from(row)?),
            None => Err(self.explain_miss(id, new_offset).await),
        }
    }

    async fn set_length(&self, id: &str, length: u64) -> MetadataResult<Upload> {
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "UPDATE uploads SET declared_length = ?, updated_at = ?
             WHERE id = ? AND declared_length IS NULL
             RETURNING {UPLOAD_COLUMNS}"
        ))
        .bind(length as i64)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(row) => Ok(Upload::try_from(row)?),
            None => {
                self.get(id).await?;
                Err(MetadataError::AlreadySet(id.to_string()))
            }
        }
    }

    async fn mark_notified(&self, id: &str) -> MetadataResult<()> {
        let result = sqlx::query("UPDATE uploads SET completion_notified = 1 WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_inactive(&self, before: DateTime<Utc>) -> MetadataResult<Vec<Upload>> {
        self.fetch_many(
            &format!(
                "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE updated_at < ? ORDER BY updated_at ASC"
            ),
            Some(before),
        )
        .await
    }

    async fn list_pending_notifications(&self) -> MetadataResult<Vec<Upload>> {
        self.fetch_many(
            &format!(
                "SELECT {UPLOAD_COLUMNS} FROM uploads
                 WHERE completion_notified = 0
                   AND declared_length IS NOT NULL
                   AND upload_offset = declared_length
                 ORDER BY updated_at ASC"
            ),
            None,
        )
        .await
    }

    async fn list_all(&self) -> MetadataResult<Vec<Upload>> {
        self.fetch_many(
            &format!("SELECT {UPLOAD_COLUMNS} FROM uploads ORDER BY created_at ASC"),
            None,
        )
        .await
    }

    async fn ping(&self) -> MetadataResult<()> {
        let value = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        if value != 1 {
            return Err(MetadataError::Sqlx(sqlx::Error::Protocol(format!(
                "unexpected result: {}",
                value
            ))));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::metadata_store::test_support::exercise_store;
    use sqlx::sqlite::SqlitePoolOptions;

    pub(crate) async fn memory_pool() -> Arc<SqlitePool> {
        Arc::new(
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn satisfies_store_contract() {
        let store = SqliteMetadataStore::new(memory_pool().await);
        store.migrate().await.unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = SqliteMetadataStore::new(memory_pool().await);
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
        store.ping().await.unwrap();
    }
}
