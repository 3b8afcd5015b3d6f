//! Postgres implementation of the source repository.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use extraction::{ExtractionError, Source, SourceRepo, SourceStatus};

use super::storage_err;

pub struct PgSourceRepo {
    pool: PgPool,
}

impl PgSourceRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct SourceRow {
    id: Uuid,
    project_id: Uuid,
    uri: String,
    source_group: String,
    content: String,
    cleaned_content: Option<String>,
    metadata: serde_json::Value,
    status: String,
    errors: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SourceRow {
    fn into_source(self) -> Source {
        let metadata: HashMap<String, serde_json::Value> = self
            .metadata
            .as_object()
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default();
        Source {
            id: self.id,
            project_id: self.project_id,
            uri: self.uri,
            source_group: self.source_group,
            content: self.content,
            cleaned_content: self.cleaned_content,
            metadata,
            status: status_from_str(&self.status),
            errors: self.errors,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn status_from_str(status: &str) -> SourceStatus {
    match status {
        "extracted" => SourceStatus::Extracted,
        "failed" => SourceStatus::Failed,
        _ => SourceStatus::Pending,
    }
}

fn status_to_str(status: SourceStatus) -> &'static str {
    match status {
        SourceStatus::Pending => "pending",
        SourceStatus::Extracted => "extracted",
        SourceStatus::Failed => "failed",
    }
}

const SOURCE_COLUMNS: &str = "id, project_id, uri, source_group, content, cleaned_content, \
     metadata, status, errors, created_at, updated_at";

#[async_trait]
impl SourceRepo for PgSourceRepo {
    async fn get_source(&self, id: Uuid) -> extraction::error::Result<Option<Source>> {
        let row = sqlx::query_as::<_, SourceRow>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.map(SourceRow::into_source))
    }

    async fn upsert_source(&self, source: &Source) -> extraction::error::Result<Source> {
        // Conflict on (project_id, uri) refreshes content and metadata
        // but never resets lifecycle columns.
        let row = sqlx::query_as::<_, SourceRow>(&format!(
            r#"
            INSERT INTO sources
                (id, project_id, uri, source_group, content, cleaned_content,
                 metadata, status, errors, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NULL, $6, 'pending', '{{}}', NOW(), NOW())
            ON CONFLICT (project_id, uri) DO UPDATE
            SET content = EXCLUDED.content,
                source_group = EXCLUDED.source_group,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING {SOURCE_COLUMNS}
            "#
        ))
        .bind(source.id)
        .bind(source.project_id)
        .bind(&source.uri)
        .bind(&source.source_group)
        .bind(&source.content)
        .bind(serde_json::Value::Object(
            source.metadata.clone().into_iter().collect(),
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.into_source())
    }

    async fn list_sources_by_domain(
        &self,
        project_id: Uuid,
        domain: &str,
    ) -> extraction::error::Result<Vec<Source>> {
        let rows = sqlx::query_as::<_, SourceRow>(&format!(
            r#"
            SELECT {SOURCE_COLUMNS}
            FROM sources
            WHERE project_id = $1 AND metadata ->> 'domain' = $2
            ORDER BY created_at
            "#
        ))
        .bind(project_id)
        .bind(domain)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows.into_iter().map(SourceRow::into_source).collect())
    }

    async fn set_cleaned_content(
        &self,
        id: Uuid,
        cleaned: &str,
    ) -> extraction::error::Result<()> {
        sqlx::query("UPDATE sources SET cleaned_content = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(cleaned)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn set_source_status(
        &self,
        id: Uuid,
        status: SourceStatus,
        errors: &[String],
    ) -> extraction::error::Result<()> {
        let updated = sqlx::query(
            "UPDATE sources SET status = $2, errors = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(status_to_str(status))
        .bind(errors)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if updated.rows_affected() == 0 {
            return Err(ExtractionError::SourceNotFound { id });
        }
        Ok(())
    }
}
