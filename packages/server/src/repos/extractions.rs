//! Postgres implementation of the extraction repository.
//!
//! `data` is a jsonb column, which keeps containment (`data @> ...`) and
//! path (`data ->> 'field'`) queries available to report tooling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use extraction::{Extraction, ExtractionRepo};

use super::storage_err;

pub struct PgExtractionRepo {
    pool: PgPool,
}

impl PgExtractionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Extractions whose data contains the given JSON fragment
    /// (`data @> $fragment`).
    pub async fn list_by_containment(
        &self,
        project_id: Uuid,
        fragment: &serde_json::Value,
    ) -> extraction::error::Result<Vec<Extraction>> {
        let rows = sqlx::query_as::<_, ExtractionRow>(&format!(
            r#"
            SELECT {EXTRACTION_COLUMNS}
            FROM extractions
            WHERE project_id = $1 AND data @> $2
            ORDER BY created_at
            "#
        ))
        .bind(project_id)
        .bind(fragment)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter().map(ExtractionRow::into_extraction).collect()
    }
}

#[derive(FromRow)]
struct ExtractionRow {
    id: Uuid,
    project_id: Uuid,
    source_id: Uuid,
    extraction_type: String,
    data: serde_json::Value,
    confidence: f32,
    embedding_id: Option<Uuid>,
    entities_extracted: bool,
    created_at: DateTime<Utc>,
}

impl ExtractionRow {
    fn into_extraction(self) -> extraction::error::Result<Extraction> {
        let data = match self.data {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(extraction::ExtractionError::Storage(
                    format!("extraction {} data is not an object: {other}", self.id).into(),
                ))
            }
        };
        Ok(Extraction {
            id: self.id,
            project_id: self.project_id,
            source_id: self.source_id,
            extraction_type: self.extraction_type,
            data,
            confidence: self.confidence,
            embedding_id: self.embedding_id,
            entities_extracted: self.entities_extracted,
            created_at: self.created_at,
        })
    }
}

const EXTRACTION_COLUMNS: &str = "id, project_id, source_id, extraction_type, data, \
     confidence, embedding_id, entities_extracted, created_at";

#[async_trait]
impl ExtractionRepo for PgExtractionRepo {
    async fn get_extraction(&self, id: Uuid) -> extraction::error::Result<Option<Extraction>> {
        let row = sqlx::query_as::<_, ExtractionRow>(&format!(
            "SELECT {EXTRACTION_COLUMNS} FROM extractions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.map(ExtractionRow::into_extraction).transpose()
    }

    async fn create_batch(&self, extractions: &[Extraction]) -> extraction::error::Result<()> {
        if extractions.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for extraction in extractions {
            sqlx::query(
                r#"
                INSERT INTO extractions
                    (id, project_id, source_id, extraction_type, data, confidence,
                     embedding_id, entities_extracted, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, NULL, FALSE, $7)
                "#,
            )
            .bind(extraction.id)
            .bind(extraction.project_id)
            .bind(extraction.source_id)
            .bind(&extraction.extraction_type)
            .bind(serde_json::Value::Object(extraction.data.clone()))
            .bind(extraction.confidence)
            .bind(extraction.created_at)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn list_for_source(
        &self,
        source_id: Uuid,
    ) -> extraction::error::Result<Vec<Extraction>> {
        let rows = sqlx::query_as::<_, ExtractionRow>(&format!(
            "SELECT {EXTRACTION_COLUMNS} FROM extractions WHERE source_id = $1 ORDER BY created_at"
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter().map(ExtractionRow::into_extraction).collect()
    }

    async fn list_for_project(
        &self,
        project_id: Uuid,
        extraction_type: Option<&str>,
    ) -> extraction::error::Result<Vec<Extraction>> {
        let rows = sqlx::query_as::<_, ExtractionRow>(&format!(
            r#"
            SELECT {EXTRACTION_COLUMNS}
            FROM extractions
            WHERE project_id = $1
              AND ($2::text IS NULL OR extraction_type = $2)
            ORDER BY created_at
            "#
        ))
        .bind(project_id)
        .bind(extraction_type)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter().map(ExtractionRow::into_extraction).collect()
    }

    async fn list_orphans(
        &self,
        project_id: Uuid,
        limit: usize,
    ) -> extraction::error::Result<Vec<Extraction>> {
        let rows = sqlx::query_as::<_, ExtractionRow>(&format!(
            r#"
            SELECT {EXTRACTION_COLUMNS}
            FROM extractions
            WHERE project_id = $1 AND embedding_id IS NULL
            ORDER BY created_at
            LIMIT $2
            "#
        ))
        .bind(project_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter().map(ExtractionRow::into_extraction).collect()
    }

    async fn update_embedding_ids_batch(
        &self,
        pairs: &[(Uuid, Uuid)],
    ) -> extraction::error::Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = pairs.iter().map(|(id, _)| *id).collect();
        let point_ids: Vec<Uuid> = pairs.iter().map(|(_, point)| *point).collect();

        // One statement over the unnested pairs; the null guard keeps
        // repeated recovery runs idempotent.
        sqlx::query(
            r#"
            UPDATE extractions AS e
            SET embedding_id = p.point_id
            FROM UNNEST($1::uuid[], $2::uuid[]) AS p(id, point_id)
            WHERE e.id = p.id AND e.embedding_id IS NULL
            "#,
        )
        .bind(&ids)
        .bind(&point_ids)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn list_pending_entities(
        &self,
        project_id: Uuid,
        limit: usize,
    ) -> extraction::error::Result<Vec<Extraction>> {
        let rows = sqlx::query_as::<_, ExtractionRow>(&format!(
            r#"
            SELECT {EXTRACTION_COLUMNS}
            FROM extractions
            WHERE project_id = $1 AND entities_extracted = FALSE
            ORDER BY created_at
            LIMIT $2
            "#
        ))
        .bind(project_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter().map(ExtractionRow::into_extraction).collect()
    }

    async fn set_entities_extracted(
        &self,
        id: Uuid,
        done: bool,
    ) -> extraction::error::Result<()> {
        sqlx::query("UPDATE extractions SET entities_extracted = $2 WHERE id = $1")
            .bind(id)
            .bind(done)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}
