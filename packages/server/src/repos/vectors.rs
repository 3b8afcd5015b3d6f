//! pgvector-backed vector repository.
//!
//! One `extraction_vectors` table per install: point id = extraction id,
//! payload columns flattened for filterable search, cosine distance via
//! an HNSW index. Upsert is idempotent on id.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use extraction::{
    EmbeddingItem, ExtractionError, VectorFilter, VectorMatch, VectorPayload, VectorRepo,
};

use super::storage_err;

pub struct PgVectorRepo {
    pool: PgPool,
    dimension: usize,
}

impl PgVectorRepo {
    pub fn new(pool: PgPool, dimension: usize) -> Self {
        Self { pool, dimension }
    }

    fn check_dimension(&self, vector: &[f32]) -> extraction::error::Result<()> {
        if vector.len() != self.dimension {
            return Err(ExtractionError::VectorStore(
                format!(
                    "vector has dimension {}, collection expects {}",
                    vector.len(),
                    self.dimension
                )
                .into(),
            ));
        }
        Ok(())
    }
}

#[derive(FromRow)]
struct MatchRow {
    id: Uuid,
    score: f64,
    project_id: Uuid,
    source_group: String,
    extraction_type: String,
    confidence: f32,
}

#[async_trait]
impl VectorRepo for PgVectorRepo {
    async fn init_collection(&self, dimension: usize) -> extraction::error::Result<()> {
        if dimension != self.dimension {
            return Err(ExtractionError::VectorStore(
                format!(
                    "configured dimension {} does not match requested {}",
                    self.dimension, dimension
                )
                .into(),
            ));
        }
        // The table itself is created by migrations; verify the column
        // dimension matches the embedding service.
        let atttypmod: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT a.atttypmod
            FROM pg_attribute a
            JOIN pg_class c ON c.oid = a.attrelid
            WHERE c.relname = 'extraction_vectors' AND a.attname = 'embedding'
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match atttypmod {
            Some((dim,)) if dim as usize == dimension => Ok(()),
            Some((dim,)) => Err(ExtractionError::VectorStore(
                format!("extraction_vectors has dimension {dim}, expected {dimension}").into(),
            )),
            None => Err(ExtractionError::VectorStore(
                "extraction_vectors table is missing; run migrations".into(),
            )),
        }
    }

    async fn upsert(&self, item: &EmbeddingItem) -> extraction::error::Result<()> {
        self.upsert_batch(std::slice::from_ref(item)).await
    }

    async fn upsert_batch(&self, items: &[EmbeddingItem]) -> extraction::error::Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for item in items {
            self.check_dimension(&item.vector)?;
            sqlx::query(
                r#"
                INSERT INTO extraction_vectors
                    (id, embedding, project_id, source_group, extraction_type,
                     confidence, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO UPDATE
                SET embedding = EXCLUDED.embedding,
                    source_group = EXCLUDED.source_group,
                    extraction_type = EXCLUDED.extraction_type,
                    confidence = EXCLUDED.confidence,
                    payload = EXCLUDED.payload
                "#,
            )
            .bind(item.id)
            .bind(Vector::from(item.vector.clone()))
            .bind(item.payload.project_id)
            .bind(&item.payload.source_group)
            .bind(&item.payload.extraction_type)
            .bind(item.payload.confidence)
            .bind(serde_json::to_value(&item.payload.extra).unwrap_or_default())
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &VectorFilter,
    ) -> extraction::error::Result<Vec<VectorMatch>> {
        self.check_dimension(vector)?;

        // Cosine similarity = 1 - cosine distance (`<=>`).
        let rows = sqlx::query_as::<_, MatchRow>(
            r#"
            SELECT id,
                   1 - (embedding <=> $1) AS score,
                   project_id, source_group, extraction_type, confidence
            FROM extraction_vectors
            WHERE ($2::uuid IS NULL OR project_id = $2)
              AND ($3::text IS NULL OR source_group = $3)
              AND ($4::text IS NULL OR extraction_type = $4)
            ORDER BY embedding <=> $1
            LIMIT $5
            "#,
        )
        .bind(Vector::from(vector.to_vec()))
        .bind(filter.project_id)
        .bind(filter.source_group.as_deref())
        .bind(filter.extraction_type.as_deref())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|row| VectorMatch {
                id: row.id,
                score: row.score as f32,
                payload: VectorPayload {
                    project_id: row.project_id,
                    source_group: row.source_group,
                    extraction_type: row.extraction_type,
                    confidence: row.confidence,
                    extra: Default::default(),
                },
            })
            .collect())
    }

    async fn delete(&self, ids: &[Uuid]) -> extraction::error::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM extraction_vectors WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}
