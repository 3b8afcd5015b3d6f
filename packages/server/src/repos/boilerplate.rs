//! Postgres implementation of the domain-boilerplate repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use extraction::{BoilerplateParams, BoilerplateRepo, BoilerplateStats, DomainBoilerplate};

use super::storage_err;

pub struct PgBoilerplateRepo {
    pool: PgPool,
}

impl PgBoilerplateRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct FingerprintRow {
    project_id: Uuid,
    domain: String,
    hashes: Vec<String>,
    threshold_pct: f32,
    min_pages: i32,
    min_block_chars: i32,
    pages_analyzed: i32,
    blocks_total: i32,
    blocks_boilerplate: i32,
    bytes_removed_avg: i32,
    updated_at: DateTime<Utc>,
}

impl FingerprintRow {
    fn into_fingerprint(self) -> DomainBoilerplate {
        DomainBoilerplate {
            project_id: self.project_id,
            domain: self.domain,
            hashes: self.hashes,
            params: BoilerplateParams {
                threshold_pct: self.threshold_pct,
                min_pages: self.min_pages.max(0) as usize,
                min_block_chars: self.min_block_chars.max(0) as usize,
            },
            stats: BoilerplateStats {
                pages_analyzed: self.pages_analyzed.max(0) as usize,
                blocks_total: self.blocks_total.max(0) as usize,
                blocks_boilerplate: self.blocks_boilerplate.max(0) as usize,
                bytes_removed_avg: self.bytes_removed_avg.max(0) as usize,
            },
            updated_at: self.updated_at,
        }
    }
}

#[async_trait]
impl BoilerplateRepo for PgBoilerplateRepo {
    async fn get_fingerprint(
        &self,
        project_id: Uuid,
        domain: &str,
    ) -> extraction::error::Result<Option<DomainBoilerplate>> {
        let row = sqlx::query_as::<_, FingerprintRow>(
            r#"
            SELECT project_id, domain, hashes, threshold_pct, min_pages, min_block_chars,
                   pages_analyzed, blocks_total, blocks_boilerplate, bytes_removed_avg,
                   updated_at
            FROM domain_boilerplate
            WHERE project_id = $1 AND domain = $2
            "#,
        )
        .bind(project_id)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.map(FingerprintRow::into_fingerprint))
    }

    async fn upsert_fingerprint(
        &self,
        fingerprint: &DomainBoilerplate,
    ) -> extraction::error::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO domain_boilerplate
                (project_id, domain, hashes, threshold_pct, min_pages, min_block_chars,
                 pages_analyzed, blocks_total, blocks_boilerplate, bytes_removed_avg,
                 updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (project_id, domain) DO UPDATE
            SET hashes = EXCLUDED.hashes,
                threshold_pct = EXCLUDED.threshold_pct,
                min_pages = EXCLUDED.min_pages,
                min_block_chars = EXCLUDED.min_block_chars,
                pages_analyzed = EXCLUDED.pages_analyzed,
                blocks_total = EXCLUDED.blocks_total,
                blocks_boilerplate = EXCLUDED.blocks_boilerplate,
                bytes_removed_avg = EXCLUDED.bytes_removed_avg,
                updated_at = NOW()
            "#,
        )
        .bind(fingerprint.project_id)
        .bind(&fingerprint.domain)
        .bind(&fingerprint.hashes)
        .bind(fingerprint.params.threshold_pct)
        .bind(fingerprint.params.min_pages as i32)
        .bind(fingerprint.params.min_block_chars as i32)
        .bind(fingerprint.stats.pages_analyzed as i32)
        .bind(fingerprint.stats.blocks_total as i32)
        .bind(fingerprint.stats.blocks_boilerplate as i32)
        .bind(fingerprint.stats.bytes_removed_avg as i32)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}
