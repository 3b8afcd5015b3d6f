//! Persisted report rows (assembled fact sets, no rendering).

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(FromRow, Debug, Clone)]
pub struct ReportRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub report_type: String,
    pub params: serde_json::Value,
    pub result: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

pub struct PgReportRepo {
    pool: PgPool,
}

impl PgReportRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        project_id: Uuid,
        report_type: &str,
        params: serde_json::Value,
        result: serde_json::Value,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO reports (id, project_id, report_type, params, result, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(id)
        .bind(project_id)
        .bind(report_type)
        .bind(params)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ReportRow>> {
        let row = sqlx::query_as::<_, ReportRow>(
            "SELECT id, project_id, report_type, params, result, created_at FROM reports WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
