//! Postgres project repository: CRUD with soft delete.
//!
//! The three JSON configurations (schema, entity types, context)
//! round-trip through the compiled core types, so a malformed schema is
//! caught on load, not mid-extraction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use extraction::{EntityTypeDef, ExtractionContext, ExtractionSchema, Project};

pub struct PgProjectRepo {
    pool: PgPool,
}

#[derive(FromRow)]
struct ProjectRow {
    id: Uuid,
    name: String,
    schema: serde_json::Value,
    entity_types: serde_json::Value,
    context: serde_json::Value,
    deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProjectRow {
    fn into_project(self) -> Result<Project> {
        let schema = ExtractionSchema::compile(&self.schema)
            .with_context(|| format!("project {} has an invalid schema", self.name))?;
        let entity_types: Vec<EntityTypeDef> = serde_json::from_value(self.entity_types)
            .with_context(|| format!("project {} has invalid entity types", self.name))?;
        let context: ExtractionContext = serde_json::from_value(self.context)
            .with_context(|| format!("project {} has an invalid context", self.name))?;
        Ok(Project {
            id: self.id,
            name: self.name,
            schema,
            entity_types,
            context,
            deleted: self.deleted,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const PROJECT_COLUMNS: &str =
    "id, name, schema, entity_types, context, deleted, created_at, updated_at";

impl PgProjectRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectRow>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1 AND deleted = FALSE"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ProjectRow::into_project).transpose()
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectRow>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE name = $1 AND deleted = FALSE"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ProjectRow::into_project).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query_as::<_, ProjectRow>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE deleted = FALSE ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ProjectRow::into_project).collect()
    }

    pub async fn create(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects
                (id, name, schema, entity_types, context, deleted, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, FALSE, NOW(), NOW())
            "#,
        )
        .bind(project.id)
        .bind(&project.name)
        .bind(serde_json::to_value(&project.schema)?)
        .bind(serde_json::to_value(&project.entity_types)?)
        .bind(serde_json::to_value(&project.context)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE projects
            SET schema = $2, entity_types = $3, context = $4, updated_at = NOW()
            WHERE id = $1 AND deleted = FALSE
            "#,
        )
        .bind(project.id)
        .bind(serde_json::to_value(&project.schema)?)
        .bind(serde_json::to_value(&project.entity_types)?)
        .bind(serde_json::to_value(&project.context)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Soft delete; rows referencing the project stay intact.
    pub async fn soft_delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE projects SET deleted = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
