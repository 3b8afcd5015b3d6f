//! Postgres implementation of the entity repository.
//!
//! `get_or_create` rides the unique key
//! (project_id, source_group, entity_type, normalized_value): a conflict
//! is "already present", never an error. Links work the same way on
//! their (extraction_id, entity_id, role) triple.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use extraction::{Entity, EntityRepo, ExtractionEntity};

use super::storage_err;

pub struct PgEntityRepo {
    pool: PgPool,
}

impl PgEntityRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct EntityRow {
    id: Uuid,
    project_id: Uuid,
    source_group: String,
    entity_type: String,
    normalized_value: String,
    value: String,
    attributes: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl EntityRow {
    fn into_entity(self) -> Entity {
        let attributes: HashMap<String, serde_json::Value> = self
            .attributes
            .as_object()
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default();
        Entity {
            id: self.id,
            project_id: self.project_id,
            source_group: self.source_group,
            entity_type: self.entity_type,
            normalized_value: self.normalized_value,
            value: self.value,
            attributes,
            created_at: self.created_at,
        }
    }
}

const ENTITY_COLUMNS: &str =
    "id, project_id, source_group, entity_type, normalized_value, value, attributes, created_at";

#[async_trait]
impl EntityRepo for PgEntityRepo {
    async fn get_or_create(&self, entity: &Entity) -> extraction::error::Result<Entity> {
        // DO UPDATE on the conflict makes RETURNING yield the existing
        // row without changing it (the no-op SET keeps the row lock
        // short-lived and the statement single-round-trip).
        let row = sqlx::query_as::<_, EntityRow>(&format!(
            r#"
            INSERT INTO entities
                (id, project_id, source_group, entity_type, normalized_value,
                 value, attributes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (project_id, source_group, entity_type, normalized_value)
            DO UPDATE SET normalized_value = EXCLUDED.normalized_value
            RETURNING {ENTITY_COLUMNS}
            "#
        ))
        .bind(entity.id)
        .bind(entity.project_id)
        .bind(&entity.source_group)
        .bind(&entity.entity_type)
        .bind(&entity.normalized_value)
        .bind(&entity.value)
        .bind(serde_json::Value::Object(
            entity.attributes.clone().into_iter().collect(),
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.into_entity())
    }

    async fn get_or_create_link(
        &self,
        extraction_id: Uuid,
        entity_id: Uuid,
        role: &str,
    ) -> extraction::error::Result<(ExtractionEntity, bool)> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO extraction_entities (extraction_id, entity_id, role, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (extraction_id, entity_id, role) DO NOTHING
            "#,
        )
        .bind(extraction_id)
        .bind(entity_id)
        .bind(role)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        let created = inserted.rows_affected() > 0;
        let row: (DateTime<Utc>,) = sqlx::query_as(
            r#"
            SELECT created_at FROM extraction_entities
            WHERE extraction_id = $1 AND entity_id = $2 AND role = $3
            "#,
        )
        .bind(extraction_id)
        .bind(entity_id)
        .bind(role)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok((
            ExtractionEntity {
                extraction_id,
                entity_id,
                role: role.to_string(),
                created_at: row.0,
            },
            created,
        ))
    }

    async fn list_for_extraction(
        &self,
        extraction_id: Uuid,
    ) -> extraction::error::Result<Vec<Entity>> {
        let rows = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT e.id, e.project_id, e.source_group, e.entity_type,
                   e.normalized_value, e.value, e.attributes, e.created_at
            FROM entities e
            JOIN extraction_entities link ON link.entity_id = e.id
            WHERE link.extraction_id = $1
            ORDER BY e.created_at
            "#,
        )
        .bind(extraction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows.into_iter().map(EntityRow::into_entity).collect())
    }
}
