//! Knowledge unit repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use inkwell_core::defaults::{clamp_limit, clamp_offset};
use inkwell_core::{
    new_v7, Error, KnowledgeUnit, KnowledgeUnitRepository, KnowledgeUnitType,
    KnowledgeUnitWithPage, ListKnowledgeUnitsRequest, ListKnowledgeUnitsResponse,
    NewKnowledgeUnit, ProcessingSteps, Result, UnitPageRef,
};

const UNIT_COLUMNS: &str =
    "id, page_id, unit_type::text AS unit_type, content, metadata, created_at";

/// PostgreSQL implementation of KnowledgeUnitRepository.
pub struct PgKnowledgeUnitRepository {
    pool: Pool<Postgres>,
}

impl PgKnowledgeUnitRepository {
    /// Create a new PgKnowledgeUnitRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_unit_row(row: &PgRow) -> Result<KnowledgeUnit> {
        let unit_type: String = row.get("unit_type");
        Ok(KnowledgeUnit {
            id: row.get("id"),
            page_id: row.get("page_id"),
            unit_type: unit_type.parse()?,
            content: row.get("content"),
            metadata: row.get("metadata"),
            created_at: row.get("created_at"),
        })
    }

    fn parse_listed_row(row: &PgRow) -> Result<KnowledgeUnitWithPage> {
        Ok(KnowledgeUnitWithPage {
            unit: Self::parse_unit_row(row)?,
            page: UnitPageRef {
                id: row.get("page_id"),
                image_url: row.get("page_image_url"),
                created_at: row.get("page_created_at"),
            },
        })
    }
}

#[async_trait]
impl KnowledgeUnitRepository for PgKnowledgeUnitRepository {
    async fn insert_batch(&self, page_id: Uuid, units: &[NewKnowledgeUnit]) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Row lock serializes concurrent deliveries of the same page.
        let steps: Option<JsonValue> =
            sqlx::query_scalar("SELECT processing_steps FROM page WHERE id = $1 FOR UPDATE")
                .bind(page_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::Database)?;

        let Some(steps) = steps else {
            return Err(Error::PageNotFound(page_id));
        };
        let steps: ProcessingSteps = serde_json::from_value(steps)
            .map_err(|e| Error::Serialization(format!("processing_steps: {}", e)))?;

        if steps.units_inserted {
            debug!(page_id = %page_id, "Knowledge units already inserted, skipping");
            tx.commit().await.map_err(Error::Database)?;
            return Ok(0);
        }

        let now = Utc::now();
        for unit in units {
            let metadata = unit
                .metadata
                .clone()
                .unwrap_or_else(|| serde_json::json!({}));
            sqlx::query(
                "INSERT INTO knowledge_unit (id, page_id, unit_type, content, metadata, created_at)
                 VALUES ($1, $2, $3::knowledge_unit_type, $4, $5, $6)",
            )
            .bind(new_v7())
            .bind(page_id)
            .bind(unit.unit_type.as_str())
            .bind(&unit.content)
            .bind(&metadata)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        sqlx::query(
            "UPDATE page
             SET processing_steps = processing_steps || '{\"units_inserted\": true}'::jsonb,
                 updated_at = $2
             WHERE id = $1",
        )
        .bind(page_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(units.len())
    }

    async fn list_for_page(&self, page_id: Uuid) -> Result<Vec<KnowledgeUnit>> {
        let rows = sqlx::query(&format!(
            "SELECT {UNIT_COLUMNS} FROM knowledge_unit WHERE page_id = $1 ORDER BY id"
        ))
        .bind(page_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_unit_row).collect()
    }

    async fn list(&self, req: ListKnowledgeUnitsRequest) -> Result<ListKnowledgeUnitsResponse> {
        let limit = clamp_limit(req.limit);
        let offset = clamp_offset(req.offset);
        let unit_type = req.unit_type.map(KnowledgeUnitType::as_str);

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM knowledge_unit
             WHERE ($1::knowledge_unit_type IS NULL OR unit_type = $1::knowledge_unit_type)",
        )
        .bind(unit_type)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        let rows = sqlx::query(
            "SELECT ku.id, ku.page_id, ku.unit_type::text AS unit_type, ku.content,
                    ku.metadata, ku.created_at,
                    p.image_url AS page_image_url, p.created_at AS page_created_at
             FROM knowledge_unit ku
             JOIN page p ON p.id = ku.page_id
             WHERE ($1::knowledge_unit_type IS NULL OR ku.unit_type = $1::knowledge_unit_type)
             ORDER BY ku.created_at DESC, ku.id DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(unit_type)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(ListKnowledgeUnitsResponse {
            knowledge_units: rows
                .iter()
                .map(Self::parse_listed_row)
                .collect::<Result<Vec<_>>>()?,
            total,
            limit,
            offset,
        })
    }
}
