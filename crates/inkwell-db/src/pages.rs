//! Page repository implementation.
//!
//! Every lifecycle write is a single conditional `UPDATE ... WHERE status IN
//! (...)`. When it matches no row, a follow-up read tells a deleted page
//! (`PageNotFound`) apart from an illegal edge (`InvalidTransition`).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use inkwell_core::defaults::{clamp_limit, clamp_offset};
use inkwell_core::{
    new_v7, CreatePageRequest, Error, ExtractionResult, ListPagesRequest, ListPagesResponse,
    Page, PageRepository, PageStatus, PageStatusView, PageWithTags, ProcessingSteps, Result, Tag,
};

use crate::tags::tag_from_row;

const PAGE_COLUMNS: &str = "id, image_url, image_ref, raw_ocr_text, clean_text, status::text AS status, \
     error_message, metadata, processing_steps, created_at, updated_at";

/// PostgreSQL implementation of PageRepository.
pub struct PgPageRepository {
    pool: Pool<Postgres>,
}

impl PgPageRepository {
    /// Create a new PgPageRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_page_row(row: &PgRow) -> Result<Page> {
        let status: String = row.get("status");
        let steps: JsonValue = row.get("processing_steps");
        let processing_steps: ProcessingSteps = serde_json::from_value(steps)
            .map_err(|e| Error::Serialization(format!("processing_steps: {}", e)))?;

        Ok(Page {
            id: row.get("id"),
            image_url: row.get("image_url"),
            image_ref: row.get("image_ref"),
            raw_ocr_text: row.get("raw_ocr_text"),
            clean_text: row.get("clean_text"),
            status: status.parse()?,
            error_message: row.get("error_message"),
            metadata: row.get("metadata"),
            processing_steps,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn current_status(&self, id: Uuid) -> Result<Option<PageStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status::text FROM page WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
        status.map(|s| s.parse()).transpose()
    }

    /// Explain why a guarded update matched nothing.
    async fn rejected_transition(&self, id: Uuid, to: PageStatus) -> Error {
        match self.current_status(id).await {
            Ok(Some(from)) => Error::InvalidTransition {
                page_id: id,
                from,
                to,
            },
            Ok(None) => Error::PageNotFound(id),
            Err(e) => e,
        }
    }

    /// Tags for a set of pages, keyed by page ID.
    async fn tags_for_pages(&self, page_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<Tag>>> {
        if page_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            "SELECT pt.page_id, t.id, t.name, t.created_at
             FROM page_tag pt
             JOIN tag t ON t.id = pt.tag_id
             WHERE pt.page_id = ANY($1)
             ORDER BY t.name",
        )
        .bind(page_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut by_page: HashMap<Uuid, Vec<Tag>> = HashMap::new();
        for row in rows {
            let page_id: Uuid = row.get("page_id");
            by_page.entry(page_id).or_default().push(tag_from_row(&row));
        }
        Ok(by_page)
    }
}

#[async_trait]
impl PageRepository for PgPageRepository {
    async fn create(&self, req: CreatePageRequest) -> Result<Page> {
        let id = new_v7();
        let now = Utc::now();
        let metadata = req.metadata.unwrap_or_else(|| serde_json::json!({}));

        let row = sqlx::query(&format!(
            "INSERT INTO page (id, image_url, image_ref, status, metadata, processing_steps, created_at, updated_at)
             VALUES ($1, $2, $3, 'uploading'::page_status, $4, '{{}}'::jsonb, $5, $5)
             RETURNING {PAGE_COLUMNS}"
        ))
        .bind(id)
        .bind(&req.image_url)
        .bind(&req.image_ref)
        .bind(&metadata)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_page_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Page>> {
        let row = sqlx::query(&format!("SELECT {PAGE_COLUMNS} FROM page WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_page_row).transpose()
    }

    async fn status(&self, id: Uuid) -> Result<Option<PageStatusView>> {
        let row = sqlx::query(
            "SELECT id, status::text AS status, error_message, updated_at FROM page WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(|row| {
            let status: String = row.get("status");
            Ok(PageStatusView {
                id: row.get("id"),
                status: status.parse()?,
                error_message: row.get("error_message"),
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }

    async fn mark_processing(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE page
             SET status = 'processing'::page_status, updated_at = $2
             WHERE id = $1 AND status IN ('uploading'::page_status, 'processing'::page_status)",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, PageStatus::Processing).await);
        }
        Ok(())
    }

    async fn rearm_for_retry(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE page
             SET status = 'processing'::page_status, error_message = NULL, updated_at = $2
             WHERE id = $1 AND status IN ('processing'::page_status, 'failed'::page_status)",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, PageStatus::Processing).await);
        }
        debug!(page_id = %id, "Page re-armed for retry");
        Ok(())
    }

    async fn complete_with_text(
        &self,
        id: Uuid,
        attempt_id: Uuid,
        result: &ExtractionResult,
    ) -> Result<bool> {
        let snapshot =
            serde_json::to_value(result).map_err(|e| Error::Serialization(e.to_string()))?;

        let updated = sqlx::query(
            "UPDATE page
             SET raw_ocr_text = $2,
                 clean_text = $3,
                 status = 'completed'::page_status,
                 error_message = NULL,
                 metadata = metadata || jsonb_build_object('extraction', $4::jsonb),
                 processing_steps = processing_steps
                     || jsonb_build_object('text_written', true, 'attempt_id', $5::text),
                 updated_at = $6
             WHERE id = $1
               AND status = 'processing'::page_status
               AND NOT COALESCE((processing_steps->>'text_written')::boolean, false)",
        )
        .bind(id)
        .bind(&result.raw_ocr_text)
        .bind(&result.clean_text)
        .bind(&snapshot)
        .bind(attempt_id.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }

        match self.get(id).await? {
            None => Err(Error::PageNotFound(id)),
            Some(page) if page.processing_steps.text_written => Ok(false),
            Some(page) => Err(Error::InvalidTransition {
                page_id: id,
                from: page.status,
                to: PageStatus::Completed,
            }),
        }
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE page
             SET status = 'failed'::page_status, error_message = $2, updated_at = $3
             WHERE id = $1 AND status = 'processing'::page_status",
        )
        .bind(id)
        .bind(error_message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, PageStatus::Failed).await);
        }
        Ok(())
    }

    async fn mark_tags_reconciled(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE page
             SET processing_steps = processing_steps || '{\"tags_reconciled\": true}'::jsonb,
                 updated_at = $2
             WHERE id = $1",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::PageNotFound(id));
        }
        Ok(())
    }

    async fn list(&self, req: ListPagesRequest) -> Result<ListPagesResponse> {
        let limit = clamp_limit(req.limit);
        let offset = clamp_offset(req.offset);
        let status = req.status.map(PageStatus::as_str);

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM page WHERE ($1::page_status IS NULL OR status = $1::page_status)",
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        let rows = sqlx::query(&format!(
            "SELECT {PAGE_COLUMNS} FROM page
             WHERE ($1::page_status IS NULL OR status = $1::page_status)
             ORDER BY created_at DESC
             LIMIT $2 OFFSET $3"
        ))
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let pages = rows
            .iter()
            .map(Self::parse_page_row)
            .collect::<Result<Vec<_>>>()?;
        let ids: Vec<Uuid> = pages.iter().map(|p| p.id).collect();
        let mut tags = self.tags_for_pages(&ids).await?;

        let pages = pages
            .into_iter()
            .map(|page| PageWithTags {
                tags: tags.remove(&page.id).unwrap_or_default(),
                page,
            })
            .collect();

        Ok(ListPagesResponse {
            pages,
            total,
            limit,
            offset,
        })
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM page WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }
}
