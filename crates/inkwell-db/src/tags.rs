//! Tag repository implementation.
//!
//! Names arrive already normalized; the table's unique constraint on `name`
//! is what makes concurrent creation of the same tag safe.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use inkwell_core::{new_v7, Error, Result, Tag, TagRepository};

pub(crate) fn tag_from_row(row: &PgRow) -> Tag {
    Tag {
        id: row.get("id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
    }
}

/// PostgreSQL implementation of TagRepository.
pub struct PgTagRepository {
    pool: Pool<Postgres>,
}

impl PgTagRepository {
    /// Create a new PgTagRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TagRepository for PgTagRepository {
    async fn insert_or_ignore(&self, name: &str) -> Result<Option<Tag>> {
        let row = sqlx::query(
            "INSERT INTO tag (id, name, created_at) VALUES ($1, $2, $3)
             ON CONFLICT (name) DO NOTHING
             RETURNING id, name, created_at",
        )
        .bind(new_v7())
        .bind(name)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.as_ref().map(tag_from_row))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Tag>> {
        let row = sqlx::query("SELECT id, name, created_at FROM tag WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(row.as_ref().map(tag_from_row))
    }

    async fn link(&self, page_id: Uuid, tag_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO page_tag (page_id, tag_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(page_id)
        .bind(tag_id)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            // Page deleted under us: page_tag's FK rejects the insert.
            sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                if db.constraint() == Some("page_tag_page_id_fkey") {
                    Error::PageNotFound(page_id)
                } else {
                    Error::NotFound(format!("Tag {}", tag_id))
                }
            }
            other => Error::Database(other),
        })?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<Tag>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM tag ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(rows.iter().map(tag_from_row).collect())
    }

    async fn list_for_page(&self, page_id: Uuid) -> Result<Vec<Tag>> {
        let rows = sqlx::query(
            "SELECT t.id, t.name, t.created_at
             FROM tag t
             JOIN page_tag pt ON pt.tag_id = t.id
             WHERE pt.page_id = $1
             ORDER BY t.name",
        )
        .bind(page_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(tag_from_row).collect())
    }
}
