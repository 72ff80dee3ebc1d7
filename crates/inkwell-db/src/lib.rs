//! # inkwell-db
//!
//! PostgreSQL persistence layer for inkwell.
//!
//! This crate provides:
//! - Connection pool management
//! - Repository implementations for pages, knowledge units, and tags
//! - The durable processing job queue
//! - Filesystem blob storage for uploaded images
//!
//! ## Example
//!
//! ```rust,ignore
//! use inkwell_db::{Database, PageRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/inkwell").await?;
//!     db.migrate().await?;
//!
//!     if let Some(status) = db.pages.status(page_id).await? {
//!         println!("{}: {}", status.id, status.status);
//!     }
//!     Ok(())
//! }
//! ```
pub mod file_storage;
pub mod jobs;
pub mod knowledge_units;
pub mod pages;
pub mod pool;
pub mod tags;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use inkwell_core::*;

pub use file_storage::{FilesystemBlobStore, StorageConfig, StorageMode};
pub use jobs::PgJobQueue;
pub use knowledge_units::PgKnowledgeUnitRepository;
pub use pages::PgPageRepository;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use tags::PgTagRepository;

use std::sync::Arc;

use uuid::Uuid;

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Page records and lifecycle transitions.
    pub pages: Arc<PgPageRepository>,
    /// Knowledge units extracted from pages.
    pub knowledge_units: Arc<PgKnowledgeUnitRepository>,
    /// Canonical tags and page links.
    pub tags: Arc<PgTagRepository>,
    /// Processing job queue.
    pub jobs: Arc<PgJobQueue>,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::default())
    }

    /// Create a new Database instance whose queue uses `policy`.
    pub fn with_retry_policy(pool: sqlx::Pool<sqlx::Postgres>, policy: RetryPolicy) -> Self {
        Self {
            pages: Arc::new(PgPageRepository::new(pool.clone())),
            knowledge_units: Arc::new(PgKnowledgeUnitRepository::new(pool.clone())),
            tags: Arc::new(PgTagRepository::new(pool.clone())),
            jobs: Arc::new(PgJobQueue::with_policy(pool.clone(), policy)),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration and retry policy.
    pub async fn connect_with_config(
        url: &str,
        config: PoolConfig,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::with_retry_policy(pool, policy))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// Page with its knowledge units and tags.
    pub async fn page_detail(&self, id: Uuid) -> Result<Option<PageDetail>> {
        let Some(page) = self.pages.get(id).await? else {
            return Ok(None);
        };
        let knowledge_units = self.knowledge_units.list_for_page(id).await?;
        let tags = self.tags.list_for_page(id).await?;
        Ok(Some(PageDetail {
            page,
            knowledge_units,
            tags,
        }))
    }
}
