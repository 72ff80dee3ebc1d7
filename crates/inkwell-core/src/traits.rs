//! Core traits for inkwell abstractions.
//!
//! These traits define the seams between the processing pipeline and its
//! collaborators (database, queue, blob store, vision model), enabling
//! pluggable backends and in-memory test doubles.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::extraction::ExtractionResult;
use crate::models::*;

// =============================================================================
// PAGE REPOSITORY
// =============================================================================

/// Repository for page records and their lifecycle transitions.
///
/// Every transition method is conditional on the current status, so two
/// processors racing on the same page cannot move it along an illegal edge.
#[async_trait]
pub trait PageRepository: Send + Sync {
    /// Insert a new page in `uploading`.
    async fn create(&self, req: CreatePageRequest) -> Result<Page>;

    /// Fetch a page by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Page>>;

    /// Fetch the polling projection of a page.
    async fn status(&self, id: Uuid) -> Result<Option<PageStatusView>>;

    /// `uploading|processing -> processing`.
    ///
    /// Errors with `PageNotFound` when the row is gone and `InvalidTransition`
    /// from any other state.
    async fn mark_processing(&self, id: Uuid) -> Result<()>;

    /// `failed|processing -> processing` for a redelivered job; clears the
    /// previous attempt's error message.
    async fn rearm_for_retry(&self, id: Uuid) -> Result<()>;

    /// Write extracted text and move `processing -> completed` in one statement.
    ///
    /// The validated extraction is stored as the page's snapshot so later
    /// steps can be resumed without calling the model again. Returns `false`
    /// when the text was already written by an earlier attempt.
    async fn complete_with_text(
        &self,
        id: Uuid,
        attempt_id: Uuid,
        result: &ExtractionResult,
    ) -> Result<bool>;

    /// `processing -> failed` with a human-readable cause.
    async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<()>;

    /// Record that tag reconciliation finished for this page.
    async fn mark_tags_reconciled(&self, id: Uuid) -> Result<()>;

    /// List pages with optional status filter and pagination.
    async fn list(&self, req: ListPagesRequest) -> Result<ListPagesResponse>;

    /// Delete a page; knowledge units and tag links cascade.
    ///
    /// Returns `false` when no such page existed.
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

// =============================================================================
// KNOWLEDGE UNIT REPOSITORY
// =============================================================================

/// Repository for knowledge units.
#[async_trait]
pub trait KnowledgeUnitRepository: Send + Sync {
    /// Insert all units for a page atomically and mark the step done.
    ///
    /// Returns the number of rows inserted; `0` when an earlier attempt
    /// already materialized this page's units. An empty batch only marks the
    /// step done.
    async fn insert_batch(&self, page_id: Uuid, units: &[NewKnowledgeUnit]) -> Result<usize>;

    /// Units belonging to one page, in extraction order.
    async fn list_for_page(&self, page_id: Uuid) -> Result<Vec<KnowledgeUnit>>;

    /// Units across all pages with optional type filter.
    async fn list(&self, req: ListKnowledgeUnitsRequest) -> Result<ListKnowledgeUnitsResponse>;
}

// =============================================================================
// TAG REPOSITORY
// =============================================================================

/// Repository for canonical tags and page associations.
#[async_trait]
pub trait TagRepository: Send + Sync {
    /// Insert a tag unless the name exists; returns the row only if inserted.
    async fn insert_or_ignore(&self, name: &str) -> Result<Option<Tag>>;

    /// Look up a tag by its normalized name.
    async fn find_by_name(&self, name: &str) -> Result<Option<Tag>>;

    /// Link a tag to a page; returns `false` if the link already existed.
    async fn link(&self, page_id: Uuid, tag_id: Uuid) -> Result<bool>;

    /// All tags, newest first.
    async fn list(&self) -> Result<Vec<Tag>>;

    /// Tags linked to one page, by name.
    async fn list_for_page(&self, page_id: Uuid) -> Result<Vec<Tag>>;
}

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Durable hand-off between submission and processing.
///
/// Delivery is at-least-once: a job leaves the pending set only through
/// [`JobQueue::complete`] or by being dead-lettered in [`JobQueue::fail`].
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Durably record a job and return its ID.
    async fn enqueue(&self, job: ProcessingJob) -> Result<Uuid>;

    /// Claim the next due job, marking it running and counting the attempt.
    async fn claim_next(&self) -> Result<Option<QueuedJob>>;

    /// Acknowledge a job whose handler succeeded.
    async fn complete(&self, job_id: Uuid) -> Result<()>;

    /// Record a handler failure and either reschedule or dead-letter.
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<FailOutcome>;

    /// Dead-letter immediately, for failures no retry can fix.
    async fn dead_letter(&self, job_id: Uuid, error: &str) -> Result<()>;

    /// Get job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<QueuedJob>>;

    /// Number of jobs waiting to be claimed.
    async fn pending_count(&self) -> Result<i64>;

    /// Most recent dead-lettered jobs.
    async fn list_dead(&self, limit: i64) -> Result<Vec<QueuedJob>>;

    /// Return running jobs older than `older_than` to pending.
    async fn requeue_stale(&self, older_than: Duration) -> Result<u64>;
}

// =============================================================================
// BLOB STORE
// =============================================================================

/// Storage for uploaded page images.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under a fresh name with the given extension.
    async fn put(&self, data: &[u8], extension: &str) -> Result<BlobRef>;

    /// Read stored bytes.
    async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>>;

    /// Public URL for a stored blob.
    fn url_for(&self, blob: &BlobRef) -> String;

    /// Remove stored bytes; missing blobs are not an error.
    async fn delete(&self, blob: &BlobRef) -> Result<()>;
}

// =============================================================================
// EXTRACTION BACKEND
// =============================================================================

/// Vision capability turning a page image into structured content.
///
/// Implementations validate model output before returning; an `Ok` result
/// always satisfies the [`ExtractionResult`] shape.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Extract structured content from image bytes.
    async fn extract(&self, image_data: &[u8], mime_type: &str) -> Result<ExtractionResult>;

    /// Check if the backend is reachable.
    async fn health_check(&self) -> Result<bool>;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}
