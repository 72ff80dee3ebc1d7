//! Page processor: turns one queued page into text, knowledge units, and tags.
//!
//! A run walks the page's processing ledger and performs only the steps that
//! have not durably completed:
//!
//! 1. write text (and move the page to `completed`) from a fresh extraction
//! 2. insert knowledge units
//! 3. reconcile tags
//!
//! The extraction result is stored on the page together with the text, so a
//! retry that resumes at step 2 or 3 reuses it instead of calling the model
//! again. A page deleted at any point ends the run successfully.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use inkwell_core::defaults::VISION_TIMEOUT_SECS;
use inkwell_core::upload::mime_from_extension;
use inkwell_core::{
    new_v7, BlobRef, BlobStore, Error, ExtractionBackend, ExtractionResult,
    KnowledgeUnitRepository, Page, PageRepository, PageStatus, QueuedJob, Result,
    TagRepository,
};

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::tag_reconciler::TagReconciler;

/// How a processing run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// All pending steps ran and the page is fully processed.
    Completed,
    /// A previous delivery already finished every step.
    AlreadyComplete,
    /// The page was deleted before or during processing.
    PageMissing,
}

/// Processes page jobs against the page store, blob store, and vision model.
pub struct PageProcessor {
    pages: Arc<dyn PageRepository>,
    units: Arc<dyn KnowledgeUnitRepository>,
    tags: TagReconciler,
    blobs: Arc<dyn BlobStore>,
    extractor: Arc<dyn ExtractionBackend>,
    extraction_timeout: Duration,
}

impl PageProcessor {
    pub fn new(
        pages: Arc<dyn PageRepository>,
        units: Arc<dyn KnowledgeUnitRepository>,
        tags: Arc<dyn TagRepository>,
        blobs: Arc<dyn BlobStore>,
        extractor: Arc<dyn ExtractionBackend>,
    ) -> Self {
        Self {
            pages,
            units,
            tags: TagReconciler::new(tags),
            blobs,
            extractor,
            extraction_timeout: Duration::from_secs(VISION_TIMEOUT_SECS),
        }
    }

    /// Bound on a single extraction call; hitting it fails the attempt.
    pub fn with_extraction_timeout(mut self, timeout: Duration) -> Self {
        self.extraction_timeout = timeout;
        self
    }

    /// Process one delivery of a page job.
    ///
    /// `Err` means the attempt failed and the queue should retry or
    /// dead-letter it. Extraction and text-write failures mark the page
    /// `failed` first.
    pub async fn process(&self, job: &QueuedJob) -> Result<ProcessOutcome> {
        let page_id = job.payload.page_id;
        match self.run(job).await {
            Err(Error::PageNotFound(_)) => {
                info!(page_id = %page_id, job_id = %job.id, "Page deleted, nothing to process");
                Ok(ProcessOutcome::PageMissing)
            }
            other => other,
        }
    }

    async fn run(&self, job: &QueuedJob) -> Result<ProcessOutcome> {
        let page_id = job.payload.page_id;

        let Some(page) = self.pages.get(page_id).await? else {
            return Err(Error::PageNotFound(page_id));
        };

        if page.status == PageStatus::Completed && page.processing_steps.is_complete() {
            debug!(page_id = %page_id, job_id = %job.id, "Page already processed");
            return Ok(ProcessOutcome::AlreadyComplete);
        }

        self.enter_processing(&page, job).await?;

        let extraction = if page.processing_steps.text_written {
            debug!(page_id = %page_id, "Text already written, resuming from snapshot");
            stored_extraction(&page)?
        } else {
            self.extract_and_write(&page, job).await?
        };

        if !page.processing_steps.units_inserted {
            let inserted = self
                .units
                .insert_batch(page_id, &extraction.knowledge_units)
                .await
                .inspect_err(|e| log_post_completion_failure(page_id, "insert_units", e))?;
            debug!(page_id = %page_id, inserted, "Knowledge units written");
        }

        if !page.processing_steps.tags_reconciled {
            self.tags
                .reconcile(page_id, &extraction.suggested_tags)
                .await
                .inspect_err(|e| log_post_completion_failure(page_id, "reconcile_tags", e))?;
            self.pages.mark_tags_reconciled(page_id).await?;
        }

        Ok(ProcessOutcome::Completed)
    }

    /// Move the page into `processing` unless it is resuming after completion.
    async fn enter_processing(&self, page: &Page, job: &QueuedJob) -> Result<()> {
        match page.status {
            PageStatus::Completed => Ok(()),
            PageStatus::Failed if job.is_redelivery() => {
                info!(
                    page_id = %page.id,
                    job_id = %job.id,
                    attempt = job.attempts,
                    "Retrying failed page"
                );
                self.pages.rearm_for_retry(page.id).await
            }
            PageStatus::Failed => Err(Error::InvalidTransition {
                page_id: page.id,
                from: PageStatus::Failed,
                to: PageStatus::Processing,
            }),
            PageStatus::Uploading | PageStatus::Processing => {
                self.pages.mark_processing(page.id).await
            }
        }
    }

    async fn extract_and_write(&self, page: &Page, job: &QueuedJob) -> Result<ExtractionResult> {
        let start = Instant::now();
        let blob = BlobRef::new(job.payload.image_ref.clone());

        let result = match self.extract(&blob).await {
            Ok(result) => result,
            Err(e) => {
                self.fail_page(page.id, &e).await?;
                return Err(e);
            }
        };

        let attempt_id = new_v7();
        let written = match self
            .pages
            .complete_with_text(page.id, attempt_id, &result)
            .await
        {
            Ok(written) => written,
            Err(Error::PageNotFound(id)) => return Err(Error::PageNotFound(id)),
            Err(e) => {
                self.fail_page(page.id, &e).await?;
                return Err(e);
            }
        };

        if !written {
            // A concurrent delivery got there first; continue with its snapshot.
            let Some(current) = self.pages.get(page.id).await? else {
                return Err(Error::PageNotFound(page.id));
            };
            return stored_extraction(&current);
        }

        info!(
            page_id = %page.id,
            job_id = %job.id,
            units = result.knowledge_units.len(),
            tags = result.suggested_tags.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Page text written"
        );
        Ok(result)
    }

    async fn extract(&self, blob: &BlobRef) -> Result<ExtractionResult> {
        let image = self.blobs.get(blob).await?;
        let mime_type = blob
            .extension()
            .map(|ext| mime_from_extension(&ext))
            .unwrap_or("image/jpeg");

        match tokio::time::timeout(
            self.extraction_timeout,
            self.extractor.extract(&image, mime_type),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Extraction(format!(
                "Extraction timed out after {}s",
                self.extraction_timeout.as_secs()
            ))),
        }
    }

    /// Record `cause` on the page. A page that vanished meanwhile surfaces
    /// as `PageNotFound`; other bookkeeping failures are only logged so the
    /// original cause reaches the queue.
    async fn fail_page(&self, page_id: Uuid, cause: &Error) -> Result<()> {
        warn!(page_id = %page_id, error = %cause, "Page processing failed");
        match self.pages.mark_failed(page_id, &cause.to_string()).await {
            Ok(()) => Ok(()),
            Err(Error::PageNotFound(id)) => Err(Error::PageNotFound(id)),
            Err(e) => {
                warn!(page_id = %page_id, error = %e, "Could not record page failure");
                Ok(())
            }
        }
    }
}

fn stored_extraction(page: &Page) -> Result<ExtractionResult> {
    let snapshot = page.metadata.get("extraction").cloned().ok_or_else(|| {
        Error::Internal(format!("Page {} has text but no extraction snapshot", page.id))
    })?;
    serde_json::from_value(snapshot)
        .map_err(|e| Error::Serialization(format!("extraction snapshot: {}", e)))
}

/// Text is already visible when later steps fail; the page stays
/// `completed` and the retry picks up the remaining steps.
fn log_post_completion_failure(page_id: Uuid, step: &str, error: &Error) {
    if !matches!(error, Error::PageNotFound(_)) {
        warn!(page_id = %page_id, step, error = %error, "Step failed after text was written");
    }
}

#[async_trait]
impl JobHandler for PageProcessor {
    fn name(&self) -> &'static str {
        "process_page"
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        match self.process(&ctx.job).await {
            Ok(_) => JobResult::Success,
            Err(e) if e.is_retryable() => JobResult::Retry(e.to_string()),
            Err(e) => {
                // Only takes effect while the page is still `processing`.
                if let Err(mark_err) = self
                    .pages
                    .mark_failed(ctx.page_id(), &e.to_string())
                    .await
                {
                    debug!(page_id = %ctx.page_id(), error = %mark_err, "Page not marked failed");
                }
                JobResult::Failed(e.to_string())
            }
        }
    }

    async fn on_dead_letter(&self, job: &QueuedJob, error: &str) {
        // Only a page still `processing` needs this: extraction failures were
        // already recorded, and completed pages keep their text.
        if let Ok(Some(page)) = self.pages.get(job.payload.page_id).await {
            if page.status == PageStatus::Processing {
                if let Err(e) = self.pages.mark_failed(page.id, error).await {
                    warn!(page_id = %page.id, error = %e, "Could not mark dead-lettered page failed");
                }
            }
        }
    }
}
