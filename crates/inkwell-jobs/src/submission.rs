//! Page submission: validate the upload, persist it, and hand it to the queue.
//!
//! Ordering is store blob → create page (`uploading`) → `processing` →
//! enqueue. Each step undoes what the earlier ones left behind when it fails,
//! so a rejected submission never leaves a page nobody will process.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use inkwell_core::defaults::MAX_UPLOAD_BYTES;
use inkwell_core::{
    validate_upload, BlobRef, BlobStore, CreatePageRequest, Error, JobQueue, PageRepository,
    PageStatus, ProcessingJob, Result,
};

/// Submission limits.
#[derive(Debug, Clone)]
pub struct SubmissionConfig {
    /// Largest accepted upload in bytes.
    pub max_upload_bytes: u64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: MAX_UPLOAD_BYTES,
        }
    }
}

impl SubmissionConfig {
    /// Read `MAX_UPLOAD_BYTES`, falling back to 20 MiB.
    pub fn from_env() -> Self {
        let max_upload_bytes = std::env::var("MAX_UPLOAD_BYTES")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(MAX_UPLOAD_BYTES);
        Self { max_upload_bytes }
    }

    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }
}

/// What the caller gets back for an accepted page.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReceipt {
    pub page_id: Uuid,
    pub job_id: Uuid,
    pub image_url: String,
    pub status: PageStatus,
}

/// Accepts page images and queues them for processing.
pub struct SubmissionService {
    pages: Arc<dyn PageRepository>,
    queue: Arc<dyn JobQueue>,
    blobs: Arc<dyn BlobStore>,
    config: SubmissionConfig,
}

impl SubmissionService {
    pub fn new(
        pages: Arc<dyn PageRepository>,
        queue: Arc<dyn JobQueue>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            pages,
            queue,
            blobs,
            config: SubmissionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SubmissionConfig) -> Self {
        self.config = config;
        self
    }

    /// Submit one page image.
    ///
    /// Validation failures return `Submission` with nothing persisted. An
    /// enqueue failure leaves the page `failed` with the cause recorded and
    /// also returns `Submission`.
    pub async fn submit(&self, filename: &str, data: &[u8]) -> Result<SubmissionReceipt> {
        let upload = validate_upload(filename, data, self.config.max_upload_bytes)?;

        let blob = self.blobs.put(data, &upload.extension).await?;
        let image_url = self.blobs.url_for(&blob);

        let page = match self
            .pages
            .create(CreatePageRequest {
                image_url: image_url.clone(),
                image_ref: blob.as_str().to_string(),
                metadata: Some(json!({
                    "original_filename": filename,
                    "mime_type": upload.mime_type,
                    "size_bytes": data.len(),
                })),
            })
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.discard_blob(&blob).await;
                return Err(e);
            }
        };

        if let Err(e) = self.pages.mark_processing(page.id).await {
            warn!(page_id = %page.id, error = %e, "Could not start processing, discarding page");
            if let Err(del) = self.pages.delete(page.id).await {
                warn!(page_id = %page.id, error = %del, "Could not delete abandoned page");
            }
            self.discard_blob(&blob).await;
            return Err(e);
        }

        let job = ProcessingJob {
            page_id: page.id,
            image_ref: blob.as_str().to_string(),
        };
        let job_id = match self.queue.enqueue(job).await {
            Ok(id) => id,
            Err(e) => {
                let message = format!("Failed to enqueue processing job: {}", e);
                if let Err(mark) = self.pages.mark_failed(page.id, &message).await {
                    warn!(page_id = %page.id, error = %mark, "Could not mark page failed");
                }
                return Err(Error::Submission(message));
            }
        };

        info!(
            subsystem = "submission",
            op = "submit",
            page_id = %page.id,
            job_id = %job_id,
            size_bytes = data.len(),
            "Page submitted"
        );

        Ok(SubmissionReceipt {
            page_id: page.id,
            job_id,
            image_url,
            status: PageStatus::Processing,
        })
    }

    /// Delete a page and its stored image.
    ///
    /// Returns `false` when the page did not exist.
    pub async fn delete_page(&self, page_id: Uuid) -> Result<bool> {
        let Some(page) = self.pages.get(page_id).await? else {
            return Ok(false);
        };
        if !self.pages.delete(page_id).await? {
            return Ok(false);
        }
        self.discard_blob(&BlobRef::new(page.image_ref)).await;
        info!(subsystem = "submission", op = "delete", page_id = %page_id, "Page deleted");
        Ok(true)
    }

    async fn discard_blob(&self, blob: &BlobRef) {
        if let Err(e) = self.blobs.delete(blob).await {
            warn!(blob = %blob.as_str(), error = %e, "Could not remove stored image");
        }
    }
}
