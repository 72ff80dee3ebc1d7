//! Job handler contract between the worker and the work it runs.

use async_trait::async_trait;
use uuid::Uuid;

use inkwell_core::{ProcessingJob, QueuedJob};

/// Context provided to job handlers.
pub struct JobContext {
    /// The job being processed.
    pub job: QueuedJob,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(job: QueuedJob) -> Self {
        Self { job }
    }

    /// Page this job processes.
    pub fn page_id(&self) -> Uuid {
        self.job.payload.page_id
    }

    /// Get the job payload.
    pub fn payload(&self) -> &ProcessingJob {
        &self.job.payload
    }

    /// 1-based delivery number of this run.
    pub fn attempt(&self) -> i32 {
        self.job.attempts
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed; acknowledge it.
    Success,
    /// Job failed in a way no retry can fix; dead-letter it now.
    Failed(String),
    /// Job failed transiently; retry with backoff until attempts run out.
    Retry(String),
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;

    /// Called after the queue gave up on a job.
    ///
    /// Lets the handler leave its own records in a terminal state when the
    /// run was cut short (e.g. by the worker's timeout).
    async fn on_dead_letter(&self, _job: &QueuedJob, _error: &str) {}
}
