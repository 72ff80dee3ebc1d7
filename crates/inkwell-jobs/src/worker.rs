//! Job worker: claims queued jobs and runs them with bounded concurrency.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use inkwell_core::defaults::{
    EVENT_BUS_CAPACITY, JOB_POLL_INTERVAL_MS, JOB_STALE_AFTER_SECS, JOB_TIMEOUT_SECS,
    WORKER_CONCURRENCY,
};
use inkwell_core::{Error, FailOutcome, JobQueue, QueuedJob, Result};

use crate::handler::{JobContext, JobHandler, JobResult};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds when the queue is empty.
    pub poll_interval_ms: u64,
    /// Maximum number of jobs processed at once.
    pub concurrency: usize,
    /// Hard limit on a single job run.
    pub job_timeout: Duration,
    /// Running jobs older than this are re-queued at startup.
    pub stale_after: Duration,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: JOB_POLL_INTERVAL_MS,
            concurrency: WORKER_CONCURRENCY,
            job_timeout: Duration::from_secs(JOB_TIMEOUT_SECS),
            stale_after: Duration::from_secs(JOB_STALE_AFTER_SECS),
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `WORKER_CONCURRENCY` | `2` | Pages processed in parallel |
    /// | `JOB_POLL_INTERVAL_MS` | `1000` | Polling interval when queue is empty |
    /// | `JOB_TIMEOUT_SECS` | `300` | Per-job execution limit |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled = std::env::var("WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let concurrency = std::env::var("WORKER_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.concurrency)
            .max(1);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.poll_interval_ms);

        let job_timeout = std::env::var("JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.job_timeout);

        Self {
            poll_interval_ms,
            concurrency,
            job_timeout,
            enabled,
            ..defaults
        }
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent jobs.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the per-job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Worker started.
    WorkerStarted,
    /// A job delivery started.
    JobStarted {
        job_id: Uuid,
        page_id: Uuid,
        attempt: i32,
    },
    /// A job completed and was acknowledged.
    JobCompleted { job_id: Uuid, page_id: Uuid },
    /// A job failed and will be delivered again at `run_at`.
    JobRetryScheduled {
        job_id: Uuid,
        page_id: Uuid,
        attempt: i32,
        run_at: DateTime<Utc>,
        error: String,
    },
    /// A job will not be delivered again.
    JobDeadLettered {
        job_id: Uuid,
        page_id: Uuid,
        attempts: i32,
        error: String,
    },
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    ///
    /// The worker stops claiming and lets in-flight jobs finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Wait for the worker loop to exit.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Worker task failed: {}", e)))
    }
}

/// Job worker that processes jobs from the queue.
pub struct JobWorker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    notify: Option<Arc<Notify>>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            queue,
            handler,
            config,
            notify: None,
            event_tx,
        }
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let task = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Run the worker loop.
    ///
    /// Keeps up to `concurrency` jobs in flight, claiming a new one as soon
    /// as a slot frees. Sleeps only when the queue has nothing due, and wakes
    /// early when the queue signals an enqueue.
    #[instrument(skip(self, shutdown_rx), fields(handler = self.handler.name()))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        match self.queue.requeue_stale(self.config.stale_after).await {
            Ok(0) => {}
            Ok(n) => info!(requeued = n, "Recovered orphaned jobs"),
            Err(e) => warn!(error = %e, "Failed to recover orphaned jobs"),
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            concurrency = self.config.concurrency,
            job_timeout_secs = self.config.job_timeout.as_secs(),
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut tasks = JoinSet::new();
        let mut shutting_down = false;

        loop {
            if shutting_down && tasks.is_empty() {
                break;
            }

            while !shutting_down && tasks.len() < self.config.concurrency {
                match self.claim_job().await {
                    Some(job) => {
                        let worker = self.clone_refs();
                        tasks.spawn(async move {
                            worker.execute_job(job).await;
                        });
                    }
                    None => break,
                }
            }

            let notify = self.notify.clone();
            let in_flight = tasks.len();
            tokio::select! {
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        error!(error = ?e, "Job task panicked");
                    }
                }
                _ = shutdown_rx.recv(), if !shutting_down => {
                    info!(in_flight, "Job worker received shutdown signal");
                    shutting_down = true;
                }
                _ = wait_for_enqueue(notify), if !shutting_down => {}
                _ = sleep(poll_interval), if !shutting_down => {}
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }

    /// Claim the next due job, logging queue errors.
    async fn claim_job(&self) -> Option<QueuedJob> {
        match self.queue.claim_next().await {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "Failed to claim job");
                None
            }
        }
    }

    /// Clone references needed for spawned job tasks.
    fn clone_refs(&self) -> JobWorkerRef {
        JobWorkerRef {
            queue: self.queue.clone(),
            handler: self.handler.clone(),
            event_tx: self.event_tx.clone(),
            job_timeout: self.config.job_timeout,
        }
    }
}

async fn wait_for_enqueue(notify: Option<Arc<Notify>>) {
    match notify {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

/// Lightweight reference bundle for executing a single job in a spawned task.
struct JobWorkerRef {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    event_tx: broadcast::Sender<WorkerEvent>,
    job_timeout: Duration,
}

impl JobWorkerRef {
    /// Execute a single claimed job and settle it with the queue.
    async fn execute_job(self, job: QueuedJob) {
        let start = Instant::now();
        let job_id = job.id;
        let page_id = job.payload.page_id;
        let attempt = job.attempts;

        info!(%job_id, %page_id, attempt, "Processing job");
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            page_id,
            attempt,
        });

        let ctx = JobContext::new(job.clone());
        let result = match tokio::time::timeout(self.job_timeout, self.handler.execute(ctx)).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(%job_id, %page_id, "Job exceeded timeout of {}s", self.job_timeout.as_secs());
                JobResult::Retry(format!(
                    "Job exceeded timeout of {}s",
                    self.job_timeout.as_secs()
                ))
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            JobResult::Success => match self.queue.complete(job_id).await {
                Ok(()) => {
                    info!(%job_id, %page_id, duration_ms, "Job completed successfully");
                    let _ = self
                        .event_tx
                        .send(WorkerEvent::JobCompleted { job_id, page_id });
                }
                Err(e) => error!(error = %e, %job_id, "Failed to mark job as completed"),
            },
            JobResult::Retry(error) => match self.queue.fail(job_id, &error).await {
                Ok(FailOutcome::Retry { attempt, run_at }) => {
                    warn!(%job_id, %page_id, attempt, %run_at, %error, duration_ms, "Job failed, retry scheduled");
                    let _ = self.event_tx.send(WorkerEvent::JobRetryScheduled {
                        job_id,
                        page_id,
                        attempt,
                        run_at,
                        error,
                    });
                }
                Ok(FailOutcome::DeadLettered { attempts }) => {
                    self.report_dead_letter(&job, attempts, error).await;
                }
                Err(e) => error!(error = %e, %job_id, "Failed to record job failure"),
            },
            JobResult::Failed(error) => match self.queue.dead_letter(job_id, &error).await {
                Ok(()) => self.report_dead_letter(&job, attempt, error).await,
                Err(e) => error!(error = %e, %job_id, "Failed to dead-letter job"),
            },
        }
    }

    async fn report_dead_letter(&self, job: &QueuedJob, attempts: i32, error: String) {
        let exhausted = Error::RetriesExhausted {
            job_id: job.id,
            attempts,
            last_error: error.clone(),
        };
        error!(job_id = %job.id, page_id = %job.payload.page_id, "{}", exhausted);

        self.handler.on_dead_letter(job, &error).await;
        debug!(job_id = %job.id, "Dead-letter hook finished");

        let _ = self.event_tx.send(WorkerEvent::JobDeadLettered {
            job_id: job.id,
            page_id: job.payload.page_id,
            attempts,
            error,
        });
    }
}

/// Builder for creating a job worker.
pub struct WorkerBuilder {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    notify: Option<Arc<Notify>>,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            queue,
            handler,
            config: WorkerConfig::default(),
            notify: None,
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Wake idle workers through the queue's enqueue notification.
    pub fn with_notify(mut self, notify: Arc<Notify>) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Build and return the worker.
    pub fn build(self) -> JobWorker {
        let mut worker = JobWorker::new(self.queue, self.handler, self.config);
        worker.notify = self.notify;
        worker
    }
}
