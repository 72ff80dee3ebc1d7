//! In-memory stores shared by the pipeline integration tests.
//!
//! `MemoryStore` enforces the same guarded transitions and ledger rules as
//! the PostgreSQL repositories, so the processor can be exercised without a
//! database.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use inkwell_core::defaults::{clamp_limit, clamp_offset};
use inkwell_core::{
    new_v7, BlobRef, BlobStore, CreatePageRequest, Error, ExtractionResult, FailOutcome, JobQueue,
    JobStatus, KnowledgeUnit, KnowledgeUnitRepository, KnowledgeUnitType, KnowledgeUnitWithPage,
    ListKnowledgeUnitsRequest, ListKnowledgeUnitsResponse, ListPagesRequest, ListPagesResponse,
    NewKnowledgeUnit, Page, PageRepository, PageStatus, PageStatusView, PageWithTags, ProcessingJob, ProcessingSteps,
    QueuedJob, Result, RetryPolicy, Tag, TagRepository, UnitPageRef,
};
use inkwell_inference::mock::MockExtractionBackend;
use inkwell_jobs::{PageProcessor, SubmissionService};

// =============================================================================
// PAGES, UNITS, TAGS
// =============================================================================

#[derive(Default)]
struct State {
    pages: HashMap<Uuid, Page>,
    units: Vec<KnowledgeUnit>,
    tags: Vec<Tag>,
    links: HashSet<(Uuid, Uuid)>,
}

/// Pages, knowledge units, and tags behind one lock.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    /// Remaining unit batch inserts that fail with a transient error.
    failing_unit_inserts: AtomicUsize,
    /// Remaining insert-or-read rounds in which a tag row "disappears".
    vanishing_tag_rounds: AtomicUsize,
    /// Delete the page right after its text is written.
    delete_after_text: AtomicBool,
    /// Refuse every move into `processing`.
    refuse_processing: AtomicBool,
    /// Remaining text writes that fail with a transient error.
    failing_text_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_unit_inserts(&self, n: usize) {
        self.failing_unit_inserts.store(n, Ordering::SeqCst);
    }

    pub fn vanish_tags_for_rounds(&self, n: usize) {
        self.vanishing_tag_rounds.store(n, Ordering::SeqCst);
    }

    pub fn delete_page_after_text(&self) {
        self.delete_after_text.store(true, Ordering::SeqCst);
    }

    pub fn refuse_processing(&self) {
        self.refuse_processing.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_text_writes(&self, n: usize) {
        self.failing_text_writes.store(n, Ordering::SeqCst);
    }

    pub fn page(&self, id: Uuid) -> Option<Page> {
        self.state.lock().unwrap().pages.get(&id).cloned()
    }

    pub fn page_count(&self) -> usize {
        self.state.lock().unwrap().pages.len()
    }

    pub fn units_for(&self, page_id: Uuid) -> Vec<KnowledgeUnit> {
        self.state
            .lock()
            .unwrap()
            .units
            .iter()
            .filter(|u| u.page_id == page_id)
            .cloned()
            .collect()
    }

    pub fn unit_count(&self) -> usize {
        self.state.lock().unwrap().units.len()
    }

    pub fn tag_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .tags
            .iter()
            .map(|t| t.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn tag_names_for(&self, page_id: Uuid) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .tags
            .iter()
            .filter(|t| state.links.contains(&(page_id, t.id)))
            .map(|t| t.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn link_count(&self) -> usize {
        self.state.lock().unwrap().links.len()
    }

    fn take_round(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn rejected(page: Option<&Page>, id: Uuid, to: PageStatus) -> Error {
    match page {
        Some(page) => Error::InvalidTransition {
            page_id: id,
            from: page.status,
            to,
        },
        None => Error::PageNotFound(id),
    }
}

#[async_trait]
impl PageRepository for MemoryStore {
    async fn create(&self, req: CreatePageRequest) -> Result<Page> {
        let now = Utc::now();
        let page = Page {
            id: new_v7(),
            image_url: req.image_url,
            image_ref: req.image_ref,
            raw_ocr_text: None,
            clean_text: None,
            status: PageStatus::Uploading,
            error_message: None,
            metadata: req.metadata.unwrap_or_else(|| json!({})),
            processing_steps: ProcessingSteps::default(),
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .unwrap()
            .pages
            .insert(page.id, page.clone());
        Ok(page)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Page>> {
        Ok(self.page(id))
    }

    async fn status(&self, id: Uuid) -> Result<Option<PageStatusView>> {
        Ok(self.page(id).map(|p| PageStatusView {
            id: p.id,
            status: p.status,
            error_message: p.error_message,
            updated_at: p.updated_at,
        }))
    }

    async fn mark_processing(&self, id: Uuid) -> Result<()> {
        if self.refuse_processing.load(Ordering::SeqCst) {
            return Err(Error::Internal("write rejected".into()));
        }
        let mut state = self.state.lock().unwrap();
        match state.pages.get_mut(&id) {
            Some(page)
                if matches!(page.status, PageStatus::Uploading | PageStatus::Processing) =>
            {
                page.status = PageStatus::Processing;
                page.updated_at = Utc::now();
                Ok(())
            }
            other => Err(rejected(other.map(|p| &*p), id, PageStatus::Processing)),
        }
    }

    async fn rearm_for_retry(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.pages.get_mut(&id) {
            Some(page) if page.status.can_rearm_for_retry() => {
                page.status = PageStatus::Processing;
                page.error_message = None;
                page.updated_at = Utc::now();
                Ok(())
            }
            other => Err(rejected(other.map(|p| &*p), id, PageStatus::Processing)),
        }
    }

    async fn complete_with_text(
        &self,
        id: Uuid,
        attempt_id: Uuid,
        result: &ExtractionResult,
    ) -> Result<bool> {
        if Self::take_round(&self.failing_text_writes) {
            return Err(Error::Internal("connection reset during text write".into()));
        }
        let snapshot = serde_json::to_value(result)?;
        let mut state = self.state.lock().unwrap();
        let Some(page) = state.pages.get_mut(&id) else {
            return Err(Error::PageNotFound(id));
        };
        if page.processing_steps.text_written {
            return Ok(false);
        }
        if page.status != PageStatus::Processing {
            return Err(rejected(Some(&*page), id, PageStatus::Completed));
        }

        page.raw_ocr_text = Some(result.raw_ocr_text.clone());
        page.clean_text = Some(result.clean_text.clone());
        page.status = PageStatus::Completed;
        page.error_message = None;
        page.metadata["extraction"] = snapshot;
        page.processing_steps.text_written = true;
        page.processing_steps.attempt_id = Some(attempt_id);
        page.updated_at = Utc::now();

        if self.delete_after_text.swap(false, Ordering::SeqCst) {
            delete_cascade(&mut state, id);
        }
        Ok(true)
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.pages.get_mut(&id) {
            Some(page) if page.status == PageStatus::Processing => {
                page.status = PageStatus::Failed;
                page.error_message = Some(error_message.to_string());
                page.updated_at = Utc::now();
                Ok(())
            }
            other => Err(rejected(other.map(|p| &*p), id, PageStatus::Failed)),
        }
    }

    async fn mark_tags_reconciled(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let page = state.pages.get_mut(&id).ok_or(Error::PageNotFound(id))?;
        page.processing_steps.tags_reconciled = true;
        Ok(())
    }

    async fn list(&self, req: ListPagesRequest) -> Result<ListPagesResponse> {
        let limit = clamp_limit(req.limit);
        let offset = clamp_offset(req.offset);
        let state = self.state.lock().unwrap();
        let mut pages: Vec<&Page> = state
            .pages
            .values()
            .filter(|p| req.status.map_or(true, |s| p.status == s))
            .collect();
        pages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = pages.len() as i64;
        let pages = pages
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|p| PageWithTags {
                page: p.clone(),
                tags: state
                    .tags
                    .iter()
                    .filter(|t| state.links.contains(&(p.id, t.id)))
                    .cloned()
                    .collect(),
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
        let mut state = self.state.lock().unwrap();
        Ok(delete_cascade(&mut state, id))
    }
}

fn delete_cascade(state: &mut State, id: Uuid) -> bool {
    let existed = state.pages.remove(&id).is_some();
    state.units.retain(|u| u.page_id != id);
    state.links.retain(|(page_id, _)| *page_id != id);
    existed
}

#[async_trait]
impl KnowledgeUnitRepository for MemoryStore {
    async fn insert_batch(&self, page_id: Uuid, units: &[NewKnowledgeUnit]) -> Result<usize> {
        if Self::take_round(&self.failing_unit_inserts) {
            return Err(Error::Internal("connection reset during unit insert".into()));
        }
        let mut state = self.state.lock().unwrap();
        let page = state
            .pages
            .get_mut(&page_id)
            .ok_or(Error::PageNotFound(page_id))?;
        if page.processing_steps.units_inserted {
            return Ok(0);
        }
        page.processing_steps.units_inserted = true;

        let now = Utc::now();
        for unit in units {
            state.units.push(KnowledgeUnit {
                id: new_v7(),
                page_id,
                unit_type: unit.unit_type,
                content: unit.content.clone(),
                metadata: unit.metadata.clone().unwrap_or_else(|| json!({})),
                created_at: now,
            });
        }
        Ok(units.len())
    }

    async fn list_for_page(&self, page_id: Uuid) -> Result<Vec<KnowledgeUnit>> {
        Ok(self.units_for(page_id))
    }

    async fn list(&self, req: ListKnowledgeUnitsRequest) -> Result<ListKnowledgeUnitsResponse> {
        let limit = clamp_limit(req.limit);
        let offset = clamp_offset(req.offset);
        let state = self.state.lock().unwrap();
        let matching: Vec<&KnowledgeUnit> = state
            .units
            .iter()
            .rev()
            .filter(|u| req.unit_type.map_or(true, |t| u.unit_type == t))
            .collect();
        Ok(ListKnowledgeUnitsResponse {
            total: matching.len() as i64,
            knowledge_units: matching
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .filter_map(|u| {
                    let page = state.pages.get(&u.page_id)?;
                    Some(KnowledgeUnitWithPage {
                        unit: u.clone(),
                        page: UnitPageRef {
                            id: page.id,
                            image_url: page.image_url.clone(),
                            created_at: page.created_at,
                        },
                    })
                })
                .collect(),
            limit,
            offset,
        })
    }
}

#[async_trait]
impl TagRepository for MemoryStore {
    async fn insert_or_ignore(&self, name: &str) -> Result<Option<Tag>> {
        // Give concurrent reconcilers a chance to interleave.
        tokio::task::yield_now().await;
        if self.vanishing_tag_rounds.load(Ordering::SeqCst) > 0 {
            return Ok(None);
        }
        let mut state = self.state.lock().unwrap();
        if state.tags.iter().any(|t| t.name == name) {
            return Ok(None);
        }
        let tag = Tag {
            id: new_v7(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        state.tags.push(tag.clone());
        Ok(Some(tag))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Tag>> {
        if Self::take_round(&self.vanishing_tag_rounds) {
            return Ok(None);
        }
        let state = self.state.lock().unwrap();
        Ok(state.tags.iter().find(|t| t.name == name).cloned())
    }

    async fn link(&self, page_id: Uuid, tag_id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if !state.pages.contains_key(&page_id) {
            return Err(Error::PageNotFound(page_id));
        }
        if !state.tags.iter().any(|t| t.id == tag_id) {
            return Err(Error::NotFound(format!("Tag {}", tag_id)));
        }
        Ok(state.links.insert((page_id, tag_id)))
    }

    async fn list(&self) -> Result<Vec<Tag>> {
        let mut tags = self.state.lock().unwrap().tags.clone();
        tags.reverse();
        Ok(tags)
    }

    async fn list_for_page(&self, page_id: Uuid) -> Result<Vec<Tag>> {
        let state = self.state.lock().unwrap();
        let mut tags: Vec<Tag> = state
            .tags
            .iter()
            .filter(|t| state.links.contains(&(page_id, t.id)))
            .cloned()
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }
}

// =============================================================================
// QUEUE
// =============================================================================

/// Job queue with the PostgreSQL queue's claim/fail rules and no backoff wait.
pub struct MemoryQueue {
    jobs: Mutex<Vec<QueuedJob>>,
    policy: RetryPolicy,
    fail_enqueue: AtomicBool,
}

impl MemoryQueue {
    pub fn new(max_attempts: i32) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(Vec::new()),
            policy: RetryPolicy::default()
                .with_max_attempts(max_attempts)
                .with_base_delay(Duration::ZERO),
            fail_enqueue: AtomicBool::new(false),
        })
    }

    pub fn reject_enqueues(&self) {
        self.fail_enqueue.store(true, Ordering::SeqCst);
    }

    pub fn job(&self, id: Uuid) -> Option<QueuedJob> {
        self.jobs.lock().unwrap().iter().find(|j| j.id == id).cloned()
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.status == status)
            .count()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: ProcessingJob) -> Result<Uuid> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(Error::Internal("queue unavailable".into()));
        }
        let now = Utc::now();
        let queued = QueuedJob {
            id: new_v7(),
            payload: job,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.policy.max_attempts,
            run_at: now,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        let id = queued.id;
        self.jobs.lock().unwrap().push(queued);
        Ok(id)
    }

    async fn claim_next(&self) -> Result<Option<QueuedJob>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs
            .iter_mut()
            .find(|j| j.status == JobStatus::Pending && j.run_at <= now)
        else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.started_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| Error::NotFound(format!("Job {}", job_id)))?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<FailOutcome> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| Error::NotFound(format!("Job {}", job_id)))?;
        job.last_error = Some(error.to_string());
        if self.policy.should_retry(job.attempts) {
            job.status = JobStatus::Pending;
            job.run_at = Utc::now();
            Ok(FailOutcome::Retry {
                attempt: job.attempts,
                run_at: job.run_at,
            })
        } else {
            job.status = JobStatus::Dead;
            job.completed_at = Some(Utc::now());
            Ok(FailOutcome::DeadLettered {
                attempts: job.attempts,
            })
        }
    }

    async fn dead_letter(&self, job_id: Uuid, error: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| Error::NotFound(format!("Job {}", job_id)))?;
        job.status = JobStatus::Dead;
        job.last_error = Some(error.to_string());
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<QueuedJob>> {
        Ok(self.job(job_id))
    }

    async fn pending_count(&self) -> Result<i64> {
        Ok(self.count_with_status(JobStatus::Pending) as i64)
    }

    async fn list_dead(&self, limit: i64) -> Result<Vec<QueuedJob>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.status == JobStatus::Dead)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn requeue_stale(&self, _older_than: Duration) -> Result<u64> {
        Ok(0)
    }
}

// =============================================================================
// BLOBS
// =============================================================================

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: &[u8], extension: &str) -> Result<BlobRef> {
        let name = format!("{}.{}", Uuid::new_v4(), extension);
        self.blobs
            .lock()
            .unwrap()
            .insert(name.clone(), data.to_vec());
        Ok(BlobRef::new(name))
    }

    async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(blob.as_str())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Blob {}", blob)))
    }

    fn url_for(&self, blob: &BlobRef) -> String {
        format!("/uploads/{}", blob)
    }

    async fn delete(&self, blob: &BlobRef) -> Result<()> {
        self.blobs.lock().unwrap().remove(blob.as_str());
        Ok(())
    }
}

// =============================================================================
// HARNESS
// =============================================================================

/// Minimal JPEG header accepted by upload validation.
pub const JPEG_BYTES: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

/// Everything a pipeline test needs, wired together.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub blobs: Arc<MemoryBlobStore>,
    pub extractor: MockExtractionBackend,
}

impl Harness {
    pub fn new(extractor: MockExtractionBackend) -> Self {
        Self::with_max_attempts(extractor, 2)
    }

    pub fn with_max_attempts(extractor: MockExtractionBackend, max_attempts: i32) -> Self {
        Self {
            store: MemoryStore::new(),
            queue: MemoryQueue::new(max_attempts),
            blobs: MemoryBlobStore::new(),
            extractor,
        }
    }

    pub fn processor(&self) -> PageProcessor {
        PageProcessor::new(
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            self.blobs.clone(),
            Arc::new(self.extractor.clone()),
        )
    }

    pub fn submissions(&self) -> SubmissionService {
        SubmissionService::new(self.store.clone(), self.queue.clone(), self.blobs.clone())
    }

    /// Submit a JPEG and return its page id.
    pub async fn submit(&self) -> Uuid {
        self.submissions()
            .submit("page.jpg", JPEG_BYTES)
            .await
            .unwrap()
            .page_id
    }

    /// Claim the next due job; panics when the queue is empty.
    pub async fn claim(&self) -> QueuedJob {
        self.queue
            .claim_next()
            .await
            .unwrap()
            .expect("a due job")
    }
}

pub fn extraction(clean_text: &str, units: &[(KnowledgeUnitType, &str)], tags: &[&str]) -> ExtractionResult {
    ExtractionResult {
        raw_ocr_text: clean_text.to_lowercase(),
        clean_text: clean_text.to_string(),
        knowledge_units: units
            .iter()
            .map(|(unit_type, content)| NewKnowledgeUnit {
                unit_type: *unit_type,
                content: content.to_string(),
                metadata: None,
            })
            .collect(),
        suggested_tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}
