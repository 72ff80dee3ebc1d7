//! Core data models for inkwell.
//!
//! These types are shared across all inkwell crates and represent
//! the core domain entities.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Error;

// =============================================================================
// PAGE TYPES
// =============================================================================

/// Lifecycle state of a page.
///
/// ```text
/// uploading ──► processing ──► completed
///                   │
///                   └────────► failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl PageStatus {
    pub const ALL: [PageStatus; 4] = [
        PageStatus::Uploading,
        PageStatus::Processing,
        PageStatus::Completed,
        PageStatus::Failed,
    ];

    /// Database/wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            PageStatus::Uploading => "uploading",
            PageStatus::Processing => "processing",
            PageStatus::Completed => "completed",
            PageStatus::Failed => "failed",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `processing -> processing` is accepted as a no-op so the processor can
    /// re-assert the state on every delivery.
    pub fn can_transition_to(self, next: PageStatus) -> bool {
        matches!(
            (self, next),
            (PageStatus::Uploading, PageStatus::Processing)
                | (PageStatus::Processing, PageStatus::Processing)
                | (PageStatus::Processing, PageStatus::Completed)
                | (PageStatus::Processing, PageStatus::Failed)
        )
    }

    /// States a redelivered job may re-arm to `processing`.
    ///
    /// A failed attempt leaves the page `failed`; the queue's next attempt is
    /// the only path that moves it back. `completed` is never re-armed.
    pub fn can_rearm_for_retry(self) -> bool {
        matches!(self, PageStatus::Processing | PageStatus::Failed)
    }

    /// `completed` and `failed` have no outgoing lifecycle edge.
    pub fn is_terminal(self) -> bool {
        matches!(self, PageStatus::Completed | PageStatus::Failed)
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(PageStatus::Uploading),
            "processing" => Ok(PageStatus::Processing),
            "completed" => Ok(PageStatus::Completed),
            "failed" => Ok(PageStatus::Failed),
            other => Err(Error::InvalidInput(format!("Unknown page status: {}", other))),
        }
    }
}

/// Individual write phases of a successful processing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStep {
    /// OCR/clean text written and page marked completed.
    WriteText,
    /// Knowledge units materialized.
    InsertUnits,
    /// Suggested tags resolved and linked.
    ReconcileTags,
}

/// Per-page ledger of which write phases have durably completed.
///
/// Stored as JSONB next to the page row so a redelivered job can resume
/// exactly where the previous attempt stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingSteps {
    #[serde(default)]
    pub text_written: bool,
    #[serde(default)]
    pub units_inserted: bool,
    #[serde(default)]
    pub tags_reconciled: bool,
    /// Attempt that wrote the text (and therefore owns the extraction snapshot).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<Uuid>,
}

impl ProcessingSteps {
    /// First step that has not completed yet, in execution order.
    pub fn next_step(&self) -> Option<ProcessingStep> {
        if !self.text_written {
            Some(ProcessingStep::WriteText)
        } else if !self.units_inserted {
            Some(ProcessingStep::InsertUnits)
        } else if !self.tags_reconciled {
            Some(ProcessingStep::ReconcileTags)
        } else {
            None
        }
    }

    pub fn is_complete(&self) -> bool {
        self.next_step().is_none()
    }
}

/// A digitized notebook page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: Uuid,
    pub image_url: String,
    /// Blob store reference the worker reads the image from.
    pub image_ref: String,
    pub raw_ocr_text: Option<String>,
    pub clean_text: Option<String>,
    pub status: PageStatus,
    pub error_message: Option<String>,
    pub metadata: JsonValue,
    pub processing_steps: ProcessingSteps,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lightweight status projection used for polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageStatusView {
    pub id: Uuid,
    pub status: PageStatus,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Page with its derived artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageDetail {
    #[serde(flatten)]
    pub page: Page,
    pub knowledge_units: Vec<KnowledgeUnit>,
    pub tags: Vec<Tag>,
}

/// Page row in a listing, with its tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageWithTags {
    #[serde(flatten)]
    pub page: Page,
    pub tags: Vec<Tag>,
}

/// Request for creating a page record.
#[derive(Debug, Clone)]
pub struct CreatePageRequest {
    pub image_url: String,
    pub image_ref: String,
    pub metadata: Option<JsonValue>,
}

/// Request for listing pages.
#[derive(Debug, Clone, Default)]
pub struct ListPagesRequest {
    pub status: Option<PageStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Response for listing pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPagesResponse {
    pub pages: Vec<PageWithTags>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

// =============================================================================
// KNOWLEDGE UNIT TYPES
// =============================================================================

/// Category of an extracted knowledge unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeUnitType {
    Task,
    Idea,
    Note,
    Question,
    ActionItem,
}

impl KnowledgeUnitType {
    pub fn as_str(self) -> &'static str {
        match self {
            KnowledgeUnitType::Task => "task",
            KnowledgeUnitType::Idea => "idea",
            KnowledgeUnitType::Note => "note",
            KnowledgeUnitType::Question => "question",
            KnowledgeUnitType::ActionItem => "action_item",
        }
    }
}

impl fmt::Display for KnowledgeUnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KnowledgeUnitType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(KnowledgeUnitType::Task),
            "idea" => Ok(KnowledgeUnitType::Idea),
            "note" => Ok(KnowledgeUnitType::Note),
            "question" => Ok(KnowledgeUnitType::Question),
            "action_item" => Ok(KnowledgeUnitType::ActionItem),
            other => Err(Error::InvalidInput(format!(
                "Unknown knowledge unit type: {}",
                other
            ))),
        }
    }
}

/// One discrete fact or action extracted from a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeUnit {
    pub id: Uuid,
    pub page_id: Uuid,
    #[serde(rename = "type")]
    pub unit_type: KnowledgeUnitType,
    pub content: String,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Knowledge unit as produced by extraction, before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewKnowledgeUnit {
    #[serde(rename = "type")]
    pub unit_type: KnowledgeUnitType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

/// Request for listing knowledge units across pages.
#[derive(Debug, Clone, Default)]
pub struct ListKnowledgeUnitsRequest {
    pub unit_type: Option<KnowledgeUnitType>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Owning page of a listed knowledge unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitPageRef {
    pub id: Uuid,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

/// Knowledge unit in a cross-page listing, pointing back at its page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeUnitWithPage {
    #[serde(flatten)]
    pub unit: KnowledgeUnit,
    pub page: UnitPageRef,
}

/// Response for listing knowledge units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListKnowledgeUnitsResponse {
    pub knowledge_units: Vec<KnowledgeUnitWithPage>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

// =============================================================================
// TAG TYPES
// =============================================================================

/// Canonical, deduplicated label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Association between a page and a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageTag {
    pub page_id: Uuid,
    pub tag_id: Uuid,
}

// =============================================================================
// JOB TYPES
// =============================================================================

/// Queue payload: everything else is re-derived from the page row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub page_id: Uuid,
    pub image_ref: String,
}

/// Status of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    /// Attempts exhausted; no further automatic processing.
    Dead,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Dead => "dead",
        }
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(Error::InvalidInput(format!("Unknown job status: {}", other))),
        }
    }
}

/// A job in the processing queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: Uuid,
    pub payload: ProcessingJob,
    pub status: JobStatus,
    /// Deliveries so far, including the current one while running.
    pub attempts: i32,
    pub max_attempts: i32,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueuedJob {
    /// Whether this delivery is a retry of an earlier failed attempt.
    pub fn is_redelivery(&self) -> bool {
        self.attempts > 1
    }
}

/// What the queue did with a job whose handler returned an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled; will be claimable again at `run_at`.
    Retry {
        attempt: i32,
        run_at: DateTime<Utc>,
    },
    /// Attempts exhausted; moved to the dead-letter set.
    DeadLettered { attempts: i32 },
}

// =============================================================================
// STORAGE TYPES
// =============================================================================

/// Opaque reference to a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(pub String);

impl BlobRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased file extension, if the reference carries one.
    pub fn extension(&self) -> Option<String> {
        self.0
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .filter(|ext| !ext.is_empty() && !ext.contains('/'))
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_status_forward_edges() {
        assert!(PageStatus::Uploading.can_transition_to(PageStatus::Processing));
        assert!(PageStatus::Processing.can_transition_to(PageStatus::Completed));
        assert!(PageStatus::Processing.can_transition_to(PageStatus::Failed));
        assert!(PageStatus::Processing.can_transition_to(PageStatus::Processing));
    }

    #[test]
    fn test_page_status_no_other_edges() {
        let allowed = [
            (PageStatus::Uploading, PageStatus::Processing),
            (PageStatus::Processing, PageStatus::Processing),
            (PageStatus::Processing, PageStatus::Completed),
            (PageStatus::Processing, PageStatus::Failed),
        ];
        for from in PageStatus::ALL {
            for to in PageStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_page_status_terminal() {
        assert!(PageStatus::Completed.is_terminal());
        assert!(PageStatus::Failed.is_terminal());
        assert!(!PageStatus::Uploading.is_terminal());
        assert!(!PageStatus::Processing.is_terminal());
    }

    #[test]
    fn test_completed_is_never_rearmed() {
        assert!(!PageStatus::Completed.can_rearm_for_retry());
        assert!(!PageStatus::Uploading.can_rearm_for_retry());
        assert!(PageStatus::Failed.can_rearm_for_retry());
    }

    #[test]
    fn test_page_status_round_trip_str() {
        for status in PageStatus::ALL {
            assert_eq!(status.as_str().parse::<PageStatus>().unwrap(), status);
        }
        assert!("archived".parse::<PageStatus>().is_err());
    }

    #[test]
    fn test_knowledge_unit_type_serde() {
        let json = serde_json::to_string(&KnowledgeUnitType::ActionItem).unwrap();
        assert_eq!(json, "\"action_item\"");
        let parsed: KnowledgeUnitType = serde_json::from_str("\"question\"").unwrap();
        assert_eq!(parsed, KnowledgeUnitType::Question);
        assert!(serde_json::from_str::<KnowledgeUnitType>("\"reminder\"").is_err());
    }

    #[test]
    fn test_processing_steps_order() {
        let mut steps = ProcessingSteps::default();
        assert_eq!(steps.next_step(), Some(ProcessingStep::WriteText));
        steps.text_written = true;
        assert_eq!(steps.next_step(), Some(ProcessingStep::InsertUnits));
        steps.units_inserted = true;
        assert_eq!(steps.next_step(), Some(ProcessingStep::ReconcileTags));
        steps.tags_reconciled = true;
        assert!(steps.is_complete());
    }

    #[test]
    fn test_processing_steps_tolerates_missing_fields() {
        let steps: ProcessingSteps = serde_json::from_str("{}").unwrap();
        assert_eq!(steps, ProcessingSteps::default());
        let steps: ProcessingSteps =
            serde_json::from_str(r#"{"text_written": true}"#).unwrap();
        assert_eq!(steps.next_step(), Some(ProcessingStep::InsertUnits));
    }

    #[test]
    fn test_blob_ref_extension() {
        assert_eq!(BlobRef::new("abc.PNG").extension().as_deref(), Some("png"));
        assert_eq!(BlobRef::new("abc").extension(), None);
        assert_eq!(BlobRef::new("abc.").extension(), None);
    }

    #[test]
    fn test_queued_job_redelivery() {
        let job = QueuedJob {
            id: Uuid::new_v4(),
            payload: ProcessingJob {
                page_id: Uuid::new_v4(),
                image_ref: "x.jpg".to_string(),
            },
            status: JobStatus::Running,
            attempts: 1,
            max_attempts: 2,
            run_at: Utc::now(),
            last_error: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
        };
        assert!(!job.is_redelivery());
        let retried = QueuedJob { attempts: 2, ..job };
        assert!(retried.is_redelivery());
    }
}
