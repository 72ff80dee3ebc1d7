//! # inkwell-jobs
//!
//! Page processing pipeline for inkwell.
//!
//! - [`SubmissionService`] accepts page images and queues them
//! - [`JobWorker`] claims queued jobs with bounded concurrency
//! - [`PageProcessor`] turns a page into text, knowledge units, and tags
//!
//! Everything here works through the `inkwell-core` traits, so the same
//! pipeline runs against PostgreSQL or in-memory stores.

pub mod handler;
pub mod page_processor;
pub mod submission;
pub mod tag_reconciler;
pub mod worker;

pub use handler::{JobContext, JobHandler, JobResult};
pub use page_processor::{PageProcessor, ProcessOutcome};
pub use submission::{SubmissionConfig, SubmissionReceipt, SubmissionService};
pub use tag_reconciler::TagReconciler;
pub use worker::{JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};

// Re-export core types
pub use inkwell_core::*;
