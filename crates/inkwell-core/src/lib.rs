//! # inkwell-core
//!
//! Core types, traits, and abstractions for inkwell, the handwritten
//! notebook page digitizer.
//!
//! This crate provides the domain model (pages, knowledge units, tags,
//! queue jobs), the page lifecycle rules, and the trait seams the database,
//! queue, blob store, and vision backends implement.

pub mod defaults;
pub mod error;
pub mod extraction;
pub mod models;
pub mod retry;
pub mod tags;
pub mod traits;
pub mod upload;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use extraction::{extraction_json_schema, parse_extraction_response, ExtractionResult};
pub use models::*;
pub use retry::RetryPolicy;
pub use tags::{normalize_tag_name, normalize_tag_names};
pub use traits::*;
pub use upload::{validate_upload, ValidatedUpload};
pub use uuid_utils::new_v7;
