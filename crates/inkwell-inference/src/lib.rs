//! # inkwell-inference
//!
//! Vision extraction backends for inkwell.
//!
//! - [`OllamaExtractionBackend`]: local vision models served by Ollama
//! - [`mock::MockExtractionBackend`]: scripted backend for tests (`mock` feature)
//!
//! Every backend validates model output with
//! [`inkwell_core::parse_extraction_response`] before returning it.

#[cfg(any(test, feature = "mock"))]
pub mod mock;
#[cfg(feature = "ollama")]
pub mod vision;

#[cfg(feature = "ollama")]
pub use vision::{OllamaExtractionBackend, EXTRACTION_PROMPT};

pub use inkwell_core::{ExtractionBackend, ExtractionResult};
