//! Mock extraction backend for deterministic testing.
//!
//! ```rust,ignore
//! use inkwell_inference::mock::MockExtractionBackend;
//!
//! let backend = MockExtractionBackend::new()
//!     .then_fail("Vision request timed out")
//!     .then_return(result);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use inkwell_core::{Error, ExtractionBackend, ExtractionResult, Result};

#[derive(Debug, Clone)]
enum Scripted {
    Return(ExtractionResult),
    Fail(String),
}

/// Extraction backend that replays scripted outcomes.
///
/// Scripted outcomes are consumed in order; once exhausted every call gets
/// the default result. Clones share the script and the call counter.
#[derive(Clone)]
pub struct MockExtractionBackend {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    default_result: ExtractionResult,
    latency: Duration,
    calls: Arc<AtomicUsize>,
}

impl Default for MockExtractionBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExtractionBackend {
    /// Mock that returns an empty extraction for every call.
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            default_result: ExtractionResult {
                raw_ocr_text: String::new(),
                clean_text: "Mock page".to_string(),
                knowledge_units: Vec::new(),
                suggested_tags: Vec::new(),
            },
            latency: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Result returned once the script is exhausted.
    pub fn with_default_result(mut self, result: ExtractionResult) -> Self {
        self.default_result = result;
        self
    }

    /// Simulated model latency per call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a successful result.
    pub fn then_return(self, result: ExtractionResult) -> Self {
        self.push(Scripted::Return(result));
        self
    }

    /// Queue an extraction failure with the given message.
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        self.push(Scripted::Fail(message.into()));
        self
    }

    /// Number of `extract` calls so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(&self, outcome: Scripted) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    fn next_outcome(&self) -> Scripted {
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| Scripted::Return(self.default_result.clone()))
    }
}

#[async_trait]
impl ExtractionBackend for MockExtractionBackend {
    async fn extract(&self, _image_data: &[u8], _mime_type: &str) -> Result<ExtractionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.next_outcome() {
            Scripted::Return(result) => Ok(result),
            Scripted::Fail(message) => Err(Error::Extraction(message)),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn model_name(&self) -> &str {
        "mock-vision"
    }
}
