//! Ollama vision backend for notebook page extraction.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use inkwell_core::defaults::{
    ENV_OLLAMA_VISION_MODEL, OLLAMA_URL, VISION_MODEL, VISION_TIMEOUT_SECS,
};
use inkwell_core::{
    extraction_json_schema, parse_extraction_response, Error, ExtractionBackend,
    ExtractionResult, Result,
};

/// Instructions sent with every page image.
pub const EXTRACTION_PROMPT: &str = "\
You read photographs of handwritten notebook pages and return structured JSON.

Fields:
- rawOcrText: every visible handwritten word, transcribed as written with line breaks kept. \
Put crossed-out text in [brackets] and describe drawings as [diagram: ...].
- cleanText: the same content with spelling fixed and formatting normalized, meaning unchanged.
- knowledgeUnits: discrete items, each with a \"type\" and \"content\". The type is one of \
\"task\" (something to do), \"idea\" (a concept or brainstorm), \"note\" (a fact or reference), \
\"question\" (something to find out), or \"action_item\" (a concrete follow-up step).
- suggestedTags: two to six short tags describing the page as a whole.

If the page is blank or unreadable, return empty arrays and say so in cleanText.";

/// Ollama-based extraction backend (e.g., qwen2.5vl, llava).
///
/// Uses constrained decoding (`format` set to the extraction JSON schema)
/// and still validates the reply, since smaller models ignore the schema.
pub struct OllamaExtractionBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl OllamaExtractionBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(VISION_TIMEOUT_SECS),
        }
    }

    /// Create from `OLLAMA_BASE` (or `OLLAMA_URL`), `OLLAMA_VISION_MODEL`,
    /// and `VISION_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let model = std::env::var(ENV_OLLAMA_VISION_MODEL)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| VISION_MODEL.to_string());
        let base_url = std::env::var("OLLAMA_BASE")
            .or_else(|_| std::env::var("OLLAMA_URL"))
            .unwrap_or_else(|_| OLLAMA_URL.to_string());
        let mut backend = Self::new(base_url, model);
        if let Some(secs) = std::env::var("VISION_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            backend.timeout = Duration::from_secs(secs);
        }
        backend
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    images: Vec<String>, // base64 encoded
    format: JsonValue,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

#[async_trait]
impl ExtractionBackend for OllamaExtractionBackend {
    async fn extract(&self, image_data: &[u8], mime_type: &str) -> Result<ExtractionResult> {
        use base64::Engine;
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(image_data);

        let request = OllamaGenerateRequest {
            model: self.model.clone(),
            prompt: EXTRACTION_PROMPT.to_string(),
            images: vec![image_b64],
            format: extraction_json_schema(),
            stream: false,
        };

        debug!(
            model = %self.model,
            mime_type,
            image_bytes = image_data.len(),
            "Sending page to vision model"
        );

        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Extraction(format!(
                        "Vision request timed out after {}s",
                        self.timeout.as_secs()
                    ))
                } else {
                    Error::Extraction(format!("Vision request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(model = %self.model, status = %status, "Vision API returned an error");
            return Err(Error::Extraction(format!(
                "Vision API returned {}: {}",
                status, body
            )));
        }

        let result: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::Extraction(format!("Failed to parse vision response: {}", e)))?;

        parse_extraction_response(&result.response)
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
