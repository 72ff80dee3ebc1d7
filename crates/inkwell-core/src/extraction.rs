//! Extraction result shape and the strict validator at the capability boundary.
//!
//! Vision models return free-form JSON. Nothing downstream of
//! [`parse_extraction_response`] ever sees unchecked model output: either the
//! payload matches the expected shape exactly, or the whole result is an
//! [`Error::Extraction`].

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::models::NewKnowledgeUnit;

/// Structured content extracted from one page image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub raw_ocr_text: String,
    pub clean_text: String,
    pub knowledge_units: Vec<NewKnowledgeUnit>,
    pub suggested_tags: Vec<String>,
}

impl ExtractionResult {
    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        for (idx, unit) in self.knowledge_units.iter().enumerate() {
            if let Some(metadata) = &unit.metadata {
                if !metadata.is_object() {
                    return Err(Error::Extraction(format!(
                        "knowledgeUnits[{}].metadata must be an object",
                        idx
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Parse and validate a raw model response.
///
/// Accepts the JSON object either bare or wrapped in a markdown code fence.
pub fn parse_extraction_response(raw: &str) -> Result<ExtractionResult> {
    let body = strip_code_fence(raw);
    if body.is_empty() {
        return Err(Error::Extraction("Model returned an empty response".into()));
    }

    let result: ExtractionResult = serde_json::from_str(body)
        .map_err(|e| Error::Extraction(format!("Response failed schema validation: {}", e)))?;
    result.validate()?;
    Ok(result)
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// JSON schema handed to backends that support constrained decoding.
pub fn extraction_json_schema() -> JsonValue {
    serde_json::json!({
        "type": "object",
        "properties": {
            "rawOcrText": { "type": "string" },
            "cleanText": { "type": "string" },
            "knowledgeUnits": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "type": {
                            "type": "string",
                            "enum": ["task", "idea", "note", "question", "action_item"]
                        },
                        "content": { "type": "string" }
                    },
                    "required": ["type", "content"]
                }
            },
            "suggestedTags": {
                "type": "array",
                "items": { "type": "string" }
            }
        },
        "required": ["rawOcrText", "cleanText", "knowledgeUnits", "suggestedTags"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KnowledgeUnitType;

    const VALID: &str = r#"{
        "rawOcrText": "buy milk\nidea: habit app",
        "cleanText": "Buy milk. Idea: habit app.",
        "knowledgeUnits": [
            {"type": "task", "content": "Buy milk"},
            {"type": "idea", "content": "Habit app", "metadata": {"confidence": 0.9}}
        ],
        "suggestedTags": ["errands", "Ideas"]
    }"#;

    #[test]
    fn test_parse_valid_response() {
        let result = parse_extraction_response(VALID).unwrap();
        assert_eq!(result.knowledge_units.len(), 2);
        assert_eq!(result.knowledge_units[0].unit_type, KnowledgeUnitType::Task);
        assert_eq!(result.knowledge_units[0].metadata, None);
        assert_eq!(result.suggested_tags, vec!["errands", "Ideas"]);
    }

    #[test]
    fn test_parse_fenced_response() {
        let fenced = format!("```json\n{}\n```", VALID);
        assert!(parse_extraction_response(&fenced).is_ok());
    }

    #[test]
    fn test_parse_empty_collections() {
        let raw = r#"{"rawOcrText":"","cleanText":"blank page","knowledgeUnits":[],"suggestedTags":[]}"#;
        let result = parse_extraction_response(raw).unwrap();
        assert!(result.knowledge_units.is_empty());
        assert!(result.suggested_tags.is_empty());
    }

    #[test]
    fn test_rejects_missing_field() {
        let raw = r#"{"rawOcrText":"x","knowledgeUnits":[],"suggestedTags":[]}"#;
        let err = parse_extraction_response(raw).unwrap_err();
        assert!(matches!(err, Error::Extraction(ref m) if m.contains("cleanText")));
    }

    #[test]
    fn test_rejects_unknown_unit_type() {
        let raw = r#"{"rawOcrText":"x","cleanText":"x","knowledgeUnits":[{"type":"reminder","content":"x"}],"suggestedTags":[]}"#;
        assert!(matches!(
            parse_extraction_response(raw),
            Err(Error::Extraction(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_types() {
        let raw = r#"{"rawOcrText":"x","cleanText":"x","knowledgeUnits":[],"suggestedTags":"work"}"#;
        assert!(parse_extraction_response(raw).is_err());
    }

    #[test]
    fn test_rejects_non_object_metadata() {
        let raw = r#"{"rawOcrText":"x","cleanText":"x","knowledgeUnits":[{"type":"note","content":"x","metadata":[1]}],"suggestedTags":[]}"#;
        let err = parse_extraction_response(raw).unwrap_err();
        assert!(err.to_string().contains("metadata must be an object"));
    }

    #[test]
    fn test_rejects_non_json() {
        assert!(parse_extraction_response("I could not read this page").is_err());
        assert!(parse_extraction_response("   ").is_err());
    }

    #[test]
    fn test_schema_lists_all_unit_types() {
        let schema = extraction_json_schema();
        let types = &schema["properties"]["knowledgeUnits"]["items"]["properties"]["type"]["enum"];
        assert_eq!(types.as_array().unwrap().len(), 5);
    }
}
