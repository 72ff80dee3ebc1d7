//! Upload validation for page images.
//!
//! Runs before anything is persisted, so every rejection here is a
//! submission error with no page or job left behind.

use crate::defaults::DEFAULT_IMAGE_EXTENSION;
use crate::error::{Error, Result};

/// Image extensions accepted for page uploads.
pub const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "heic", "heif"];

/// Upload that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUpload {
    /// Lowercased extension used for the stored blob name.
    pub extension: String,
    /// MIME type handed to the extraction backend.
    pub mime_type: String,
}

/// Map an image extension to its MIME type.
///
/// Unknown extensions fall back to `image/jpeg`, the most common camera output.
pub fn mime_from_extension(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        _ => "image/jpeg",
    }
}

/// Extension of `filename`, lowercased, or the default when there is none.
pub fn extension_of(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.trim().to_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| DEFAULT_IMAGE_EXTENSION.to_string())
}

/// Validate an uploaded page image.
///
/// Checks, in order: non-empty body, size ceiling, allowed extension, and
/// that magic bytes (when recognizable) identify an image.
pub fn validate_upload(filename: &str, data: &[u8], max_size_bytes: u64) -> Result<ValidatedUpload> {
    if data.is_empty() {
        return Err(Error::Submission("No file uploaded".to_string()));
    }

    if data.len() as u64 > max_size_bytes {
        return Err(Error::Submission(format!(
            "File exceeds maximum size of {} bytes",
            max_size_bytes
        )));
    }

    let extension = extension_of(filename);
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(Error::Submission(format!(
            "File extension .{} is not an accepted image type",
            extension
        )));
    }

    // HEIC/HEIF detection in infer is partial; only reject positively
    // identified non-image content.
    if let Some(kind) = infer::get(data) {
        if kind.matcher_type() != infer::MatcherType::Image {
            return Err(Error::Submission(format!(
                "Uploaded content is {} rather than an image",
                kind.mime_type()
            )));
        }
        return Ok(ValidatedUpload {
            extension,
            mime_type: kind.mime_type().to_string(),
        });
    }

    let mime_type = mime_from_extension(&extension).to_string();
    Ok(ValidatedUpload {
        extension,
        mime_type,
    })
}
