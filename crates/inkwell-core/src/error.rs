//! Error types for inkwell.

use thiserror::Error;
use uuid::Uuid;

use crate::models::PageStatus;

/// Result type alias using inkwell's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for inkwell operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Upload rejected before any page or job was created
    #[error("Submission error: {0}")]
    Submission(String),

    /// Extraction capability unreachable, timed out, or returned invalid structure
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Job ran out of attempts and was moved to the dead-letter set
    #[error("Job {job_id} exhausted {attempts} attempts: {last_error}")]
    RetriesExhausted {
        job_id: Uuid,
        attempts: i32,
        last_error: String,
    },

    /// Page status change not permitted by the lifecycle
    #[error("Invalid transition for page {page_id}: {from} -> {to}")]
    InvalidTransition {
        page_id: Uuid,
        from: PageStatus,
        to: PageStatus,
    },

    /// Page not found
    #[error("Page not found: {0}")]
    PageNotFound(Uuid),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Concurrent writers kept winning a race we could not settle
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a job that failed with this error is worth another attempt.
    ///
    /// Submission and validation errors are deterministic; everything that
    /// touches the network, the database, or the filesystem may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Database(_)
            | Error::Extraction(_)
            | Error::Conflict(_)
            | Error::Request(_)
            | Error::Io(_)
            | Error::Internal(_) => true,
            Error::Submission(_)
            | Error::RetriesExhausted { .. }
            | Error::InvalidTransition { .. }
            | Error::PageNotFound(_)
            | Error::NotFound(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::InvalidInput(_) => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
