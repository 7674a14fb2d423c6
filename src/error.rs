//! Error taxonomy for the dashboard pipeline and its I/O boundaries.

use std::io;

use thiserror::Error;

/// Failures raised by document loading, schema analysis and source access.
///
/// Only `SourceUnavailable` for every configured source is meant to reach the
/// end user as a blocking error; the rest are recorded per document and skipped.
#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("malformed document '{source_key}': {reason}")]
    MalformedDocument { source_key: String, reason: String },
    #[error("document source '{backend}' is unavailable: {reason}")]
    SourceUnavailable { backend: String, reason: String },
    #[error("unsupported file type: {0}")]
    UnsupportedFormat(String),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DashboardError {
    pub fn malformed(source_key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedDocument {
            source_key: source_key.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }
}

/// Failures of the external text-generation boundary.
///
/// Always converted to the fallback narrative by the caller.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("text generation is not configured")]
    NotConfigured,
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("empty completion")]
    Empty,
    #[error("generation failed: {0}")]
    Failed(String),
}

pub type Result<T, E = DashboardError> = std::result::Result<T, E>;
