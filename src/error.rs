//! Error types for the edgequake-report library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ReportError`]: **Fatal**: the job cannot produce a report at all
//!   (unsupported input, nothing extractable, embedding backend down, job
//!   deadline exceeded). Returned as `Err(ReportError)` from stage functions
//!   and recorded on the [`crate::output::Job`] as a [`JobFailure`].
//!
//! * [`SectionError`]: **Non-fatal**: one section's model call or chart
//!   failed, but every other section is fine. Stored inside
//!   [`crate::output::SectionResult`] and rendered as a visible placeholder so
//!   the reader can see what is missing instead of losing the whole report.
//!
//! Every failure crossing a stage boundary is classified into an
//! [`ErrorKind`], which is what the JSON envelope exposes to callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Stable classification of every failure the pipeline can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedFormat,
    ExtractionFailure,
    IndexingFailure,
    ModelUnavailable,
    ModelTimeout,
    ModelRefusal,
    UnplottableData,
    RenderFailure,
    PipelineTimeout,
    Cancelled,
    InvalidInput,
    /// A bug or runtime fault inside the pipeline, not a property of the input.
    Internal,
}

impl ErrorKind {
    /// Whether a failure of this kind aborts the whole job.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::UnsupportedFormat
                | ErrorKind::ExtractionFailure
                | ErrorKind::IndexingFailure
                | ErrorKind::PipelineTimeout
                | ErrorKind::Cancelled
                | ErrorKind::InvalidInput
                | ErrorKind::Internal
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UnsupportedFormat => "UnsupportedFormat",
            ErrorKind::ExtractionFailure => "ExtractionFailure",
            ErrorKind::IndexingFailure => "IndexingFailure",
            ErrorKind::ModelUnavailable => "ModelUnavailable",
            ErrorKind::ModelTimeout => "ModelTimeout",
            ErrorKind::ModelRefusal => "ModelRefusal",
            ErrorKind::UnplottableData => "UnplottableData",
            ErrorKind::RenderFailure => "RenderFailure",
            ErrorKind::PipelineTimeout => "PipelineTimeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All fatal errors returned by the edgequake-report library.
///
/// Section-level failures use [`SectionError`] and are stored in
/// [`crate::output::SectionResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum ReportError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Extraction errors ─────────────────────────────────────────────────
    /// Neither the declared type nor the leading bytes identify a supported format.
    #[error("Unsupported document format: {detail}\nSupported: PDF, CSV, XLSX, DOCX, PNG/JPEG/TIFF/BMP/GIF/WEBP scans, plain text.")]
    UnsupportedFormat { detail: String },

    /// The document was recognised but yielded no usable text or tables.
    #[error("Extraction failed for {kind} document: {detail}")]
    ExtractionFailure { kind: String, detail: String },

    // ── Indexing errors ───────────────────────────────────────────────────
    /// The embedding backend was unreachable or returned unusable vectors.
    #[error("Indexing failed: {detail}")]
    IndexingFailure { detail: String },

    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Job-level errors ──────────────────────────────────────────────────
    /// The job exceeded its wall-clock budget.
    #[error("Report generation exceeded the {secs}s job budget during {stage}")]
    PipelineTimeout { secs: u64, stage: String },

    /// The caller abandoned the job.
    #[error("Report generation was cancelled during {stage}")]
    Cancelled { stage: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReportError {
    /// Classify this error into the public taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReportError::FileNotFound { .. }
            | ReportError::PermissionDenied { .. }
            | ReportError::DownloadFailed { .. }
            | ReportError::DownloadTimeout { .. }
            | ReportError::InvalidConfig(_) => ErrorKind::InvalidInput,
            ReportError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            ReportError::ExtractionFailure { .. } => ErrorKind::ExtractionFailure,
            ReportError::IndexingFailure { .. } | ReportError::ProviderNotConfigured { .. } => {
                ErrorKind::IndexingFailure
            }
            ReportError::PipelineTimeout { .. } => ErrorKind::PipelineTimeout,
            ReportError::Cancelled { .. } => ErrorKind::Cancelled,
            ReportError::OutputWriteFailed { .. } => ErrorKind::RenderFailure,
            ReportError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// A non-fatal error for a single report section.
///
/// The synthesizer turns these into a placeholder body; the job still
/// completes with status `done`.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum SectionError {
    /// Backend unreachable or rejected the request after all retries.
    #[error("model unavailable after {attempts} attempt(s): {detail}")]
    ModelUnavailable { attempts: u32, detail: String },

    /// Every attempt exceeded the per-call timeout.
    #[error("model call timed out after {timeout_ms}ms ({attempts} attempt(s))")]
    ModelTimeout { attempts: u32, timeout_ms: u64 },

    /// The model declined to answer.
    #[error("model refused the request: {detail}")]
    ModelRefusal { detail: String },

    /// The job was cancelled while the call was in flight.
    #[error("model call cancelled")]
    Cancelled,

    /// The selected table has nothing numeric to plot.
    #[error("no plottable numeric data: {detail}")]
    UnplottableData { detail: String },
}

impl SectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SectionError::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            SectionError::ModelTimeout { .. } => ErrorKind::ModelTimeout,
            SectionError::ModelRefusal { .. } => ErrorKind::ModelRefusal,
            SectionError::Cancelled => ErrorKind::Cancelled,
            SectionError::UnplottableData { .. } => ErrorKind::UnplottableData,
        }
    }

    /// Model calls made before giving up, when known.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            SectionError::ModelUnavailable { attempts, .. } | SectionError::ModelTimeout { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }
}

/// Rendering failed; the job degrades to markdown-only delivery.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RenderError {
    #[error("artifact '{id}' referenced in markdown is not registered for this job")]
    MissingArtifact { id: String },

    #[error("artifact '{id}' could not be decoded as an image: {detail}")]
    UndecodableArtifact { id: String, detail: String },

    #[error("PDF writer failed: {0}")]
    Writer(String),
}

/// The failure recorded on a `failed` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub detail: String,
}

impl From<&ReportError> for JobFailure {
    fn from(e: &ReportError) -> Self {
        Self {
            kind: e.kind(),
            detail: e.to_string(),
        }
    }
}
