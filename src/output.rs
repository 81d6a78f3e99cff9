//! Job, section and report types returned by the pipeline.

use crate::artifact::ArtifactId;
use crate::document::DocumentKind;
use crate::error::{ErrorKind, JobFailure, SectionError};
use crate::pipeline::chart::ChartHint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one job. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Extracting,
    Indexing,
    Synthesizing,
    Rendering,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Extracting => "extracting",
            JobStatus::Indexing => "indexing",
            JobStatus::Synthesizing => "synthesizing",
            JobStatus::Rendering => "rendering",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What was submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    /// File name or URL as given by the caller.
    pub name: String,
    /// Declared MIME type, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_type: Option<String>,
    /// Detected kind; `None` until extraction has classified the input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<DocumentKind>,
    pub size_bytes: usize,
}

/// One document-processing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub source: SourceRef,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl Job {
    pub fn new(source: SourceRef) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    /// Move to a later non-terminal stage. Terminal jobs are left alone.
    pub fn advance(&mut self, status: JobStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
    }

    pub fn finish(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Done;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, failure: JobFailure) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(failure);
    }
}

/// Per-section state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionState {
    Pending,
    Retrieving,
    Generating,
    ChartPending,
    SectionDone,
}

/// The outcome of one planned section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionResult {
    pub name: String,
    /// 0-indexed position in the plan.
    pub ordinal: usize,
    /// Markdown body without the section heading.
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<ArtifactId>,
    /// Chart type drawn for `chart`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_kind: Option<ChartHint>,
    /// Why the body is a placeholder. `None` when the model answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SectionError>,
    /// Why a requested chart was omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_error: Option<SectionError>,
    pub state: SectionState,
    /// Chunks retrieved as grounding context.
    pub context_chunks: usize,
    /// Provenance tags of the retrieved chunks, in rank order.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub attempts: u32,
}

impl SectionResult {
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

/// Aggregate statistics for a completed job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportStats {
    pub source_units: u32,
    pub content_nodes: usize,
    pub chunks: usize,
    pub sections_total: usize,
    pub sections_degraded: usize,
    pub charts: usize,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub extraction_ms: u64,
    pub indexing_ms: u64,
    pub synthesis_ms: u64,
    pub render_ms: u64,
    pub total_duration_ms: u64,
}

/// The finished report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub generated_at: DateTime<Utc>,
    /// Section results in plan order.
    pub sections: Vec<SectionResult>,
    /// Assembled markdown with `artifact:<id>` references.
    pub markdown: String,
    pub artifact_refs: Vec<ArtifactId>,
    #[serde(skip)]
    pub pdf: Option<Vec<u8>>,
    /// Set when PDF rendering failed and delivery degraded to markdown only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_error: Option<String>,
    /// True when the job deadline cut synthesis short.
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub stats: ReportStats,
}

impl Report {
    pub fn degraded_sections(&self) -> impl Iterator<Item = &SectionResult> {
        self.sections.iter().filter(|s| s.is_degraded())
    }
}

/// JSON payload returned across the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEnvelope {
    /// `"success"` or `"error"`.
    pub status: String,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub markdown_content: String,
    /// Omitted when the PDF could not be rendered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub artifact_refs: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ReportEnvelope {
    pub const SUCCESS: &'static str = "success";
    pub const ERROR: &'static str = "error";

    /// Envelope for a `done` job. `pdf_url` is the boundary-chosen location
    /// of the rendered PDF.
    pub fn success(job: &Job, report: &Report, pdf_url: Option<String>) -> Self {
        let mut warnings = report.warnings.clone();
        if let Some(reason) = &report.render_error {
            warnings.push(format!("PDF rendering failed: {reason}"));
        }
        Self {
            status: Self::SUCCESS.to_string(),
            job_id: job.id.clone(),
            filename: Some(job.source.name.clone()),
            markdown_content: report.markdown.clone(),
            pdf_download_url: report.pdf.as_ref().and(pdf_url),
            error: None,
            error_kind: None,
            artifact_refs: report
                .artifact_refs
                .iter()
                .map(|id| id.as_str().to_string())
                .collect(),
            warnings,
        }
    }

    /// Envelope for a `failed` job. A partial report, when kept, still
    /// contributes its markdown.
    pub fn failure(job: &Job, failure: &JobFailure, partial: Option<&Report>) -> Self {
        Self {
            status: Self::ERROR.to_string(),
            job_id: job.id.clone(),
            filename: Some(job.source.name.clone()),
            markdown_content: partial.map(|r| r.markdown.clone()).unwrap_or_default(),
            pdf_download_url: None,
            error: Some(failure.detail.clone()),
            error_kind: Some(failure.kind),
            artifact_refs: partial
                .map(|r| r.artifact_refs.iter().map(|id| id.to_string()).collect())
                .unwrap_or_default(),
            warnings: partial.map(|r| r.warnings.clone()).unwrap_or_default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }
}
