//! # edgequake-report
//!
//! Turn a business document (PDF, CSV, XLSX, DOCX, a scanned image or plain text)
//! into a multi-section strategic report: grounded narrative from an LLM,
//! charts drawn from the document's own tables, delivered as markdown and PDF.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document
//!  │
//!  ├─ 1. Extract     text, tables, images per page/sheet (pdfium, csv, zip+xml, OCR)
//!  ├─ 2. Chunk       retrieval-sized units; split tables repeat headers + a stats summary
//!  ├─ 3. Index       embeddings in a per-job in-memory index
//!  ├─ 4. Synthesize  per section: retrieve top-k → grounded LLM call → chart
//!  ├─ 5. Assemble    ordered markdown with artifact:<id> references
//!  └─ 6. Render      A4 PDF (printpdf)
//! ```
//!
//! A model failure never fails a report: the section gets a placeholder body
//! and the job still completes. Only unreadable input, an empty extraction,
//! an unreachable embedding backend, the job deadline or cancellation fail
//! the job.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_report::{generate_report, ReportConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ReportConfig::default();
//!     let report = generate_report("quarterly_sales.csv", &config).await?;
//!     println!("{}", report.markdown);
//!     for section in report.degraded_sections() {
//!         eprintln!("degraded: {}", section.name);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docreport` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ```toml
//! edgequake-report = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod artifact;
pub mod cancel;
pub mod config;
pub mod document;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod report;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use artifact::{rewrite_artifact_links, Artifact, ArtifactId, ArtifactKind, ArtifactStore};
pub use cancel::Cancellation;
pub use config::{ReportConfig, ReportConfigBuilder, SectionPlan, SectionSpec};
pub use document::{ContentNode, DocumentKind, ExtractedDocument, Provenance, Table};
pub use error::{ErrorKind, JobFailure, RenderError, ReportError, SectionError};
pub use output::{Job, JobStatus, Report, ReportEnvelope, ReportStats, SectionResult, SectionState};
pub use pipeline::chart::ChartHint;
pub use pipeline::input::SourceDocument;
pub use progress::{NoopProgressCallback, ProgressCallback, ReportProgressCallback};
pub use report::{
    generate_report, generate_report_from_bytes, generate_report_sync, JobContext, JobOutcome,
    PdfRenderer, ReportPipeline, ReportService,
};
