//! Progress-callback trait for per-job report events.
//!
//! Inject an [`Arc<dyn ReportProgressCallback>`] via
//! [`crate::config::ReportConfigBuilder::progress_callback`] to observe a job
//! as it moves through extraction, indexing, section synthesis and rendering.
//!
//! Callers can forward events to a channel, a job table, or a terminal
//! progress bar without the library knowing how the host communicates.
//!
//! # Example
//!
//! ```rust
//! use edgequake_report::{ReportProgressCallback, ReportConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct SectionCounter {
//!     done: AtomicUsize,
//! }
//!
//! impl ReportProgressCallback for SectionCounter {
//!     fn on_section_complete(&self, ordinal: usize, total: usize, name: &str, _len: usize) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{name} ({ordinal}/{total}) done, {n} so far");
//!     }
//! }
//!
//! let config = ReportConfig::builder()
//!     .progress_callback(Arc::new(SectionCounter { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::JobStatus;
use std::sync::Arc;

/// Called by the report pipeline as a job progresses.
///
/// Sections run concurrently, so `on_section_*` may be called from several
/// tasks at once. All methods default to no-ops.
pub trait ReportProgressCallback: Send + Sync {
    /// The job entered a new stage.
    fn on_stage(&self, job_id: &str, status: JobStatus) {
        let _ = (job_id, status);
    }

    /// Extraction finished.
    ///
    /// # Arguments
    /// * `units`: pages or sheets in the source
    /// * `nodes`: content nodes produced
    fn on_extracted(&self, units: u32, nodes: usize) {
        let _ = (units, nodes);
    }

    /// The index is ready.
    fn on_indexed(&self, chunks: usize) {
        let _ = chunks;
    }

    /// A section is about to retrieve context and call the model.
    ///
    /// `ordinal` is 1-indexed in plan order.
    fn on_section_start(&self, ordinal: usize, total: usize, name: &str) {
        let _ = (ordinal, total, name);
    }

    /// A section produced grounded content.
    fn on_section_complete(&self, ordinal: usize, total: usize, name: &str, body_len: usize) {
        let _ = (ordinal, total, name, body_len);
    }

    /// A section fell back to a placeholder.
    fn on_section_degraded(&self, ordinal: usize, total: usize, name: &str, reason: &str) {
        let _ = (ordinal, total, name, reason);
    }

    /// The job reached `done` or `failed`.
    fn on_job_complete(&self, job_id: &str, status: JobStatus, degraded_sections: usize) {
        let _ = (job_id, status, degraded_sections);
    }
}

/// Used when no callback is configured.
pub struct NoopProgressCallback;

impl ReportProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ReportConfig`].
pub type ProgressCallback = Arc<dyn ReportProgressCallback>;
