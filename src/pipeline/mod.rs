//! Pipeline stages for document-to-report generation.
//!
//! Each submodule implements one transformation step and is testable on its
//! own; [`crate::report`] wires them together for a single job.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ extract ──▶ chunk ──▶ embed ──▶ synthesize ──▶ render
//! (bytes)   (nodes)     (chunks)  (index)   (markdown)     (PDF)
//!                                    ▲          │
//!                                 retrieve ◀────┤
//!                                               ├──▶ llm (retry/timeout)
//!                                               └──▶ chart (artifacts)
//! ```
//!
//! 1. [`input`]: resolve a path or URL to raw bytes plus a declared type
//! 2. [`extract`]: classify the bytes and produce provenance-tagged content
//!    nodes; pdfium and image decoding run in `spawn_blocking`
//! 3. [`chunk`]: split nodes into retrieval units; tables keep their headers
//! 4. [`embed`]: embed chunks in bounded parallel batches into a job index
//! 5. [`retrieve`]: top-k cosine search over that index
//! 6. [`synthesize`]: per-section retrieval, generation and charting
//! 7. [`render`]: markdown with artifact references to PDF bytes
//!
//! [`llm`] and [`ocr`] are the only stages with model I/O; [`encode`] and
//! [`postprocess`] are pure helpers around them.

pub mod chart;
pub mod chunk;
pub mod embed;
pub mod encode;
pub mod extract;
pub mod input;
pub mod llm;
pub mod ocr;
pub mod postprocess;
pub mod render;
pub mod retrieve;
pub mod synthesize;
