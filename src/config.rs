//! Configuration types for document-to-report generation.
//!
//! All pipeline behaviour is controlled through [`ReportConfig`], built via
//! its [`ReportConfigBuilder`]. Every knob lives in one struct so a config can
//! be shared across concurrent jobs, logged, and diffed between runs.
//!
//! Chunk sizes, retrieval depth and chart heuristics are policy, not
//! contract: they are exposed here rather than hard-coded in the stages.

use crate::error::ReportError;
use crate::pipeline::chart::ChartHint;
use crate::progress::ProgressCallback;
use edgequake_llm::{EmbeddingProvider, LLMProvider};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Configuration for one or many report jobs.
///
/// Built via [`ReportConfig::builder()`] or using [`ReportConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_report::ReportConfig;
///
/// let config = ReportConfig::builder()
///     .chunk_size(600)
///     .chunk_overlap(100)
///     .top_k(6)
///     .section_concurrency(3)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ReportConfig {
    /// Target chunk size in characters. Default: 800.
    pub chunk_size: usize,

    /// Characters carried over from the previous chunk of the same text
    /// block. Default: 150.
    ///
    /// Overlap keeps a sentence that straddles a boundary retrievable from
    /// either side.
    pub chunk_overlap: usize,

    /// Hard ceiling on any chunk's length. Tables larger than this are split
    /// by row ranges. Default: 2400.
    pub max_chunk_chars: usize,

    /// Chunks retrieved per section. Default: 4.
    pub top_k: usize,

    /// Texts per embedding request. Default: 32.
    pub embed_batch_size: usize,

    /// Embedding requests in flight at once. Default: 4.
    pub embed_concurrency: usize,

    /// Sections generated concurrently. Default: 2.
    ///
    /// LLM backends rate-limit or serialise requests; 2–3 parallel sections
    /// is the useful range.
    pub section_concurrency: usize,

    /// Pages OCR'd concurrently when a PDF has image-only pages. Default: 4.
    pub ocr_concurrency: usize,

    /// LLM model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed embedding provider. Falls back to the environment.
    pub embedding_provider: Option<Arc<dyn EmbeddingProvider>>,

    /// Use the built-in hashing embedder instead of a remote provider.
    pub offline_embeddings: bool,

    /// Sampling temperature. Default: 0.2.
    pub temperature: f32,

    /// Maximum tokens generated per section. Default: 1024.
    pub max_tokens: usize,

    /// Retry ceiling for transient model failures. Default: 3.
    pub max_retries: u32,

    /// Initial backoff in milliseconds, doubled per retry. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-model-call timeout in milliseconds. Default: 60 000.
    pub api_timeout_ms: u64,

    /// Wall-clock budget for a whole job in seconds. Default: 600.
    pub job_timeout_secs: u64,

    /// On job timeout, return the sections that did complete. Default: false.
    pub partial_results: bool,

    /// Run OCR on image-only pages and scanned images. Default: true.
    pub ocr: bool,

    /// Longest edge in pixels when rasterising a page for OCR. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Embedded images smaller than this on either side are dropped.
    /// Default: 64.
    pub min_image_px: u32,

    /// Chart canvas size in pixels. Default: 800 × 480.
    pub chart_width: u32,
    pub chart_height: u32,

    /// Ordered section plan. Default: [`SectionPlan::default`].
    pub sections: SectionPlan,

    /// Custom system prompt for section writing.
    pub system_prompt: Option<String>,

    /// PDF user password for encrypted inputs.
    pub password: Option<String>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Also write artifacts to this directory.
    pub artifact_dir: Option<PathBuf>,

    /// Render the final PDF. Default: true.
    pub render_pdf: bool,

    /// Optional per-job progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            chunk_overlap: 150,
            max_chunk_chars: 2400,
            top_k: 4,
            embed_batch_size: 32,
            embed_concurrency: 4,
            section_concurrency: 2,
            ocr_concurrency: 4,
            model: None,
            provider_name: None,
            provider: None,
            embedding_provider: None,
            offline_embeddings: false,
            temperature: 0.2,
            max_tokens: 1024,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_ms: 60_000,
            job_timeout_secs: 600,
            partial_results: false,
            ocr: true,
            max_rendered_pixels: 2000,
            min_image_px: 64,
            chart_width: 800,
            chart_height: 480,
            sections: SectionPlan::default(),
            system_prompt: None,
            password: None,
            download_timeout_secs: 120,
            artifact_dir: None,
            render_pdf: true,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ReportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportConfig")
            .field("chunk_size", &self.chunk_size)
            .field("chunk_overlap", &self.chunk_overlap)
            .field("max_chunk_chars", &self.max_chunk_chars)
            .field("top_k", &self.top_k)
            .field("section_concurrency", &self.section_concurrency)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field(
                "embedding_provider",
                &self.embedding_provider.as_ref().map(|_| "<dyn EmbeddingProvider>"),
            )
            .field("offline_embeddings", &self.offline_embeddings)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_ms", &self.api_timeout_ms)
            .field("job_timeout_secs", &self.job_timeout_secs)
            .field("partial_results", &self.partial_results)
            .field("ocr", &self.ocr)
            .field("sections", &self.sections)
            .finish()
    }
}

impl ReportConfig {
    /// Create a new builder for `ReportConfig`.
    pub fn builder() -> ReportConfigBuilder {
        ReportConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ReportConfig`].
#[derive(Debug)]
pub struct ReportConfigBuilder {
    config: ReportConfig,
}

impl ReportConfigBuilder {
    pub fn chunk_size(mut self, chars: usize) -> Self {
        self.config.chunk_size = chars;
        self
    }

    pub fn chunk_overlap(mut self, chars: usize) -> Self {
        self.config.chunk_overlap = chars;
        self
    }

    pub fn max_chunk_chars(mut self, chars: usize) -> Self {
        self.config.max_chunk_chars = chars;
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.config.top_k = k.max(1);
        self
    }

    pub fn embed_batch_size(mut self, n: usize) -> Self {
        self.config.embed_batch_size = n.max(1);
        self
    }

    pub fn embed_concurrency(mut self, n: usize) -> Self {
        self.config.embed_concurrency = n.max(1);
        self
    }

    pub fn section_concurrency(mut self, n: usize) -> Self {
        self.config.section_concurrency = n.max(1);
        self
    }

    pub fn ocr_concurrency(mut self, n: usize) -> Self {
        self.config.ocr_concurrency = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.config.embedding_provider = Some(provider);
        self
    }

    pub fn offline_embeddings(mut self, v: bool) -> Self {
        self.config.offline_embeddings = v;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_ms(mut self, ms: u64) -> Self {
        self.config.api_timeout_ms = ms.max(1);
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_ms = secs.max(1) * 1000;
        self
    }

    pub fn job_timeout_secs(mut self, secs: u64) -> Self {
        self.config.job_timeout_secs = secs.max(1);
        self
    }

    pub fn partial_results(mut self, v: bool) -> Self {
        self.config.partial_results = v;
        self
    }

    pub fn ocr(mut self, v: bool) -> Self {
        self.config.ocr = v;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn min_image_px(mut self, px: u32) -> Self {
        self.config.min_image_px = px;
        self
    }

    pub fn chart_size(mut self, width: u32, height: u32) -> Self {
        self.config.chart_width = width.max(200);
        self.config.chart_height = height.max(150);
        self
    }

    pub fn sections(mut self, plan: SectionPlan) -> Self {
        self.config.sections = plan;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.artifact_dir = Some(dir.into());
        self
    }

    pub fn render_pdf(mut self, v: bool) -> Self {
        self.config.render_pdf = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ReportConfig, ReportError> {
        let c = &self.config;
        if c.chunk_size == 0 {
            return Err(ReportError::InvalidConfig("chunk_size must be ≥ 1".into()));
        }
        if c.chunk_overlap >= c.chunk_size {
            return Err(ReportError::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                c.chunk_overlap, c.chunk_size
            )));
        }
        if c.chunk_size > c.max_chunk_chars {
            return Err(ReportError::InvalidConfig(format!(
                "chunk_size ({}) must not exceed max_chunk_chars ({})",
                c.chunk_size, c.max_chunk_chars
            )));
        }
        c.sections.validate()?;
        Ok(self.config)
    }
}

// ── Section plan ─────────────────────────────────────────────────────────

/// One planned segment of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSpec {
    pub name: String,
    /// Used both as the retrieval query and as the writing instruction.
    pub goal: String,
    #[serde(default)]
    pub chart: bool,
    /// Forces a chart type instead of inferring it from the data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_hint: Option<ChartHint>,
}

impl SectionSpec {
    pub fn new(name: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            goal: goal.into(),
            chart: false,
            chart_hint: None,
        }
    }

    pub fn with_chart(mut self, hint: Option<ChartHint>) -> Self {
        self.chart = true;
        self.chart_hint = hint;
        self
    }
}

/// The fixed, ordered list of sections a report is made of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectionPlan(pub Vec<SectionSpec>);

impl Default for SectionPlan {
    fn default() -> Self {
        Self(vec![
            SectionSpec::new(
                "Executive Summary",
                "Summarise what this document is about, the overall business situation it describes, and the single most important takeaway for leadership.",
            ),
            SectionSpec::new(
                "Key Metrics",
                "Identify the most important quantitative figures (revenue, costs, volumes, growth rates, totals) and how they change across periods or categories.",
            )
            .with_chart(None),
            SectionSpec::new(
                "Key Insights",
                "Explain the notable patterns, trends, outliers and drivers visible in the data and text.",
            ),
            SectionSpec::new(
                "Risks",
                "Describe business, financial and operational risks, weaknesses, or declining indicators supported by the document.",
            ),
            SectionSpec::new(
                "Recommendations",
                "Propose concrete, prioritised actions that follow from the evidence in the document.",
            ),
        ])
    }
}

impl SectionPlan {
    pub fn new(sections: Vec<SectionSpec>) -> Self {
        Self(sections)
    }

    /// Load a plan from a JSON array of sections.
    pub fn from_json_file(path: &Path) -> Result<Self, ReportError> {
        let raw = std::fs::read_to_string(path).map_err(|_| ReportError::FileNotFound {
            path: path.to_path_buf(),
        })?;
        let plan: SectionPlan = serde_json::from_str(&raw).map_err(|e| {
            ReportError::InvalidConfig(format!("section plan {}: {e}", path.display()))
        })?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn sections(&self) -> &[SectionSpec] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn validate(&self) -> Result<(), ReportError> {
        if self.0.is_empty() {
            return Err(ReportError::InvalidConfig(
                "section plan must contain at least one section".into(),
            ));
        }
        let mut seen = HashSet::new();
        for s in &self.0 {
            if s.name.trim().is_empty() || s.goal.trim().is_empty() {
                return Err(ReportError::InvalidConfig(
                    "every section needs a name and a goal".into(),
                ));
            }
            if !seen.insert(s.name.to_lowercase()) {
                return Err(ReportError::InvalidConfig(format!(
                    "duplicate section name '{}'",
                    s.name
                )));
            }
        }
        Ok(())
    }
}
