//! Pipeline orchestrator: one document in, one report out.
//!
//! A job moves `pending → extracting → indexing → synthesizing → rendering →
//! done`. Any fatal error short-circuits to `failed` with its [`ErrorKind`];
//! section, chart and render failures are absorbed into the report.
//!
//! [`ErrorKind`]: crate::error::ErrorKind

use crate::artifact::{artifact_refs, ArtifactKind, ArtifactStore};
use crate::cancel::Cancellation;
use crate::config::ReportConfig;
use crate::error::{JobFailure, RenderError, ReportError};
use crate::output::{Job, JobStatus, Report, ReportEnvelope, ReportStats, SourceRef};
use crate::pipeline::chart::ChartGenerator;
use crate::pipeline::chunk::{chunk, ChunkOptions};
use crate::pipeline::embed::{index, EmbeddingBackend, HashingEmbedder, ProviderEmbedder};
use crate::pipeline::extract::{detect_kind, extract, ExtractContext, ExtractOptions, ExtractorRegistry};
use crate::pipeline::input::{resolve_input, SourceDocument};
use crate::pipeline::llm::{GatewayPolicy, LlmGateway, ModelBackend, ProviderBackend};
use crate::pipeline::ocr::VisionOcr;
use crate::pipeline::render::render_pdf;
use crate::pipeline::synthesize::{assemble_markdown, Interruption, SynthesisSettings, Synthesizer};
use chrono::Utc;
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

/// Per-job state passed explicitly through every stage.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub store: Arc<ArtifactStore>,
    pub cancel: Cancellation,
    pub deadline: Instant,
    pub timeout_secs: u64,
}

impl JobContext {
    pub fn new(job_id: &str, cancel: Cancellation, timeout_secs: u64) -> Self {
        Self {
            job_id: job_id.to_string(),
            store: Arc::new(ArtifactStore::new(job_id)),
            cancel,
            deadline: Instant::now() + Duration::from_secs(timeout_secs),
            timeout_secs,
        }
    }

    /// Run one stage under the job deadline and cancellation token.
    async fn guard<T, F>(&self, stage: JobStatus, fut: F) -> Result<T, ReportError>
    where
        F: Future<Output = Result<T, ReportError>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ReportError::Cancelled {
                stage: stage.as_str().to_string(),
            }),
            r = tokio::time::timeout_at(self.deadline, fut) => r.unwrap_or_else(|_| {
                Err(ReportError::PipelineTimeout {
                    secs: self.timeout_secs,
                    stage: stage.as_str().to_string(),
                })
            }),
        }
    }
}

/// Everything a finished job leaves behind.
#[derive(Debug)]
pub struct JobOutcome {
    pub job: Job,
    pub result: Result<Report, ReportError>,
    /// Sections completed before a timeout, kept when `partial_results` is on.
    pub partial: Option<Report>,
    pub store: Arc<ArtifactStore>,
}

impl JobOutcome {
    /// The boundary payload. `pdf_url` is used only when a PDF exists.
    pub fn envelope(&self, pdf_url: Option<String>) -> ReportEnvelope {
        match &self.result {
            Ok(report) => ReportEnvelope::success(&self.job, report, pdf_url),
            Err(e) => ReportEnvelope::failure(&self.job, &JobFailure::from(e), self.partial.as_ref()),
        }
    }

    pub fn into_result(self) -> Result<Report, ReportError> {
        self.result
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ReportError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ReportError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. `config.provider`, used as-is.
/// 2. `config.provider_name` + `config.model` (default `gpt-4.1-nano`).
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, both set.
/// 4. `OPENAI_API_KEY` present: OpenAI.
/// 5. [`ProviderFactory::from_env`] auto-detection.
pub async fn resolve_provider(config: &ReportConfig) -> Result<Arc<dyn LLMProvider>, ReportError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ReportError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

/// Resolve the embedding backend: offline hashing, the configured provider,
/// or the environment's default embedding provider.
pub fn resolve_embedder(config: &ReportConfig) -> Result<Arc<dyn EmbeddingBackend>, ReportError> {
    if config.offline_embeddings {
        return Ok(Arc::new(HashingEmbedder::default()));
    }
    if let Some(ref provider) = config.embedding_provider {
        return Ok(Arc::new(ProviderEmbedder::new(Arc::clone(provider))));
    }
    let (_llm, embedding) =
        ProviderFactory::from_env().map_err(|e| ReportError::ProviderNotConfigured {
            provider: "embeddings".to_string(),
            hint: format!(
                "No embedding provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY or pass --offline-embeddings.\n\
                Error: {e}"
            ),
        })?;
    Ok(Arc::new(ProviderEmbedder::new(embedding)))
}

fn default_title(source_name: &str) -> String {
    let stem = Path::new(source_name)
        .file_stem()
        .map(|s| s.to_string_lossy().replace(['_', '-'], " "))
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "document".to_string());
    format!("Strategic Report: {}", stem.trim())
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

// ── Orchestrator ─────────────────────────────────────────────────────────

/// Turns final markdown into PDF bytes: `(markdown, store, title)`.
///
/// Runs on the blocking pool. Defaults to [`render_pdf`].
pub type PdfRenderer = Arc<dyn Fn(&str, &ArtifactStore, &str) -> Result<Vec<u8>, RenderError> + Send + Sync>;

/// Drives jobs end to end with a fixed configuration and backends.
pub struct ReportPipeline {
    config: ReportConfig,
    registry: ExtractorRegistry,
    model: Arc<dyn ModelBackend>,
    embedder: Arc<dyn EmbeddingBackend>,
    renderer: PdfRenderer,
}

impl ReportPipeline {
    /// Build a pipeline whose backends come from `config` and the environment.
    pub async fn new(config: ReportConfig) -> Result<Self, ReportError> {
        let provider = resolve_provider(&config).await?;
        let embedder = resolve_embedder(&config)?;
        Ok(Self::with_backends(config, Arc::new(ProviderBackend::new(provider)), embedder))
    }

    /// Build a pipeline around explicit backends.
    pub fn with_backends(
        config: ReportConfig,
        model: Arc<dyn ModelBackend>,
        embedder: Arc<dyn EmbeddingBackend>,
    ) -> Self {
        Self {
            config,
            registry: ExtractorRegistry::default(),
            model,
            embedder,
            renderer: Arc::new(render_pdf),
        }
    }

    pub fn with_registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_renderer<F>(mut self, renderer: F) -> Self
    where
        F: Fn(&str, &ArtifactStore, &str) -> Result<Vec<u8>, RenderError> + Send + Sync + 'static,
    {
        self.renderer = Arc::new(renderer);
        self
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    /// Process one document. Never panics on bad input; failures are
    /// reported through [`JobOutcome::result`].
    pub async fn run(&self, source: SourceDocument, cancel: Cancellation) -> JobOutcome {
        let mut job = Job::new(SourceRef {
            name: source.name.clone(),
            declared_type: source.declared_type.clone(),
            kind: None,
            size_bytes: source.bytes.len(),
        });
        let ctx = JobContext::new(&job.id, cancel, self.config.job_timeout_secs);
        let mut partial = None;

        let span = info_span!("job", job_id = %job.id);
        let result = self
            .drive(&mut job, &ctx, &source, &mut partial)
            .instrument(span)
            .await;

        match &result {
            Ok(report) => {
                job.finish();
                info!(
                    job_id = %job.id,
                    "Report done: {} section(s), {} degraded, {} chart(s) in {}ms",
                    report.stats.sections_total,
                    report.stats.sections_degraded,
                    report.stats.charts,
                    report.stats.total_duration_ms
                );
            }
            Err(e) => {
                warn!(job_id = %job.id, kind = e.kind().as_str(), "Job failed: {e}");
                job.fail(JobFailure::from(e));
            }
        }
        if let Some(cb) = &self.config.progress_callback {
            let degraded = result.as_ref().map(|r| r.stats.sections_degraded).unwrap_or(0);
            cb.on_job_complete(&job.id, job.status, degraded);
        }

        JobOutcome {
            job,
            result,
            partial,
            store: ctx.store,
        }
    }

    fn enter(&self, job: &mut Job, status: JobStatus) {
        job.advance(status);
        info!(job_id = %job.id, "stage: {status}");
        if let Some(cb) = &self.config.progress_callback {
            cb.on_stage(&job.id, status);
        }
    }

    async fn drive(
        &self,
        job: &mut Job,
        ctx: &JobContext,
        source: &SourceDocument,
        partial: &mut Option<Report>,
    ) -> Result<Report, ReportError> {
        let started = Instant::now();
        let config = &self.config;
        let mut stats = ReportStats::default();
        let gateway = LlmGateway::new(Arc::clone(&self.model), GatewayPolicy::from(config));

        // ── Extraction ───────────────────────────────────────────────────
        self.enter(job, JobStatus::Extracting);
        let kind = detect_kind(&source.bytes, source.declared_type.as_deref(), Some(&source.name))?;
        job.source.kind = Some(kind);

        let mut ectx = ExtractContext::new(Arc::clone(&ctx.store))
            .with_cancel(ctx.cancel.clone())
            .with_options(ExtractOptions::from(config));
        if config.ocr {
            ectx = ectx.with_ocr(Arc::new(VisionOcr::new(gateway.clone(), config.max_tokens)));
        }
        let t = Instant::now();
        let doc = ctx
            .guard(JobStatus::Extracting, extract(&self.registry, &source.bytes, kind, &ectx))
            .await?;
        stats.extraction_ms = elapsed_ms(t);
        stats.source_units = doc.unit_count;
        stats.content_nodes = doc.nodes.len();
        if let Some(cb) = &config.progress_callback {
            cb.on_extracted(doc.unit_count, doc.nodes.len());
        }

        // ── Indexing ─────────────────────────────────────────────────────
        self.enter(job, JobStatus::Indexing);
        let t = Instant::now();
        let chunks = chunk(&doc.nodes, &ChunkOptions::from(config));
        stats.chunks = chunks.len();
        let search_index = ctx
            .guard(
                JobStatus::Indexing,
                index(
                    chunks,
                    Arc::clone(&self.embedder),
                    config.embed_batch_size,
                    config.embed_concurrency,
                ),
            )
            .await?;
        stats.indexing_ms = elapsed_ms(t);
        if let Some(cb) = &config.progress_callback {
            cb.on_indexed(search_index.len());
        }

        // ── Synthesis ────────────────────────────────────────────────────
        self.enter(job, JobStatus::Synthesizing);
        let t = Instant::now();
        let title = doc.title.clone().unwrap_or_else(|| default_title(&source.name));
        let synthesizer = Synthesizer::new(
            gateway,
            ChartGenerator::new(config.chart_width, config.chart_height),
            Arc::new(search_index),
            Arc::clone(&ctx.store),
            SynthesisSettings::from_config(config, kind, doc.title.clone()),
        )
        .with_progress(config.progress_callback.clone());
        let outcome = synthesizer
            .synthesize(&config.sections, &ctx.cancel, Some(ctx.deadline))
            .await;
        stats.synthesis_ms = elapsed_ms(t);

        let generated_at = Utc::now();
        let markdown = assemble_markdown(&title, &source.name, generated_at, &outcome.sections);
        let mut warnings = doc.warnings.clone();
        for section in &outcome.sections {
            if let Some(e) = &section.chart_error {
                warnings.push(format!("chart for '{}' omitted: {e}", section.name));
            }
        }
        stats.sections_total = config.sections.len();
        stats.sections_degraded = outcome.sections.iter().filter(|s| s.is_degraded()).count();
        stats.charts = outcome.sections.iter().filter(|s| s.chart.is_some()).count();
        stats.total_prompt_tokens = outcome.sections.iter().map(|s| s.prompt_tokens as u64).sum();
        stats.total_completion_tokens = outcome.sections.iter().map(|s| s.completion_tokens as u64).sum();

        let mut report = Report {
            job_id: job.id.clone(),
            title: Some(title.clone()),
            generated_at,
            artifact_refs: artifact_refs(&markdown),
            sections: outcome.sections,
            markdown,
            pdf: None,
            render_error: None,
            partial: false,
            warnings,
            stats,
        };

        match outcome.interrupted {
            Some(Interruption::Cancelled) => {
                return Err(ReportError::Cancelled {
                    stage: JobStatus::Synthesizing.as_str().to_string(),
                })
            }
            Some(Interruption::Deadline) => {
                if config.partial_results {
                    report.partial = true;
                    report.stats.total_duration_ms = elapsed_ms(started);
                    *partial = Some(report);
                }
                return Err(ReportError::PipelineTimeout {
                    secs: ctx.timeout_secs,
                    stage: JobStatus::Synthesizing.as_str().to_string(),
                });
            }
            None => {}
        }

        // ── Rendering ────────────────────────────────────────────────────
        self.enter(job, JobStatus::Rendering);
        if config.render_pdf {
            let t = Instant::now();
            let store = Arc::clone(&ctx.store);
            let markdown = report.markdown.clone();
            let renderer = Arc::clone(&self.renderer);
            let task = tokio::task::spawn_blocking(move || renderer(&markdown, &store, &title));
            let rendered = ctx.guard(JobStatus::Rendering, async { Ok(task.await) }).await?;
            match rendered {
                Ok(Ok(pdf)) => report.pdf = Some(pdf),
                Ok(Err(e)) => {
                    warn!(job_id = %job.id, "PDF rendering failed, delivering markdown only: {e}");
                    report.render_error = Some(e.to_string());
                }
                Err(e) => {
                    warn!(job_id = %job.id, "PDF render task aborted, delivering markdown only: {e}");
                    report.render_error = Some(format!("render task aborted: {e}"));
                }
            }
            report.stats.render_ms = elapsed_ms(t);
        }

        if let Some(dir) = &config.artifact_dir {
            let persisted = ctx
                .guard(JobStatus::Rendering, async { Ok(ctx.store.persist(dir).await) })
                .await?;
            if let Err(e) = persisted {
                warn!("{e}");
                report.warnings.push(e.to_string());
            }
        }

        report.stats.total_duration_ms = elapsed_ms(started);
        Ok(report)
    }
}

// ── Convenience entry points ─────────────────────────────────────────────

/// Generate a report from a local path or HTTP(S) URL.
///
/// Providers are resolved from `config` and the environment. Only fatal
/// errors are returned as `Err`; degraded sections are listed in
/// [`Report::degraded_sections`].
pub async fn generate_report(input: impl AsRef<str>, config: &ReportConfig) -> Result<Report, ReportError> {
    let source = resolve_input(input.as_ref(), config.download_timeout_secs).await?;
    let pipeline = ReportPipeline::new(config.clone()).await?;
    pipeline.run(source, Cancellation::new()).await.into_result()
}

/// Generate a report from in-memory bytes.
pub async fn generate_report_from_bytes(
    bytes: Vec<u8>,
    name: &str,
    declared_type: Option<&str>,
    config: &ReportConfig,
) -> Result<Report, ReportError> {
    let source = SourceDocument {
        bytes,
        name: name.to_string(),
        declared_type: declared_type.map(str::to_string),
    };
    let pipeline = ReportPipeline::new(config.clone()).await?;
    pipeline.run(source, Cancellation::new()).await.into_result()
}

/// Blocking wrapper around [`generate_report`].
pub fn generate_report_sync(input: impl AsRef<str>, config: &ReportConfig) -> Result<Report, ReportError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ReportError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(generate_report(input, config))
}

// ── Service ──────────────────────────────────────────────────────────────

struct RetainedJob {
    store: Arc<ArtifactStore>,
    pdf: Option<Arc<Vec<u8>>>,
    finished: Instant,
}

/// Runs jobs with bounded concurrency and keeps their outputs for download.
///
/// Backs the HTTP boundary: `submit` for intake, [`ReportService::artifact`]
/// for `GET /artifacts/{id}` and [`ReportService::pdf`] for
/// `GET /reports/{job_id}.pdf`.
pub struct ReportService {
    pipeline: Arc<ReportPipeline>,
    permits: Arc<Semaphore>,
    retention: Duration,
    base_url: String,
    jobs: Mutex<HashMap<String, RetainedJob>>,
}

impl ReportService {
    pub const DEFAULT_RETENTION_SECS: u64 = 3600;

    pub fn new(pipeline: ReportPipeline, job_concurrency: usize) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            permits: Arc::new(Semaphore::new(job_concurrency.max(1))),
            retention: Duration::from_secs(Self::DEFAULT_RETENTION_SECS),
            base_url: String::new(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retention_secs(mut self, secs: u64) -> Self {
        self.retention = Duration::from_secs(secs);
        self
    }

    /// Prefix for `pdf_download_url`, e.g. `https://reports.example.com`.
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base_url = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Run one job to completion and return its envelope.
    pub async fn submit(&self, source: SourceDocument, cancel: Cancellation) -> ReportEnvelope {
        self.purge_expired();
        let outcome = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(_permit) => self.pipeline.run(source, cancel).await,
            Err(_) => {
                let mut job = Job::new(SourceRef {
                    name: source.name,
                    declared_type: source.declared_type,
                    kind: None,
                    size_bytes: source.bytes.len(),
                });
                let err = ReportError::Internal("report service is shutting down".into());
                job.fail(JobFailure::from(&err));
                return ReportEnvelope::failure(&job, &JobFailure::from(&err), None);
            }
        };

        let pdf = outcome
            .result
            .as_ref()
            .ok()
            .and_then(|r| r.pdf.clone())
            .map(Arc::new);
        let pdf_url = format!("{}/reports/{}.pdf", self.base_url, outcome.job.id);
        let envelope = outcome.envelope(Some(pdf_url));

        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(
                outcome.job.id.clone(),
                RetainedJob {
                    store: Arc::clone(&outcome.store),
                    pdf,
                    finished: Instant::now(),
                },
            );
        }
        envelope
    }

    /// Bytes and media type of a retained artifact.
    pub fn artifact(&self, id: &str) -> Option<(Arc<Vec<u8>>, String)> {
        self.purge_expired();
        let jobs = self.jobs.lock().ok()?;
        jobs.values()
            .find_map(|j| j.store.get_str(id))
            .map(|a| (a.bytes, a.media_type))
    }

    /// Rendered PDF of a retained job.
    pub fn pdf(&self, job_id: &str) -> Option<Arc<Vec<u8>>> {
        self.purge_expired();
        let jobs = self.jobs.lock().ok()?;
        jobs.get(job_id).and_then(|j| j.pdf.clone())
    }

    /// Charts retained for a job, in registration order.
    pub fn charts(&self, job_id: &str) -> Vec<String> {
        let Ok(jobs) = self.jobs.lock() else {
            return Vec::new();
        };
        jobs.get(job_id)
            .map(|j| {
                j.store
                    .list_kind(ArtifactKind::Chart)
                    .into_iter()
                    .map(|a| a.id.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop jobs older than the retention window. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut jobs) = self.jobs.lock() else {
            return 0;
        };
        let before = jobs.len();
        let retention = self.retention;
        jobs.retain(|_, j| j.finished.elapsed() < retention);
        before - jobs.len()
    }

    pub fn retained_jobs(&self) -> usize {
        self.jobs.lock().map(|j| j.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_title_from_file_name() {
        assert_eq!(default_title("q3_sales-data.csv"), "Strategic Report: q3 sales data");
        assert_eq!(default_title(""), "Strategic Report: document");
    }

    #[tokio::test]
    async fn guard_reports_timeout_stage() {
        let ctx = JobContext::new("job", Cancellation::new(), 0);
        let err = ctx
            .guard(JobStatus::Indexing, async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, ReportError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::PipelineTimeout { ref stage, .. } if stage == "indexing"));
    }

    #[tokio::test]
    async fn guard_reports_cancellation() {
        let cancel = Cancellation::new();
        let ctx = JobContext::new("job", cancel.clone(), 60);
        cancel.cancel();
        let err = ctx
            .guard(JobStatus::Extracting, std::future::pending::<Result<(), ReportError>>())
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::Cancelled { .. }));
    }

    #[test]
    fn offline_embeddings_need_no_provider() {
        let config = ReportConfig::builder().offline_embeddings(true).build().unwrap();
        let embedder = resolve_embedder(&config).unwrap();
        assert_eq!(embedder.name(), "hashing");
    }
}
