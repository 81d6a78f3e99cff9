//! Report synthesizer: section plan → ordered section results → markdown.
//!
//! Each section walks `pending → retrieving → generating → (chart_pending)
//! → section_done`. Sections run concurrently (`section_concurrency`) and
//! may finish in any order; results are re-sorted by plan ordinal before
//! assembly. A failed model call never fails the report: the section body
//! becomes a degraded placeholder and the job carries on.
//!
//! The job deadline and cancellation are checked between section
//! completions. When either fires, in-flight sections are dropped and only
//! completed ones are returned.

use crate::artifact::ArtifactStore;
use crate::cancel::Cancellation;
use crate::config::{ReportConfig, SectionPlan, SectionSpec};
use crate::document::DocumentKind;
use crate::error::SectionError;
use crate::output::{SectionResult, SectionState};
use crate::pipeline::chart::{ChartGenerator, RenderedChart};
use crate::pipeline::embed::SearchIndex;
use crate::pipeline::llm::{LlmGateway, ModelRequest};
use crate::pipeline::postprocess::clean_section;
use crate::pipeline::retrieve::{retrieve, retrieve_tables};
use crate::progress::ProgressCallback;
use crate::prompts::{build_section_prompt, degraded_placeholder, provenance_tag, DEFAULT_SYSTEM_PROMPT};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Candidate tables considered when a section needs a chart.
const CHART_CANDIDATES: usize = 3;

/// Why synthesis stopped before every section finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    Deadline,
    Cancelled,
}

/// Sections that finished, in plan order.
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub sections: Vec<SectionResult>,
    pub interrupted: Option<Interruption>,
}

/// Per-job synthesis settings.
#[derive(Debug, Clone)]
pub struct SynthesisSettings {
    pub top_k: usize,
    pub concurrency: usize,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub document_kind: DocumentKind,
    pub document_title: Option<String>,
}

impl SynthesisSettings {
    pub fn from_config(config: &ReportConfig, kind: DocumentKind, title: Option<String>) -> Self {
        Self {
            top_k: config.top_k.max(1),
            concurrency: config.section_concurrency.max(1),
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            document_kind: kind,
            document_title: title,
        }
    }
}

/// Drives retrieval, generation and charting for every planned section.
pub struct Synthesizer {
    gateway: LlmGateway,
    charts: ChartGenerator,
    index: Arc<SearchIndex>,
    store: Arc<ArtifactStore>,
    settings: SynthesisSettings,
    progress: Option<ProgressCallback>,
}

impl Synthesizer {
    pub fn new(
        gateway: LlmGateway,
        charts: ChartGenerator,
        index: Arc<SearchIndex>,
        store: Arc<ArtifactStore>,
        settings: SynthesisSettings,
    ) -> Self {
        Self {
            gateway,
            charts,
            index,
            store,
            settings,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Run every section of `plan`.
    pub async fn synthesize(
        &self,
        plan: &SectionPlan,
        cancel: &Cancellation,
        deadline: Option<Instant>,
    ) -> SynthesisOutcome {
        let total = plan.len();
        info!(
            "Synthesizing {} section(s), {} at a time",
            total, self.settings.concurrency
        );

        let mut pending = stream::iter(plan.sections().iter().enumerate())
            .map(|(ordinal, spec)| self.run_section(spec, ordinal, total, cancel))
            .buffer_unordered(self.settings.concurrency);

        let expiry = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        let mut sections = Vec::with_capacity(total);
        let mut interrupted = None;
        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some(result) => sections.push(result),
                    None => break,
                },
                _ = cancel.cancelled() => {
                    interrupted = Some(Interruption::Cancelled);
                    break;
                }
                _ = &mut expiry => {
                    warn!("job deadline reached with {}/{} section(s) complete", sections.len(), total);
                    interrupted = Some(Interruption::Deadline);
                    break;
                }
            }
        }

        sections.sort_by_key(|s: &SectionResult| s.ordinal);
        SynthesisOutcome {
            sections,
            interrupted,
        }
    }

    async fn run_section(
        &self,
        spec: &SectionSpec,
        ordinal: usize,
        total: usize,
        cancel: &Cancellation,
    ) -> SectionResult {
        let mut result = SectionResult {
            name: spec.name.clone(),
            ordinal,
            body: String::new(),
            chart: None,
            chart_kind: None,
            error: None,
            chart_error: None,
            state: SectionState::Pending,
            context_chunks: 0,
            sources: Vec::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            attempts: 0,
        };
        if let Some(cb) = &self.progress {
            cb.on_section_start(ordinal + 1, total, &spec.name);
        }

        result.state = SectionState::Retrieving;
        let query = format!("{}. {}", spec.name, spec.goal);
        let context = match retrieve(&self.index, &query, self.settings.top_k).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(section = %spec.name, "retrieval failed: {e}");
                return self.degrade(
                    result,
                    SectionError::ModelUnavailable {
                        attempts: 0,
                        detail: format!("context retrieval failed: {e}"),
                    },
                    total,
                );
            }
        };
        result.context_chunks = context.len();
        result.sources = context
            .iter()
            .map(|hit| provenance_tag(hit, self.settings.document_kind))
            .collect();
        debug!(section = %spec.name, "retrieved {} chunk(s)", context.len());

        result.state = SectionState::Generating;
        let request = ModelRequest {
            system: self.settings.system_prompt.clone(),
            user: build_section_prompt(
                spec,
                &context,
                self.settings.document_kind,
                self.settings.document_title.as_deref(),
            ),
            images: Vec::new(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };
        match self.gateway.generate(&request, cancel).await {
            Ok(generation) => {
                result.prompt_tokens = generation.prompt_tokens;
                result.completion_tokens = generation.completion_tokens;
                result.attempts = generation.attempts;
                let body = clean_section(&generation.content, &spec.name);
                if body.is_empty() {
                    result.error = Some(SectionError::ModelUnavailable {
                        attempts: generation.attempts,
                        detail: "answer was empty after cleanup".into(),
                    });
                } else {
                    result.body = body;
                }
            }
            Err(e) => {
                result.attempts = e.attempts().unwrap_or(0);
                result.error = Some(e);
            }
        }

        if spec.chart && result.error != Some(SectionError::Cancelled) {
            result.state = SectionState::ChartPending;
            match self.chart_for(spec).await {
                Ok(chart) => {
                    result.chart = Some(chart.id);
                    result.chart_kind = Some(chart.kind);
                }
                Err(e) => {
                    debug!(section = %spec.name, "chart omitted: {e}");
                    result.chart_error = Some(e);
                }
            }
        }

        match result.error.clone() {
            Some(e) => self.degrade(result, e, total),
            None => {
                result.state = SectionState::SectionDone;
                if let Some(cb) = &self.progress {
                    cb.on_section_complete(ordinal + 1, total, &spec.name, result.body.len());
                }
                result
            }
        }
    }

    /// Plot the most relevant plottable table for `spec`.
    async fn chart_for(&self, spec: &SectionSpec) -> Result<RenderedChart, SectionError> {
        let query = format!("{}. {}", spec.name, spec.goal);
        let candidates = retrieve_tables(&self.index, &query, CHART_CANDIDATES)
            .await
            .map_err(|e| SectionError::UnplottableData {
                detail: format!("table retrieval failed: {e}"),
            })?;
        let mut last = SectionError::UnplottableData {
            detail: "the document contains no tables".into(),
        };
        for hit in candidates {
            let Some(table) = hit.chunk.table.as_ref() else {
                continue;
            };
            match self
                .charts
                .render_chart(table, spec.chart_hint, &spec.name, &self.store)
            {
                Ok(chart) => return Ok(chart),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    fn degrade(&self, mut result: SectionResult, error: SectionError, total: usize) -> SectionResult {
        let reason = error.to_string();
        warn!(section = %result.name, kind = error.kind().as_str(), "section degraded: {reason}");
        result.body = degraded_placeholder(&reason);
        result.error = Some(error);
        result.state = SectionState::SectionDone;
        if let Some(cb) = &self.progress {
            cb.on_section_degraded(result.ordinal + 1, total, &result.name, &reason);
        }
        result
    }
}

/// Assemble the final markdown document.
///
/// Layout: report title, a generation line, then one `##` section per
/// result in the given order, each followed by its chart reference.
pub fn assemble_markdown(
    title: &str,
    source_name: &str,
    generated_at: DateTime<Utc>,
    sections: &[SectionResult],
) -> String {
    let mut md = format!(
        "# {}\n\n_Generated {} from {}_\n",
        title.trim(),
        generated_at.format("%Y-%m-%d %H:%M UTC"),
        source_name
    );
    for section in sections {
        md.push_str(&format!("\n## {}\n\n{}\n", section.name, section.body.trim()));
        if let Some(chart) = &section.chart {
            md.push_str(&format!("\n![{}]({})\n", section.name, chart.reference()));
        }
        if !section.is_degraded() && !section.sources.is_empty() {
            let mut sources: Vec<&str> = Vec::new();
            for s in &section.sources {
                if !sources.contains(&s.as_str()) {
                    sources.push(s);
                }
            }
            md.push_str(&format!("\n_Sources: {}_\n", sources.join("; ")));
        }
    }
    md
}
