//! CLI binary for edgequake-report.
//!
//! A thin shim over the library crate that maps CLI flags to `ReportConfig`,
//! runs one job and writes `report.md`, `report.pdf` and `artifacts/`.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_report::pipeline::input::resolve_input;
use edgequake_report::{
    Cancellation, JobStatus, ProgressCallback, ReportConfig, ReportPipeline,
    ReportProgressCallback, SectionPlan,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner while extracting and indexing, then a bar over the section plan.
/// Sections complete out of order, so start times are keyed by ordinal.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    degraded: AtomicUsize,
}

impl CliProgressCallback {
    fn new(total_sections: usize) -> Arc<Self> {
        let bar = ProgressBar::new(total_sections as u64);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Reading document…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            degraded: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>2}/{len} sections  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_style(style);
        self.bar.set_prefix("Writing");
    }

    fn elapsed(&self, ordinal: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut t| t.remove(&ordinal))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ReportProgressCallback for CliProgressCallback {
    fn on_stage(&self, _job_id: &str, status: JobStatus) {
        match status {
            JobStatus::Extracting => self.bar.set_message("Extracting content…"),
            JobStatus::Indexing => self.bar.set_message("Building the index…"),
            JobStatus::Synthesizing => self.activate_bar(),
            JobStatus::Rendering => {
                self.bar.set_prefix("Rendering");
                self.bar.set_message("PDF…");
            }
            _ => {}
        }
    }

    fn on_extracted(&self, units: u32, nodes: usize) {
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracted {nodes} content blocks from {units} page(s)/sheet(s)"))
        ));
    }

    fn on_indexed(&self, chunks: usize) {
        self.bar
            .println(format!("{} {}", cyan("◆"), dim(&format!("Indexed {chunks} chunks"))));
    }

    fn on_section_start(&self, ordinal: usize, _total: usize, name: &str) {
        if let Ok(mut t) = self.start_times.lock() {
            t.insert(ordinal, Instant::now());
        }
        self.bar.set_message(name.to_string());
    }

    fn on_section_complete(&self, ordinal: usize, total: usize, name: &str, body_len: usize) {
        let secs = self.elapsed(ordinal);
        self.bar.println(format!(
            "  {} {:>2}/{:<2} {:<24} {}  {}",
            green("✓"),
            ordinal,
            total,
            name,
            dim(&format!("{body_len:>5} chars")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_section_degraded(&self, ordinal: usize, total: usize, name: &str, reason: &str) {
        let secs = self.elapsed(ordinal);
        self.degraded.fetch_add(1, Ordering::SeqCst);
        let msg = if reason.chars().count() > 70 {
            format!("{}\u{2026}", reason.chars().take(69).collect::<String>())
        } else {
            reason.to_string()
        };
        self.bar.println(format!(
            "  {} {:>2}/{:<2} {:<24} {}  {}",
            yellow("⚠"),
            ordinal,
            total,
            name,
            yellow(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_job_complete(&self, _job_id: &str, status: JobStatus, degraded_sections: usize) {
        self.bar.finish_and_clear();
        match status {
            JobStatus::Done if degraded_sections == 0 => {
                eprintln!("{} report complete", green("✔"))
            }
            JobStatus::Done => eprintln!(
                "{} report complete, {} section(s) degraded",
                cyan("⚠"),
                bold(&degraded_sections.to_string())
            ),
            _ => eprintln!("{} report failed", red("✘")),
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # CSV to report.md + report.pdf + artifacts/ in ./report
  docreport sales.csv

  # Spreadsheet into a chosen directory
  docreport q3_financials.xlsx -o out/q3

  # Scanned invoice, OCR through the chat model
  docreport invoice.png --model gpt-4.1-mini

  # JSON envelope on stdout (as returned by the HTTP boundary)
  docreport --json report.pdf > envelope.json

  # Custom section plan
  docreport --sections plan.json board_pack.pdf

  # No embedding API: local hashing embeddings
  docreport --offline-embeddings notes.txt

SECTION PLAN FORMAT (--sections):
  [
    {"name": "Executive Summary", "goal": "Summarise the document."},
    {"name": "Key Metrics", "goal": "Quantify the main figures.", "chart": true, "chart_hint": "line"}
  ]

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Directory containing libpdfium (PDF inputs)
"#;

/// Turn business documents into grounded, chart-backed reports.
#[derive(Parser, Debug)]
#[command(
    name = "docreport",
    version,
    about = "Turn business documents into grounded, chart-backed strategic reports",
    long_about = "Extract the content of a PDF, CSV, XLSX, DOCX, scanned image or text file, ground an LLM \
in it section by section, draw charts from its tables, and write the report as Markdown and PDF. \
Supports OpenAI, Anthropic, Google Gemini, Azure OpenAI, and any OpenAI-compatible endpoint.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local document path or HTTP/HTTPS URL.
    input: String,

    /// Directory for report.md, report.pdf and artifacts/.
    #[arg(short, long, env = "DOCREPORT_OUTPUT_DIR", default_value = "report")]
    output_dir: PathBuf,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Declared MIME type, overriding the file extension.
    #[arg(long, env = "DOCREPORT_CONTENT_TYPE")]
    content_type: Option<String>,

    /// JSON file with the section plan.
    #[arg(long, env = "DOCREPORT_SECTIONS")]
    sections: Option<PathBuf>,

    /// Chunks retrieved per section.
    #[arg(long, env = "DOCREPORT_TOP_K", default_value_t = 4)]
    top_k: usize,

    /// Target chunk size in characters.
    #[arg(long, env = "DOCREPORT_CHUNK_SIZE", default_value_t = 800)]
    chunk_size: usize,

    /// Characters of overlap between consecutive text chunks.
    #[arg(long, env = "DOCREPORT_CHUNK_OVERLAP", default_value_t = 150)]
    chunk_overlap: usize,

    /// Sections generated concurrently.
    #[arg(short, long, env = "DOCREPORT_CONCURRENCY", default_value_t = 2)]
    concurrency: usize,

    /// Max LLM output tokens per section.
    #[arg(long, env = "DOCREPORT_MAX_TOKENS", default_value_t = 1024)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "DOCREPORT_TEMPERATURE", default_value_t = 0.2)]
    temperature: f32,

    /// Retries per section on transient LLM failure.
    #[arg(long, env = "DOCREPORT_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "DOCREPORT_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Wall-clock budget for the whole job in seconds.
    #[arg(long, env = "DOCREPORT_JOB_TIMEOUT", default_value_t = 600)]
    job_timeout: u64,

    /// On job timeout, keep the sections that finished.
    #[arg(long, env = "DOCREPORT_PARTIAL")]
    partial_results: bool,

    /// Skip OCR of image-only pages and scans.
    #[arg(long, env = "DOCREPORT_NO_OCR")]
    no_ocr: bool,

    /// Use local hashing embeddings instead of the provider's.
    #[arg(long, env = "DOCREPORT_OFFLINE_EMBEDDINGS")]
    offline_embeddings: bool,

    /// Skip PDF rendering.
    #[arg(long, env = "DOCREPORT_NO_PDF")]
    no_pdf: bool,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "DOCREPORT_PASSWORD")]
    password: Option<String>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "DOCREPORT_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Print the JSON envelope instead of writing files.
    #[arg(long, env = "DOCREPORT_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "DOCREPORT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCREPORT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCREPORT_QUIET")]
    quiet: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "DOCREPORT_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let plan = match &cli.sections {
        Some(path) => SectionPlan::from_json_file(path).context("Failed to load section plan")?,
        None => SectionPlan::default(),
    };
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new(plan.len()) as Arc<dyn ReportProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, plan, progress_cb).await?;

    let mut source = resolve_input(&cli.input, cli.download_timeout)
        .await
        .context("Failed to read input")?;
    if cli.content_type.is_some() {
        source.declared_type = cli.content_type.clone();
    }

    let pipeline = ReportPipeline::new(config)
        .await
        .context("Failed to initialise providers")?;

    let cancel = Cancellation::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let outcome = pipeline.run(source, cancel).await;

    if cli.json {
        let pdf_path = cli.output_dir.join("report.pdf");
        if let Ok(report) = &outcome.result {
            if let Some(pdf) = &report.pdf {
                write_file(&cli.output_dir, "report.pdf", pdf).await?;
            }
        }
        let envelope = outcome.envelope(Some(pdf_path.display().to_string()));
        println!(
            "{}",
            serde_json::to_string_pretty(&envelope).context("Failed to serialise envelope")?
        );
        if !envelope.is_success() {
            std::process::exit(1);
        }
        return Ok(());
    }

    let report = match outcome.result {
        Ok(report) => report,
        Err(e) => {
            if let Some(partial) = &outcome.partial {
                write_markdown(&cli.output_dir, &partial.markdown, &outcome.store).await?;
                eprintln!(
                    "{} partial report written to {}",
                    yellow("⚠"),
                    bold(&cli.output_dir.display().to_string())
                );
            }
            return Err(e).context("Report generation failed");
        }
    };

    write_markdown(&cli.output_dir, &report.markdown, &outcome.store).await?;
    if let Some(pdf) = &report.pdf {
        write_file(&cli.output_dir, "report.pdf", pdf).await?;
    } else if let Some(reason) = &report.render_error {
        eprintln!("{} PDF not written: {}", yellow("⚠"), reason);
    }

    if !cli.quiet {
        for w in &report.warnings {
            eprintln!("  {} {}", dim("note:"), dim(w));
        }
        eprintln!(
            "{}  {}/{} sections  {} chart(s)  {}ms  →  {}",
            if report.stats.sections_degraded == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            report.stats.sections_total - report.stats.sections_degraded,
            report.stats.sections_total,
            report.stats.charts,
            report.stats.total_duration_ms,
            bold(&cli.output_dir.display().to_string()),
        );
        eprintln!(
            "   {} tokens in  /  {} tokens out",
            dim(&report.stats.total_prompt_tokens.to_string()),
            dim(&report.stats.total_completion_tokens.to_string()),
        );
    }
    Ok(())
}

async fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(name);
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Write `report.md` with artifact references pointing at `artifacts/`.
async fn write_markdown(
    dir: &Path,
    markdown: &str,
    store: &edgequake_report::ArtifactStore,
) -> Result<()> {
    let written = store
        .persist(&dir.join("artifacts"))
        .await
        .context("Failed to write artifacts")?;
    let mut local = markdown.to_string();
    for path in &written {
        if let (Some(stem), Some(file)) = (path.file_stem(), path.file_name()) {
            local = local.replace(
                &format!("artifact:{}", stem.to_string_lossy()),
                &format!("artifacts/{}", file.to_string_lossy()),
            );
        }
    }
    write_file(dir, "report.md", local.as_bytes()).await
}

/// Map CLI args to `ReportConfig`.
async fn build_config(
    cli: &Cli,
    plan: SectionPlan,
    progress: Option<ProgressCallback>,
) -> Result<ReportConfig> {
    let system_prompt = if let Some(ref path) = cli.system_prompt {
        Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt from {:?}", path))?,
        )
    } else {
        None
    };

    let mut builder = ReportConfig::builder()
        .sections(plan)
        .top_k(cli.top_k)
        .chunk_size(cli.chunk_size)
        .chunk_overlap(cli.chunk_overlap)
        .section_concurrency(cli.concurrency)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .job_timeout_secs(cli.job_timeout)
        .partial_results(cli.partial_results)
        .ocr(!cli.no_ocr)
        .offline_embeddings(cli.offline_embeddings)
        .render_pdf(!cli.no_pdf)
        .download_timeout_secs(cli.download_timeout);

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password);
    }
    if let Some(prompt) = system_prompt {
        builder = builder.system_prompt(prompt);
    }

    builder.build().context("Invalid configuration")
}
