//! End-to-end tests for edgequake-report against live providers.
//!
//! These make real LLM and embedding API calls, so they are gated behind the
//! `E2E_ENABLED` environment variable and do not run in CI unless requested.
//!
//! Run with:
//!   E2E_ENABLED=1 DYLD_LIBRARY_PATH=. cargo test --test e2e -- --nocapture
//!
//! PDF tests additionally need files in `./test_cases/`.

use edgequake_report::{
    generate_report, generate_report_from_bytes, rewrite_artifact_links, ErrorKind, ReportConfig,
    ReportProgressCallback, SectionPlan, SectionSpec,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn test_cases_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases")
}

macro_rules! e2e_skip_unless_enabled {
    () => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
    }};
}

/// Skip unless E2E_ENABLED is set *and* the file at `path` exists.
macro_rules! e2e_skip_unless_ready {
    ($path:expr) => {{
        e2e_skip_unless_enabled!();
        let p: PathBuf = $path;
        if !p.exists() {
            println!("SKIP: test file not found: {}", p.display());
            return;
        }
        p
    }};
}

const QUARTERLY_CSV: &str = "\
quarter,revenue,costs,customers
Q1 2024,1200000,900000,310
Q2 2024,1350000,940000,342
Q3 2024,1290000,980000,351
Q4 2024,1610000,1010000,398
";

/// Every section present with a real body, in plan order.
fn assert_report_quality(markdown: &str, plan: &SectionPlan, context: &str) {
    let mut last = 0;
    for spec in plan.sections() {
        let heading = format!("## {}", spec.name);
        let at = markdown
            .find(&heading)
            .unwrap_or_else(|| panic!("[{context}] missing section '{}'", spec.name));
        assert!(at >= last, "[{context}] section '{}' out of order", spec.name);
        last = at;
    }
    assert!(
        !markdown.contains("```markdown"),
        "[{context}] output still wrapped in a markdown fence"
    );
    assert!(markdown.len() >= 400, "[{context}] report suspiciously short: {} bytes", markdown.len());
    println!("[{context}] ok: {} bytes", markdown.len());
}

// ── CSV reports ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_csv_report_end_to_end() {
    e2e_skip_unless_enabled!();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quarterly.csv");
    std::fs::write(&path, QUARTERLY_CSV).unwrap();

    let config = ReportConfig::builder()
        .max_retries(2)
        .artifact_dir(dir.path().join("artifacts"))
        .build()
        .expect("valid config");

    let report = generate_report(path.to_str().unwrap(), &config)
        .await
        .expect("report should succeed");

    assert_report_quality(&report.markdown, &config.sections, "csv");
    assert_eq!(report.stats.sections_total, 5);
    assert_eq!(report.stats.charts, 1, "Key Metrics should carry a chart");
    assert!(report.pdf.as_ref().is_some_and(|p| p.starts_with(b"%PDF")));

    let persisted: Vec<_> = std::fs::read_dir(dir.path().join("artifacts"))
        .unwrap()
        .flatten()
        .collect();
    assert_eq!(persisted.len(), report.artifact_refs.len());

    let linked = rewrite_artifact_links(&report.markdown, "artifacts");
    assert!(!linked.contains("artifact:"));
    println!("{linked}");
}

#[tokio::test]
async fn test_custom_plan_from_bytes() {
    e2e_skip_unless_enabled!();

    let plan = SectionPlan::new(vec![
        SectionSpec::new("Revenue Trend", "Describe how revenue changed quarter over quarter.")
            .with_chart(Some(edgequake_report::ChartHint::Line)),
        SectionSpec::new("Margin", "Compare revenue against costs and comment on the margin."),
    ]);
    let config = ReportConfig::builder()
        .sections(plan.clone())
        .render_pdf(false)
        .build()
        .unwrap();

    let report = generate_report_from_bytes(
        QUARTERLY_CSV.as_bytes().to_vec(),
        "quarterly.csv",
        Some("text/csv"),
        &config,
    )
    .await
    .expect("report should succeed");

    assert_eq!(report.sections.len(), 2);
    assert!(report.sections[0].chart.is_some());
    assert!(report.pdf.is_none());
    for section in &report.sections {
        assert!(!section.sources.is_empty(), "'{}' cited no sources", section.name);
    }
}

#[tokio::test]
async fn test_progress_callback_sees_every_section() {
    e2e_skip_unless_enabled!();

    #[derive(Default)]
    struct Counter {
        finished: AtomicUsize,
    }
    impl ReportProgressCallback for Counter {
        fn on_section_complete(&self, _o: usize, _t: usize, _n: &str, _len: usize) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
        fn on_section_degraded(&self, _o: usize, _t: usize, _n: &str, _r: &str) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    let counter = Arc::new(Counter::default());
    let config = ReportConfig::builder()
        .render_pdf(false)
        .progress_callback(counter.clone())
        .build()
        .unwrap();

    generate_report_from_bytes(QUARTERLY_CSV.as_bytes().to_vec(), "q.csv", None, &config)
        .await
        .expect("report should succeed");

    assert_eq!(counter.finished.load(Ordering::SeqCst), config.sections.len());
}

// ── PDF reports ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pdf_annual_report() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("annual_report.pdf"));

    let config = ReportConfig::builder().max_retries(2).build().unwrap();
    let report = generate_report(path.to_str().unwrap(), &config)
        .await
        .expect("report should succeed");

    assert_report_quality(&report.markdown, &config.sections, "annual_report");
    assert!(report.stats.source_units >= 1);
    assert!(report.sections.iter().any(|s| s.sources.iter().any(|t| t.starts_with("page"))));
}

#[tokio::test]
async fn test_missing_input_is_invalid() {
    e2e_skip_unless_enabled!();

    let err = generate_report("/definitely/not/a/real/file.csv", &ReportConfig::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}
