//! End-to-end pipeline tests against scripted model backends.
//!
//! No network: the model is a local [`ModelBackend`] and embeddings use the
//! offline hashing embedder, so these run on every `cargo test`.

use async_trait::async_trait;
use edgequake_report::pipeline::embed::HashingEmbedder;
use edgequake_report::pipeline::llm::{BackendError, ModelBackend, ModelReply, ModelRequest};
use edgequake_report::{
    ArtifactKind, Cancellation, ChartHint, ErrorKind, JobStatus, ReportConfig, ReportEnvelope, ReportPipeline,
    RenderError, ReportService, SectionPlan, SectionSpec, SourceDocument,
};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Backends ─────────────────────────────────────────────────────────────────

/// Answers every section with a short grounded paragraph naming it.
#[derive(Default)]
struct Analyst {
    calls: AtomicUsize,
}

fn section_of(request: &ModelRequest) -> String {
    request
        .user
        .lines()
        .find_map(|l| l.strip_prefix("Section: "))
        .unwrap_or("unknown")
        .to_string()
}

#[async_trait]
impl ModelBackend for Analyst {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let section = section_of(request);
        Ok(ModelReply {
            content: format!("Analysis for {section}: revenue rose from 100 to 130 across the quarter [S1]."),
            prompt_tokens: 120,
            completion_tokens: 30,
        })
    }
}

/// Sleeps before answering.
struct Slow(Duration);

#[async_trait]
impl ModelBackend for Slow {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, BackendError> {
        tokio::time::sleep(self.0).await;
        Ok(ModelReply {
            content: format!("Late analysis for {}.", section_of(request)),
            ..Default::default()
        })
    }
}

/// Never answers.
struct Hung;

#[async_trait]
impl ModelBackend for Hung {
    async fn complete(&self, _request: &ModelRequest) -> Result<ModelReply, BackendError> {
        std::future::pending().await
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

const SALES_CSV: &str = "month,revenue\nJan,100\nFeb,120\nMar,130\n";

fn base_config() -> edgequake_report::ReportConfigBuilder {
    ReportConfig::builder()
        .offline_embeddings(true)
        .ocr(false)
        .retry_backoff_ms(1)
}

fn pipeline(config: ReportConfig, model: impl ModelBackend + 'static) -> ReportPipeline {
    ReportPipeline::with_backends(config, Arc::new(model), Arc::new(HashingEmbedder::default()))
}

fn source(bytes: &[u8], name: &str, declared: Option<&str>) -> SourceDocument {
    SourceDocument {
        bytes: bytes.to_vec(),
        name: name.to_string(),
        declared_type: declared.map(str::to_string),
    }
}

/// Index of `s` in the shared string table, appending it when new.
fn intern(strings: &mut Vec<String>, s: &str) -> usize {
    match strings.iter().position(|x| x == s) {
        Some(i) => i,
        None => {
            strings.push(s.to_string());
            strings.len() - 1
        }
    }
}

/// Minimal XLSX with shared strings. Each sheet is `(name, rows)`; a sheet
/// with `None` rows gets a worksheet part whose XML does not parse.
fn xlsx(sheets: &[(&str, Option<&[(&str, u32)]>)]) -> Vec<u8> {
    const NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
    let mut strings: Vec<String> = Vec::new();
    let mut parts = Vec::new();
    let mut listed = String::new();
    let mut rels = String::new();

    for (i, (name, rows)) in sheets.iter().enumerate() {
        let n = i + 1;
        listed.push_str(&format!(r#"<sheet name="{name}" sheetId="{n}" r:id="rId{n}"/>"#));
        rels.push_str(&format!(
            r#"<Relationship Id="rId{n}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{n}.xml"/>"#
        ));

        let mut sheet = format!(r#"<?xml version="1.0" encoding="UTF-8"?><worksheet xmlns="{NS}"><sheetData>"#);
        match rows {
            Some(rows) => {
                let region = intern(&mut strings, "region");
                let units = intern(&mut strings, "units");
                sheet.push_str(&format!(
                    r#"<row r="1"><c r="A1" t="s"><v>{region}</v></c><c r="B1" t="s"><v>{units}</v></c></row>"#
                ));
                for (j, (label, value)) in rows.iter().enumerate() {
                    let r = j + 2;
                    let idx = intern(&mut strings, label);
                    sheet.push_str(&format!(
                        r#"<row r="{r}"><c r="A{r}" t="s"><v>{idx}</v></c><c r="B{r}"><v>{value}</v></c></row>"#
                    ));
                }
                sheet.push_str("</sheetData></worksheet>");
            }
            None => sheet.push_str(r#"<row r="1"><c r="A1"><v>1</v></c></sheetData></worksheet>"#),
        }
        parts.push((format!("xl/worksheets/sheet{n}.xml"), sheet));
    }

    let mut shared = format!(r#"<?xml version="1.0" encoding="UTF-8"?><sst xmlns="{NS}">"#);
    for s in &strings {
        shared.push_str(&format!("<si><t>{s}</t></si>"));
    }
    shared.push_str("</sst>");

    let workbook = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><workbook xmlns="{NS}" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>{listed}</sheets></workbook>"#
    );
    let rels = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{rels}</Relationships>"#
    );
    parts.push(("xl/workbook.xml".to_string(), workbook));
    parts.push(("xl/_rels/workbook.xml.rels".to_string(), rels));
    parts.push(("xl/sharedStrings.xml".to_string(), shared));

    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let opts = zip::write::SimpleFileOptions::default();
    for (name, body) in parts {
        zip.start_file(name, opts).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

// ── Happy path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn csv_report_charts_key_metrics() {
    let config = base_config().build().unwrap();
    let outcome = pipeline(config, Analyst::default())
        .run(source(SALES_CSV.as_bytes(), "sales.csv", Some("text/csv")), Cancellation::new())
        .await;

    assert_eq!(outcome.job.status, JobStatus::Done);
    let report = outcome.result.as_ref().expect("report");

    let names: Vec<&str> = report.sections.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        ["Executive Summary", "Key Metrics", "Key Insights", "Risks", "Recommendations"]
    );
    assert_eq!(report.stats.sections_degraded, 0);

    let metrics = &report.sections[1];
    let chart = metrics.chart.as_ref().expect("Key Metrics chart");
    assert!(metrics.chart_error.is_none());
    assert_eq!(metrics.chart_kind, Some(ChartHint::Line), "monthly series draws a line");
    assert!(report.markdown.contains(&chart.reference()));
    assert_eq!(report.artifact_refs, vec![chart.clone()]);

    let artifact = outcome.store.get(chart).expect("chart registered");
    assert_eq!(artifact.kind, ArtifactKind::Chart);
    assert_eq!(artifact.media_type, "image/png");
    assert!(artifact.bytes.starts_with(b"\x89PNG"));

    assert!(report.sections.iter().enumerate().all(|(i, s)| s.ordinal == i));
    assert!(report.sections.iter().all(|s| s.chart.is_none() || s.name == "Key Metrics"));

    let pdf = report.pdf.as_ref().expect("pdf rendered");
    assert!(pdf.starts_with(b"%PDF"));
    assert!(report.render_error.is_none());
}

#[tokio::test]
async fn markdown_follows_plan_order() {
    let plan = SectionPlan::new(vec![
        SectionSpec::new("Zeta", "Describe revenue."),
        SectionSpec::new("Alpha", "Describe months."),
        SectionSpec::new("Mu", "Describe growth."),
    ]);
    let config = base_config()
        .sections(plan)
        .section_concurrency(3)
        .render_pdf(false)
        .build()
        .unwrap();
    let report = pipeline(config, Analyst::default())
        .run(source(SALES_CSV.as_bytes(), "sales.csv", None), Cancellation::new())
        .await
        .into_result()
        .unwrap();

    let zeta = report.markdown.find("## Zeta").unwrap();
    let alpha = report.markdown.find("## Alpha").unwrap();
    let mu = report.markdown.find("## Mu").unwrap();
    assert!(zeta < alpha && alpha < mu);
    assert!(report.markdown.starts_with("# Strategic Report: sales"));
    assert!(report.pdf.is_none());
}

#[tokio::test]
async fn xlsx_workbook_is_charted() {
    let bytes = xlsx(&[("Units", Some(&[("North", 40), ("South", 25), ("East", 31)][..]))]);
    let config = base_config().render_pdf(false).build().unwrap();
    let outcome = pipeline(config, Analyst::default())
        .run(source(&bytes, "units.xlsx", None), Cancellation::new())
        .await;

    assert_eq!(outcome.job.source.kind, Some(edgequake_report::DocumentKind::Spreadsheet));
    let report = outcome.result.expect("report");
    assert_eq!(report.stats.source_units, 1);
    assert_eq!(report.stats.charts, 1);
}

#[tokio::test]
async fn multi_sheet_workbook_skips_unreadable_sheet() {
    let bytes = xlsx(&[
        ("2022", Some(&[("North", 30), ("South", 21)][..])),
        ("2023", Some(&[("North", 36), ("South", 24)][..])),
        ("2024", Some(&[("North", 40), ("South", 25)][..])),
        ("Scratch", None),
    ]);
    let config = base_config().render_pdf(false).build().unwrap();
    let outcome = pipeline(config, Analyst::default())
        .run(source(&bytes, "regions.xlsx", None), Cancellation::new())
        .await;

    assert_eq!(outcome.job.status, JobStatus::Done);
    let report = outcome.result.expect("report");
    assert_eq!(report.stats.source_units, 4);
    assert_eq!(report.stats.content_nodes, 3);

    let sheet_warnings: Vec<&String> = report.warnings.iter().filter(|w| w.starts_with("sheet ")).collect();
    assert_eq!(sheet_warnings.len(), 1, "{:?}", report.warnings);
    assert!(sheet_warnings[0].starts_with("sheet 4 'Scratch' unreadable"));

    let cited: Vec<&String> = report.sections.iter().flat_map(|s| &s.sources).collect();
    assert!(!cited.iter().any(|t| t.contains("sheet 4")), "{cited:?}");
}

/// Word package with a heading, two paragraphs and one monthly table.
fn docx() -> Vec<u8> {
    let cell = |t: &str| format!("<w:tc><w:p><w:r><w:t>{t}</w:t></w:r></w:p></w:tc>");
    let mut table = String::from("<w:tbl>");
    for (a, b) in [("month", "revenue"), ("Jan", "100"), ("Feb", "120"), ("Mar", "130")] {
        table.push_str(&format!("<w:tr>{}{}</w:tr>", cell(a), cell(b)));
    }
    table.push_str("</w:tbl>");
    let document = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body><w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Quarter in review</w:t></w:r></w:p><w:p><w:r><w:t>Revenue rose every month.</w:t></w:r></w:p>{table}<w:p><w:r><w:t>Costs stayed flat.</w:t></w:r></w:p></w:body></w:document>"#
    );

    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
        .unwrap();
    zip.write_all(document.as_bytes()).unwrap();
    zip.finish().unwrap().into_inner()
}

#[tokio::test]
async fn docx_memo_is_reported_with_chart() {
    let config = base_config().render_pdf(false).build().unwrap();
    let outcome = pipeline(config, Analyst::default())
        .run(source(&docx(), "memo.docx", None), Cancellation::new())
        .await;

    assert_eq!(outcome.job.status, JobStatus::Done);
    assert_eq!(outcome.job.source.kind, Some(edgequake_report::DocumentKind::Docx));
    let report = outcome.result.expect("report");
    assert_eq!(report.stats.source_units, 1);
    assert_eq!(report.stats.content_nodes, 3);
    assert_eq!(report.stats.charts, 1);
}

#[tokio::test]
async fn undeclared_docx_is_sniffed() {
    let config = base_config().render_pdf(false).build().unwrap();
    let outcome = pipeline(config, Analyst::default())
        .run(source(&docx(), "upload", None), Cancellation::new())
        .await;
    assert_eq!(outcome.job.source.kind, Some(edgequake_report::DocumentKind::Docx));
    assert_eq!(outcome.job.status, JobStatus::Done);
}

#[tokio::test]
async fn text_without_tables_omits_chart_with_warning() {
    let notes = "Board notes.\n\nThe team expanded into two new regions and hired a sales lead.\n";
    let config = base_config().render_pdf(false).build().unwrap();
    let report = pipeline(config, Analyst::default())
        .run(source(notes.as_bytes(), "notes.txt", Some("text/plain")), Cancellation::new())
        .await
        .into_result()
        .unwrap();

    let metrics = &report.sections[1];
    assert!(metrics.chart.is_none());
    let err = metrics.chart_error.as_ref().expect("chart error recorded");
    assert_eq!(err.kind(), ErrorKind::UnplottableData);
    assert!(!metrics.is_degraded(), "a missing chart does not degrade the narrative");
    assert!(report.warnings.iter().any(|w| w.contains("Key Metrics")));
    assert!(report.artifact_refs.is_empty());
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn corrupted_pdf_fails_the_job() {
    let config = base_config().build().unwrap();
    let backend = Arc::new(Analyst::default());
    let outcome = ReportPipeline::with_backends(
        config,
        Arc::clone(&backend) as Arc<dyn ModelBackend>,
        Arc::new(HashingEmbedder::default()),
    )
    .run(
        source(b"this is not a pdf at all", "broken.pdf", Some("application/pdf")),
        Cancellation::new(),
    )
    .await;

    assert_eq!(outcome.job.status, JobStatus::Failed);
    let failure = outcome.job.error.as_ref().expect("failure recorded");
    assert_eq!(failure.kind, ErrorKind::ExtractionFailure);
    assert_eq!(outcome.result.as_ref().unwrap_err().kind(), ErrorKind::ExtractionFailure);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0, "no model call after a fatal error");

    let env = outcome.envelope(None);
    assert_eq!(env.status, ReportEnvelope::ERROR);
    assert_eq!(env.error_kind, Some(ErrorKind::ExtractionFailure));
    assert!(env.markdown_content.is_empty());
}

#[tokio::test]
async fn undeclared_binary_is_unsupported() {
    let config = base_config().build().unwrap();
    let err = pipeline(config, Analyst::default())
        .run(source(&[0u8, 159, 146, 150, 0, 1], "blob", None), Cancellation::new())
        .await
        .into_result()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
}

#[tokio::test]
async fn model_timeouts_degrade_every_section_but_job_completes() {
    let config = base_config()
        .api_timeout_ms(20)
        .max_retries(1)
        .section_concurrency(5)
        .build()
        .unwrap();
    let outcome = pipeline(config, Slow(Duration::from_secs(5)))
        .run(source(SALES_CSV.as_bytes(), "sales.csv", None), Cancellation::new())
        .await;

    assert_eq!(outcome.job.status, JobStatus::Done);
    let report = outcome.result.expect("degraded report still succeeds");
    assert_eq!(report.stats.sections_degraded, 5);
    for section in &report.sections {
        assert!(section.is_degraded());
        assert!(
            section.body.starts_with("_Insufficient grounded context available:"),
            "{}",
            section.body
        );
        assert_eq!(section.error.as_ref().unwrap().kind(), ErrorKind::ModelTimeout);
        assert_eq!(section.attempts, 2);
    }
    // Charts come from tables, not the model.
    assert!(report.sections[1].chart.is_some());
    assert!(report.pdf.is_some());
}

#[tokio::test]
async fn cancellation_fails_with_cancelled() {
    let config = base_config().build().unwrap();
    let cancel = Cancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = pipeline(config, Hung)
        .run(source(SALES_CSV.as_bytes(), "sales.csv", None), cancel)
        .await;

    assert_eq!(outcome.job.status, JobStatus::Failed);
    assert_eq!(outcome.job.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert!(outcome.partial.is_none());
}

#[tokio::test]
async fn deadline_keeps_completed_sections_when_partial_results_enabled() {
    let config = base_config()
        .job_timeout_secs(1)
        .api_timeout_ms(10_000)
        .section_concurrency(1)
        .partial_results(true)
        .build()
        .unwrap();
    let outcome = pipeline(config, Slow(Duration::from_millis(400)))
        .run(source(SALES_CSV.as_bytes(), "sales.csv", None), Cancellation::new())
        .await;

    assert_eq!(outcome.job.status, JobStatus::Failed);
    assert_eq!(outcome.result.as_ref().unwrap_err().kind(), ErrorKind::PipelineTimeout);

    let partial = outcome.partial.as_ref().expect("partial report kept");
    assert!(partial.partial);
    assert!(!partial.sections.is_empty() && partial.sections.len() < 5);
    assert_eq!(partial.sections[0].name, "Executive Summary");

    let env = outcome.envelope(None);
    assert_eq!(env.error_kind, Some(ErrorKind::PipelineTimeout));
    assert!(env.markdown_content.contains("## Executive Summary"));
}

#[tokio::test]
async fn deadline_without_partial_results_returns_nothing() {
    let config = base_config()
        .job_timeout_secs(1)
        .section_concurrency(1)
        .build()
        .unwrap();
    let outcome = pipeline(config, Hung)
        .run(source(SALES_CSV.as_bytes(), "sales.csv", None), Cancellation::new())
        .await;

    assert_eq!(outcome.job.error.as_ref().unwrap().kind, ErrorKind::PipelineTimeout);
    assert!(outcome.partial.is_none());
    assert!(outcome.envelope(None).markdown_content.is_empty());
}

// ── Rendering ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn panicking_renderer_delivers_markdown_only() {
    let config = base_config().build().unwrap();
    let outcome = pipeline(config, Analyst::default())
        .with_renderer(|_, _, _| -> Result<Vec<u8>, RenderError> { panic!("font table corrupt") })
        .run(source(SALES_CSV.as_bytes(), "sales.csv", None), Cancellation::new())
        .await;

    assert_eq!(outcome.job.status, JobStatus::Done);
    assert!(outcome.job.error.is_none());
    let report = outcome.result.as_ref().expect("report");
    assert!(report.pdf.is_none());
    let reason = report.render_error.as_deref().expect("render error recorded");
    assert!(reason.starts_with("render task aborted"), "{reason}");
    assert!(report.markdown.contains("## Key Metrics"));
}

#[tokio::test]
async fn failing_renderer_keeps_the_job_done() {
    let config = base_config().build().unwrap();
    let outcome = pipeline(config, Analyst::default())
        .with_renderer(|_, _, _| Err(RenderError::Writer("out of glyphs".into())))
        .run(source(SALES_CSV.as_bytes(), "sales.csv", None), Cancellation::new())
        .await;

    assert_eq!(outcome.job.status, JobStatus::Done);
    let report = outcome.result.as_ref().expect("report");
    assert!(report.pdf.is_none());
    assert!(report.render_error.as_deref().unwrap().contains("out of glyphs"));
}

#[tokio::test]
async fn stuck_renderer_hits_the_job_deadline() {
    let config = base_config().job_timeout_secs(1).build().unwrap();
    let outcome = pipeline(config, Analyst::default())
        .with_renderer(|_, _, _| {
            std::thread::sleep(Duration::from_secs(3));
            Ok(Vec::new())
        })
        .run(source(SALES_CSV.as_bytes(), "sales.csv", None), Cancellation::new())
        .await;

    assert_eq!(outcome.job.status, JobStatus::Failed);
    let err = outcome.result.as_ref().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PipelineTimeout);
    assert!(err.to_string().contains("rendering"), "{err}");
}

// ── Service boundary ─────────────────────────────────────────────────────────

#[tokio::test]
async fn service_retains_pdf_and_charts() {
    let config = base_config().build().unwrap();
    let service = ReportService::new(pipeline(config, Analyst::default()), 2)
        .with_base_url("https://reports.example.com/");

    let env = service
        .submit(source(SALES_CSV.as_bytes(), "sales.csv", Some("text/csv")), Cancellation::new())
        .await;
    assert!(env.is_success());
    assert_eq!(env.filename.as_deref(), Some("sales.csv"));
    assert_eq!(
        env.pdf_download_url.as_deref(),
        Some(format!("https://reports.example.com/reports/{}.pdf", env.job_id).as_str())
    );
    assert_eq!(env.artifact_refs.len(), 1);

    let (bytes, media_type) = service.artifact(&env.artifact_refs[0]).expect("artifact served");
    assert_eq!(media_type, "image/png");
    assert!(!bytes.is_empty());
    assert_eq!(service.charts(&env.job_id), env.artifact_refs);
    assert!(service.pdf(&env.job_id).unwrap().starts_with(b"%PDF"));
    assert!(service.artifact("no-such-artifact").is_none());

    let json = serde_json::to_value(&env).unwrap();
    assert_eq!(json["status"], "success");
    assert!(json["markdown_content"].as_str().unwrap().contains("## Key Metrics"));
}

#[tokio::test]
async fn service_purges_expired_jobs() {
    let config = base_config().render_pdf(false).build().unwrap();
    let service = ReportService::new(pipeline(config, Analyst::default()), 1).with_retention_secs(0);

    let env = service
        .submit(source(SALES_CSV.as_bytes(), "sales.csv", None), Cancellation::new())
        .await;
    assert!(env.is_success());
    assert!(env.pdf_download_url.is_none(), "no PDF rendered, no URL");

    assert_eq!(service.purge_expired(), 1);
    assert_eq!(service.retained_jobs(), 0);
    assert!(service.pdf(&env.job_id).is_none());
}

#[test]
fn blocking_caller_can_drive_a_job() {
    let config = base_config().render_pdf(false).build().unwrap();
    let outcome = tokio_test::block_on(
        pipeline(config, Analyst::default())
            .run(source(SALES_CSV.as_bytes(), "sales.csv", None), Cancellation::new()),
    );
    tokio_test::assert_ok!(outcome.result);
}
