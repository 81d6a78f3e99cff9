//! PDF extraction via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which is CPU-bound and not
//! async-aware. All pdfium work happens in one `spawn_blocking` pass that
//! returns plain data (page text, PNG bytes); artifact registration and OCR
//! calls happen afterwards on the async side.
//!
//! ## Page handling
//!
//! For every page: the text layer is split into prose and column-aligned
//! tables, embedded raster images at least `min_image_px` on both sides are
//! registered as artifacts, and pages whose text layer is empty or mostly
//! symbols are rasterised for the OCR fallback. OCR calls run with
//! `ocr_concurrency` in flight.

use super::{sanitize_grid, ExtractContext, ExtractionStrategy};
use crate::artifact::ArtifactKind;
use crate::document::{ContentNode, DocumentKind, ExtractedDocument, Provenance, Table};
use crate::error::{ReportError, SectionError};
use crate::pipeline::encode::png_bytes;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use pdfium_render::prelude::*;
use regex::Regex;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Minimum consecutive aligned lines that count as a table.
const MIN_TABLE_LINES: usize = 3;

pub struct PdfExtractor;

/// Everything pdfium gave us for one page.
#[derive(Debug, Default)]
struct PageScan {
    unit: u32,
    text: String,
    images: Vec<Vec<u8>>,
    /// Rendered page, present when the text layer is unusable.
    ocr_png: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct PdfScan {
    page_count: u32,
    title: Option<String>,
    pages: Vec<PageScan>,
    warnings: Vec<String>,
}

/// Whether a page's text layer is too poor to use.
///
/// Empty text, or more than 50 characters of which under 10% are
/// alphanumeric (glyph soup from broken font encodings).
pub fn should_use_ocr(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    let total = trimmed.chars().count();
    let alnum = trimmed.chars().filter(|c| c.is_alphanumeric()).count();
    total > 50 && (alnum as f64 / total as f64) < 0.1
}

fn pdf_err(detail: impl Into<String>) -> ReportError {
    ReportError::ExtractionFailure {
        kind: DocumentKind::Pdf.as_str().into(),
        detail: detail.into(),
    }
}

/// Bind pdfium: `PDFIUM_LIB_PATH`, then the working directory, then the
/// system library path.
fn bind_pdfium() -> Result<Pdfium, ReportError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) => Pdfium::bind_to_library(PathBuf::from(path)),
        Err(_) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| {
        pdf_err(format!(
            "PDFium library unavailable ({e:?}); install libpdfium or set PDFIUM_LIB_PATH"
        ))
    })?;
    Ok(Pdfium::new(bindings))
}

fn scan_pdf(bytes: &[u8], password: Option<&str>, min_image_px: u32, max_px: u32, ocr: bool) -> Result<PdfScan, ReportError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium.load_pdf_from_byte_slice(bytes, password).map_err(|e| {
        let detail = format!("{e:?}");
        if detail.to_ascii_lowercase().contains("password") {
            if password.is_some() {
                pdf_err("the supplied password was rejected")
            } else {
                pdf_err("the document is encrypted; supply a password")
            }
        } else {
            pdf_err(format!("pdfium could not open the document: {detail}"))
        }
    })?;

    let title = document
        .metadata()
        .get(PdfDocumentMetadataTagType::Title)
        .map(|t| t.value().trim().to_string())
        .filter(|t| !t.is_empty());

    let pages = document.pages();
    let page_count = pages.len() as u32;
    info!("PDF loaded: {} pages", page_count);

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_px as i32)
        .set_maximum_height(max_px as i32);

    let mut scan = PdfScan {
        page_count,
        title,
        ..Default::default()
    };

    for idx in 0..page_count {
        let unit = idx + 1;
        let page = match pages.get(idx as u16) {
            Ok(p) => p,
            Err(e) => {
                scan.warnings.push(format!("page {unit} unreadable: {e:?}"));
                continue;
            }
        };

        let text = match page.text() {
            Ok(t) => t.all(),
            Err(e) => {
                scan.warnings.push(format!("page {unit} text layer unreadable: {e:?}"));
                String::new()
            }
        };

        let mut images = Vec::new();
        for object in page.objects().iter() {
            let Some(image_object) = object.as_image_object() else {
                continue;
            };
            match image_object.get_raw_image() {
                Ok(img) if img.width() >= min_image_px && img.height() >= min_image_px => {
                    match png_bytes(&img) {
                        Ok(png) => images.push(png),
                        Err(e) => debug!("page {unit}: image not encodable: {e}"),
                    }
                }
                Ok(img) => debug!("page {unit}: skipping {}x{} image", img.width(), img.height()),
                Err(e) => debug!("page {unit}: image not decodable: {e:?}"),
            }
        }

        let mut ocr_png = None;
        if should_use_ocr(&text) {
            if ocr {
                match page.render_with_config(&render_config) {
                    Ok(bitmap) => match png_bytes(&bitmap.as_image()) {
                        Ok(png) => ocr_png = Some(png),
                        Err(e) => scan.warnings.push(format!("page {unit} could not be encoded for OCR: {e}")),
                    },
                    Err(e) => scan.warnings.push(format!("page {unit} could not be rasterised: {e:?}")),
                }
            } else {
                scan.warnings.push(format!("page {unit} has no usable text layer and OCR is disabled"));
            }
        }

        debug!("page {unit}: {} chars, {} image(s), ocr={}", text.len(), images.len(), ocr_png.is_some());
        scan.pages.push(PageScan {
            unit,
            text: if should_use_ocr(&text) { String::new() } else { text },
            images,
            ocr_png,
        });
    }
    Ok(scan)
}

/// Prose or a detected table inside a page's text.
#[derive(Debug, PartialEq)]
pub(crate) enum Block {
    Text(String),
    Table(Table),
}

static RE_COLUMN_GAP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\t+| {2,}").unwrap());

fn aligned_cells(line: &str) -> Option<Vec<String>> {
    let cells: Vec<String> = RE_COLUMN_GAP
        .split(line.trim())
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    (cells.len() >= 2).then_some(cells)
}

fn flush(prose: &mut Vec<&str>, blocks: &mut Vec<Block>) {
    let joined = prose.join("\n");
    let joined = joined.trim();
    if !joined.is_empty() {
        blocks.push(Block::Text(joined.to_string()));
    }
    prose.clear();
}

/// Split page text into prose paragraphs and tables.
///
/// A table is a run of at least three consecutive lines that split into the
/// same number (≥ 2) of cells on tab or multi-space gaps.
pub(crate) fn split_blocks(text: &str) -> Vec<Block> {
    let lines: Vec<&str> = text.lines().collect();
    let mut blocks = Vec::new();
    let mut prose: Vec<&str> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if let Some(first) = aligned_cells(lines[i]) {
            let width = first.len();
            let mut grid = vec![first];
            let mut j = i + 1;
            while j < lines.len() {
                match aligned_cells(lines[j]) {
                    Some(cells) if cells.len() == width => grid.push(cells),
                    _ => break,
                }
                j += 1;
            }
            if grid.len() >= MIN_TABLE_LINES {
                if let Some(table) = sanitize_grid(grid) {
                    flush(&mut prose, &mut blocks);
                    blocks.push(Block::Table(table));
                    i = j;
                    continue;
                }
            }
        }
        prose.push(lines[i]);
        i += 1;
    }
    flush(&mut prose, &mut blocks);
    blocks
}

#[async_trait]
impl ExtractionStrategy for PdfExtractor {
    fn name(&self) -> &'static str {
        "pdfium"
    }

    fn kind(&self) -> DocumentKind {
        DocumentKind::Pdf
    }

    async fn extract(&self, bytes: &[u8], ctx: &ExtractContext) -> Result<ExtractedDocument, ReportError> {
        let owned = bytes.to_vec();
        let password = ctx.options.password.clone();
        let min_px = ctx.options.min_image_px;
        let max_px = ctx.options.max_rendered_pixels;
        let ocr_enabled = ctx.ocr.is_some();

        let scan = tokio::task::spawn_blocking(move || {
            scan_pdf(&owned, password.as_deref(), min_px, max_px, ocr_enabled)
        })
        .await
        .map_err(|e| ReportError::Internal(format!("PDF task panicked: {e}")))??;

        let mut doc = ExtractedDocument {
            unit_count: scan.page_count,
            warnings: scan.warnings,
            title: scan.title,
            ..Default::default()
        };

        let mut pending_ocr = Vec::new();
        for page in scan.pages {
            let mut seq = 0u32;
            for block in split_blocks(&page.text) {
                let prov = Provenance::unit(page.unit, seq);
                doc.nodes.push(match block {
                    Block::Text(t) => ContentNode::text(prov, t),
                    Block::Table(t) => ContentNode::table(prov, t),
                });
                seq += 1;
            }
            for png in page.images {
                let id = ctx.store.register(ArtifactKind::ExtractedImage, "image/png", png);
                doc.nodes.push(ContentNode::image(Provenance::unit(page.unit, seq), id, None));
                seq += 1;
            }
            if let Some(png) = page.ocr_png {
                pending_ocr.push((page.unit, seq, png));
            }
        }

        if let Some(ocr) = ctx.ocr.as_ref() {
            if !pending_ocr.is_empty() {
                info!("OCR fallback for {} page(s)", pending_ocr.len());
            }
            let results: Vec<(u32, u32, Result<String, SectionError>)> = stream::iter(pending_ocr)
                .map(|(unit, seq, png)| async move {
                    (unit, seq, ocr.recognize(&png, &ctx.cancel).await)
                })
                .buffer_unordered(ctx.options.ocr_concurrency)
                .collect()
                .await;

            for (unit, seq, result) in results {
                match result {
                    Ok(text) if !text.trim().is_empty() => {
                        doc.nodes.push(ContentNode::text(Provenance::unit(unit, seq), text));
                    }
                    Ok(_) => doc.warnings.push(format!("page {unit}: OCR found no text")),
                    Err(SectionError::Cancelled) => {
                        return Err(ReportError::Cancelled {
                            stage: "extracting".into(),
                        })
                    }
                    Err(e) => {
                        warn!("page {unit}: OCR failed: {e}");
                        doc.warnings.push(format!("page {unit}: OCR failed: {e}"));
                    }
                }
            }
        }
        Ok(doc)
    }
}
