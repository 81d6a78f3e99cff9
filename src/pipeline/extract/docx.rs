//! Word documents (DOCX).
//!
//! Only `word/document.xml` and the pictures under `word/media/` are read.
//! Body paragraphs are grouped into text nodes that break at headings and
//! tables. A top-level table goes through [`sanitize_grid`] when it looks
//! like data: at least 2×2, no more than 90% blank cells, and some digit
//! somewhere. Everything else is layout and is dropped. The whole body is
//! provenance unit 1; tables are labelled by their position in the body.

use super::tabular::{attr, sanitize_grid, MAX_XML_ENTRY_BYTES};
use super::{ExtractContext, ExtractionStrategy};
use crate::artifact::{ArtifactKind, ArtifactStore};
use crate::document::{ContentNode, DocumentKind, ExtractedDocument, Provenance};
use crate::error::ReportError;
use crate::pipeline::encode::png_bytes;
use async_trait::async_trait;
use quick_xml::events::Event;
use std::io::{Cursor, Read};
use std::sync::Arc;
use tracing::{debug, warn};

const MIN_TABLE_ROWS: usize = 2;
const MIN_TABLE_COLS: usize = 2;
const MAX_EMPTY_CELL_RATIO: f64 = 0.9;
const MAX_MEDIA_PARTS: usize = 64;

pub struct DocxExtractor;

#[async_trait]
impl ExtractionStrategy for DocxExtractor {
    fn name(&self) -> &'static str {
        "docx"
    }

    fn kind(&self) -> DocumentKind {
        DocumentKind::Docx
    }

    async fn extract(&self, bytes: &[u8], ctx: &ExtractContext) -> Result<ExtractedDocument, ReportError> {
        let owned = bytes.to_vec();
        let store = Arc::clone(&ctx.store);
        let min_px = ctx.options.min_image_px;
        tokio::task::spawn_blocking(move || extract_docx(&owned, &store, min_px))
            .await
            .map_err(|e| ReportError::Internal(format!("DOCX task panicked: {e}")))?
    }
}

fn docx_err(detail: impl std::fmt::Display) -> ReportError {
    ReportError::ExtractionFailure {
        kind: DocumentKind::Docx.as_str().into(),
        detail: detail.to_string(),
    }
}

fn read_part(archive: &mut zip::ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<Vec<u8>, ReportError> {
    let entry = archive.by_name(name).map_err(|e| docx_err(format!("{name}: {e}")))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| docx_err(format!("{name}: {e}")))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(docx_err(format!("{name} exceeds size limit ({MAX_XML_ENTRY_BYTES} bytes)")));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8], store: &ArtifactStore, min_px: u32) -> Result<ExtractedDocument, ReportError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(docx_err)?;
    let xml = read_part(&mut archive, "word/document.xml")?;
    let body = parse_body(&xml)?;

    let mut doc = ExtractedDocument {
        unit_count: 1,
        title: body.title,
        ..Default::default()
    };
    let mut seq = 0u32;
    for block in body.blocks {
        match block {
            BodyBlock::Text { label, text } => {
                let mut prov = Provenance::unit(1, seq);
                if let Some(label) = label {
                    prov = prov.with_label(label);
                }
                doc.nodes.push(ContentNode::text(prov, text));
                seq += 1;
            }
            BodyBlock::Table { index, grid } => {
                if !is_data_table(&grid) {
                    debug!("table {index}: layout table dropped");
                    continue;
                }
                if let Some(table) = sanitize_grid(grid) {
                    debug!("table {index}: {} rows x {} cols", table.rows.len(), table.width());
                    let prov = Provenance::unit(1, seq).with_label(format!("Table {index}"));
                    doc.nodes.push(ContentNode::table(prov, table));
                    seq += 1;
                }
            }
        }
    }

    let mut media: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("word/media/"))
        .map(str::to_string)
        .collect();
    media.sort();
    for name in media.into_iter().take(MAX_MEDIA_PARTS) {
        let data = match read_part(&mut archive, &name) {
            Ok(data) => data,
            Err(e) => {
                warn!("skipping {name}: {e}");
                doc.warnings.push(format!("{name} unreadable: {e}"));
                continue;
            }
        };
        // EMF/WMF and other vector formats are not decodable here.
        let img = match image::load_from_memory(&data) {
            Ok(img) => img,
            Err(e) => {
                debug!("skipping {name}: {e}");
                continue;
            }
        };
        if img.width() < min_px || img.height() < min_px {
            debug!("skipping {name}: {}x{} below {min_px}px", img.width(), img.height());
            continue;
        }
        match png_bytes(&img) {
            Ok(png) => {
                let id = store.register(ArtifactKind::ExtractedImage, "image/png", png);
                doc.nodes.push(ContentNode::image(Provenance::unit(1, seq), id, None));
                seq += 1;
            }
            Err(e) => doc.warnings.push(format!("{name} could not be re-encoded: {e}")),
        }
    }
    Ok(doc)
}

/// Data tables only: big enough, mostly filled, with at least one digit.
fn is_data_table(grid: &[Vec<String>]) -> bool {
    if grid.len() < MIN_TABLE_ROWS || grid.first().map_or(0, Vec::len) < MIN_TABLE_COLS {
        return false;
    }
    let cells: Vec<&String> = grid.iter().flatten().collect();
    let empty = cells.iter().filter(|c| c.trim().is_empty()).count();
    if cells.is_empty() || empty as f64 / cells.len() as f64 > MAX_EMPTY_CELL_RATIO {
        return false;
    }
    cells.iter().any(|c| c.chars().any(|ch| ch.is_ascii_digit()))
}

enum BodyBlock {
    Text { label: Option<String>, text: String },
    Table { index: usize, grid: Vec<Vec<String>> },
}

#[derive(Default)]
struct Body {
    title: Option<String>,
    blocks: Vec<BodyBlock>,
}

impl Body {
    fn flush(&mut self, heading: Option<&str>, section: &mut Vec<String>) {
        if section.is_empty() {
            return;
        }
        self.blocks.push(BodyBlock::Text {
            label: heading.map(str::to_string),
            text: section.join("\n\n"),
        });
        section.clear();
    }
}

fn is_heading(style: &str) -> bool {
    let s = style.to_ascii_lowercase();
    s.starts_with("heading") || s == "title"
}

fn parse_body(xml: &[u8]) -> Result<Body, ReportError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut body = Body::default();

    let mut heading: Option<String> = None;
    let mut section: Vec<String> = Vec::new();
    let mut para = String::new();
    let mut style: Option<String> = None;
    let mut in_text = false;

    // Cells of nested tables fold into the enclosing top-level cell.
    let mut depth = 0usize;
    let mut tables = 0usize;
    let mut grid: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell = String::new();
    let mut span = 1usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => {
                    para.clear();
                    style = None;
                }
                b"t" => in_text = true,
                b"tbl" => {
                    depth += 1;
                    if depth == 1 {
                        body.flush(heading.as_deref(), &mut section);
                        grid.clear();
                    }
                }
                b"tr" if depth == 1 => row.clear(),
                b"tc" if depth == 1 => {
                    cell.clear();
                    span = 1;
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"pStyle" => style = attr(&e, b"val"),
                b"gridSpan" if depth == 1 => {
                    span = attr(&e, b"val")
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(1)
                        .max(1);
                }
                b"tab" => para.push('\t'),
                b"br" | b"cr" => para.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                para.push_str(&te.unescape().unwrap_or_default());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let text = para.trim().to_string();
                    para.clear();
                    if text.is_empty() {
                        // empty paragraphs are spacing only
                    } else if depth > 0 {
                        if !cell.is_empty() {
                            cell.push(' ');
                        }
                        cell.push_str(&text);
                    } else {
                        if let Some(s) = style.as_deref().filter(|s| is_heading(s)) {
                            body.flush(heading.as_deref(), &mut section);
                            if s.eq_ignore_ascii_case("title") && body.title.is_none() {
                                body.title = Some(text.clone());
                            }
                            heading = Some(text.clone());
                        }
                        section.push(text);
                    }
                }
                b"tc" if depth == 1 => {
                    row.push(std::mem::take(&mut cell));
                    row.extend(std::iter::repeat(String::new()).take(span - 1));
                }
                b"tr" if depth == 1 => grid.push(std::mem::take(&mut row)),
                b"tbl" => {
                    if depth == 1 {
                        tables += 1;
                        body.blocks.push(BodyBlock::Table {
                            index: tables,
                            grid: std::mem::take(&mut grid),
                        });
                    }
                    depth = depth.saturating_sub(1);
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(docx_err(format!("word/document.xml: {e}"))),
            _ => {}
        }
        buf.clear();
    }
    body.flush(heading.as_deref(), &mut section);
    Ok(body)
}
