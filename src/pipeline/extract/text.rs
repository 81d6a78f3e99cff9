//! Plain text and markdown.
//!
//! Form feeds (`\x0c`, as written by `pdftotext` and most print-to-text
//! tools) separate pages; without them the whole file is page 1. Markdown
//! pipe tables are lifted into structured tables.

use super::{ExtractContext, ExtractionStrategy};
use crate::document::{ContentNode, DocumentKind, ExtractedDocument, Provenance, Table};
use crate::error::ReportError;
use async_trait::async_trait;

pub struct TextExtractor;

fn is_pipe_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn pipe_cells(line: &str) -> Vec<String> {
    let t = line.trim();
    t[1..t.len() - 1].split('|').map(|c| c.trim().to_string()).collect()
}

/// Header row, separator, then at least one data row.
fn parse_pipe_table(lines: &[&str]) -> Option<Table> {
    if lines.len() < 3 || !is_separator(lines[1]) {
        return None;
    }
    let headers = pipe_cells(lines[0]);
    let rows: Vec<Vec<String>> = lines[2..]
        .iter()
        .filter(|l| !is_separator(l))
        .map(|l| pipe_cells(l))
        .collect();
    (!rows.is_empty()).then(|| Table::new(headers, rows))
}

fn push_prose(unit: u32, prose: &mut Vec<&str>, nodes: &mut Vec<ContentNode>, seq: &mut u32) {
    let text = prose.join("\n").trim().to_string();
    if !text.is_empty() {
        nodes.push(ContentNode::text(Provenance::unit(unit, *seq), text));
        *seq += 1;
    }
    prose.clear();
}

fn page_nodes(unit: u32, page: &str) -> Vec<ContentNode> {
    let lines: Vec<&str> = page.lines().collect();
    let mut nodes = Vec::new();
    let mut prose: Vec<&str> = Vec::new();
    let mut seq = 0u32;
    let mut i = 0;

    while i < lines.len() {
        if is_pipe_row(lines[i]) {
            let end = lines[i..]
                .iter()
                .position(|l| !is_pipe_row(l))
                .map(|p| i + p)
                .unwrap_or(lines.len());
            if let Some(table) = parse_pipe_table(&lines[i..end]) {
                push_prose(unit, &mut prose, &mut nodes, &mut seq);
                nodes.push(ContentNode::table(Provenance::unit(unit, seq), table));
                seq += 1;
                i = end;
                continue;
            }
        }
        prose.push(lines[i]);
        i += 1;
    }
    push_prose(unit, &mut prose, &mut nodes, &mut seq);
    nodes
}

/// First markdown `#` heading, or the first short non-empty line.
fn find_title(text: &str) -> Option<String> {
    let first = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    if let Some(h) = first.strip_prefix('#') {
        return Some(h.trim_start_matches('#').trim().to_string()).filter(|t| !t.is_empty());
    }
    (first.chars().count() <= 80 && !first.ends_with('.')).then(|| first.to_string())
}

#[async_trait]
impl ExtractionStrategy for TextExtractor {
    fn name(&self) -> &'static str {
        "text"
    }

    fn kind(&self) -> DocumentKind {
        DocumentKind::Text
    }

    async fn extract(&self, bytes: &[u8], _ctx: &ExtractContext) -> Result<ExtractedDocument, ReportError> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let text = String::from_utf8_lossy(bytes).replace("\r\n", "\n");
        let pages: Vec<&str> = text.split('\x0c').collect();

        let mut doc = ExtractedDocument {
            unit_count: pages.len() as u32,
            title: find_title(&text),
            ..Default::default()
        };
        for (idx, page) in pages.iter().enumerate() {
            let unit = idx as u32 + 1;
            let nodes = page_nodes(unit, page);
            if nodes.is_empty() {
                doc.warnings.push(format!("page {unit} is blank"));
            }
            doc.nodes.extend(nodes);
        }
        Ok(doc)
    }
}
