//! Normalised document content: the tree every extractor produces.
//!
//! Extraction strategies differ wildly (pdfium text runs, CSV records, XLSX
//! cells, DOCX paragraphs, OCR output) but all of them end up as an ordered list of
//! [`ContentNode`]s. Downstream stages never look at the source format again;
//! they only see text, structured tables, and artifact ids with provenance.

use crate::artifact::ArtifactId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Supported input families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Pdf,
    Csv,
    Spreadsheet,
    Docx,
    Image,
    Text,
}

impl DocumentKind {
    /// Map a MIME type (parameters ignored) to a kind.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match mime.as_str() {
            "application/pdf" => Some(Self::Pdf),
            "text/csv" | "application/csv" => Some(Self::Csv),
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
                Some(Self::Spreadsheet)
            }
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Some(Self::Docx),
            "text/plain" | "text/markdown" => Some(Self::Text),
            m if m.starts_with("image/") => Some(Self::Image),
            _ => None,
        }
    }

    /// Map a file extension (without the dot) to a kind.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "csv" => Some(Self::Csv),
            "xlsx" | "xlsm" => Some(Self::Spreadsheet),
            "docx" => Some(Self::Docx),
            "png" | "jpg" | "jpeg" | "tif" | "tiff" | "bmp" | "gif" | "webp" => Some(Self::Image),
            "txt" | "md" | "markdown" => Some(Self::Text),
            _ => None,
        }
    }

    /// Guess the kind from leading bytes. CSV and text are indistinguishable
    /// by magic and are left to the declared type. ZIP containers are
    /// resolved by their main OOXML part.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF") {
            return Some(Self::Pdf);
        }
        if bytes.starts_with(b"PK\x03\x04") {
            return Self::sniff_ooxml(bytes);
        }
        if image::guess_format(bytes).is_ok() {
            return Some(Self::Image);
        }
        None
    }

    fn sniff_ooxml(bytes: &[u8]) -> Option<Self> {
        let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).ok()?;
        let has = |part: &str| archive.file_names().any(|n| n == part);
        if has("word/document.xml") {
            Some(Self::Docx)
        } else if has("xl/workbook.xml") {
            Some(Self::Spreadsheet)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Csv => "csv",
            Self::Spreadsheet => "spreadsheet",
            Self::Docx => "docx",
            Self::Image => "image",
            Self::Text => "text",
        }
    }

    /// Name of one provenance unit for this kind ("page", "sheet", …).
    pub fn unit_name(self) -> &'static str {
        match self {
            Self::Pdf | Self::Image | Self::Text => "page",
            Self::Csv | Self::Spreadsheet => "sheet",
            Self::Docx => "document",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive 1-indexed data-row range inside a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowRange {
    pub start: usize,
    pub end: usize,
}

/// Where a fragment of content came from.
///
/// `unit` is the 1-indexed page (PDF, image, text) or sheet (CSV,
/// spreadsheet). Ordering is document order: unit, then row range, then the
/// node's sequence number inside the unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub unit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<RowRange>,
    pub seq: u32,
}

impl Provenance {
    pub fn unit(unit: u32, seq: u32) -> Self {
        Self {
            unit,
            label: None,
            rows: None,
            seq,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_rows(mut self, start: usize, end: usize) -> Self {
        self.rows = Some(RowRange { start, end });
        self
    }

    fn sort_key(&self) -> (u32, usize, u32) {
        (self.unit, self.rows.map(|r| r.start).unwrap_or(0), self.seq)
    }

    /// Short human-readable tag used in prompts and citations.
    pub fn tag(&self, kind: DocumentKind) -> String {
        let mut tag = match &self.label {
            Some(label) => format!("{} {} ({})", kind.unit_name(), self.unit, label),
            None => format!("{} {}", kind.unit_name(), self.unit),
        };
        if let Some(rows) = self.rows {
            tag.push_str(&format!(", rows {}-{}", rows.start, rows.end));
        }
        tag
    }
}

impl PartialOrd for Provenance {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Provenance {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// A rectangular table with a header row. Cells are kept as text; numeric
/// interpretation happens on demand so nothing is lost at extraction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Build a table, padding or truncating rows to the header width.
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = headers.len();
        let rows = rows
            .into_iter()
            .map(|mut r| {
                r.resize(width, String::new());
                r
            })
            .collect();
        Self { headers, rows }
    }

    pub fn width(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, idx: usize) -> impl Iterator<Item = &str> + '_ {
        self.rows
            .iter()
            .map(move |r| r.get(idx).map(String::as_str).unwrap_or(""))
    }

    /// Numeric values of a column, `None` where a cell does not parse.
    pub fn numeric_column(&self, idx: usize) -> Vec<Option<f64>> {
        self.column(idx).map(parse_number).collect()
    }

    /// A column is numeric when more than half of its non-empty cells parse.
    pub fn is_numeric_column(&self, idx: usize) -> bool {
        let mut filled = 0usize;
        let mut numeric = 0usize;
        for cell in self.column(idx) {
            if cell.trim().is_empty() {
                continue;
            }
            filled += 1;
            if parse_number(cell).is_some() {
                numeric += 1;
            }
        }
        filled > 0 && numeric * 2 > filled
    }

    pub fn numeric_columns(&self) -> Vec<usize> {
        (0..self.width()).filter(|&i| self.is_numeric_column(i)).collect()
    }

    /// Rows `[start, end)` as a new table with the same header.
    pub fn slice_rows(&self, start: usize, end: usize) -> Table {
        let end = end.min(self.rows.len());
        let start = start.min(end);
        Table {
            headers: self.headers.clone(),
            rows: self.rows[start..end].to_vec(),
        }
    }

    /// GitHub-flavoured markdown pipe table.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&markdown_row(&self.headers));
        out.push('\n');
        out.push('|');
        for _ in &self.headers {
            out.push_str(" --- |");
        }
        for row in &self.rows {
            out.push('\n');
            out.push_str(&markdown_row(row));
        }
        out
    }
}

fn markdown_row(cells: &[String]) -> String {
    let mut line = String::from("|");
    for cell in cells {
        line.push(' ');
        line.push_str(&cell.replace('|', "\\|").replace('\n', " "));
        line.push_str(" |");
    }
    line
}

/// Parse a business-formatted number: `$1,234.50`, `12%`, `(300)`, `-4.2e3`.
pub fn parse_number(raw: &str) -> Option<f64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let (negative, s) = match s.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        Some(inner) => (true, inner.trim()),
        None => (false, s),
    };
    let cleaned: String = s
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '€' | '£' | '¥' | '%' | ' ' | '\u{a0}'))
        .collect();
    if cleaned.is_empty() || !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let value: f64 = cleaned.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

/// Payload of a content node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodePayload {
    Text { text: String },
    Table { table: Table },
    Image {
        artifact_id: ArtifactId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

/// One normalised unit of extracted content. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentNode {
    pub id: String,
    pub payload: NodePayload,
    pub provenance: Provenance,
}

impl ContentNode {
    pub fn text(provenance: Provenance, text: impl Into<String>) -> Self {
        Self::new(provenance, NodePayload::Text { text: text.into() })
    }

    pub fn table(provenance: Provenance, table: Table) -> Self {
        Self::new(provenance, NodePayload::Table { table })
    }

    pub fn image(provenance: Provenance, artifact_id: ArtifactId, caption: Option<String>) -> Self {
        Self::new(
            provenance,
            NodePayload::Image {
                artifact_id,
                caption,
            },
        )
    }

    fn new(provenance: Provenance, payload: NodePayload) -> Self {
        let id = format!("n{}-{}", provenance.unit, provenance.seq);
        Self {
            id,
            payload,
            provenance,
        }
    }

    /// Text and table nodes can ground the model; image nodes alone cannot.
    pub fn is_groundable(&self) -> bool {
        match &self.payload {
            NodePayload::Text { text } => !text.trim().is_empty(),
            NodePayload::Table { table } => !table.is_empty(),
            NodePayload::Image { caption, .. } => {
                caption.as_deref().map(|c| !c.trim().is_empty()).unwrap_or(false)
            }
        }
    }
}

/// Everything an extractor produced for one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub nodes: Vec<ContentNode>,
    /// Number of pages/sheets in the source, readable or not.
    pub unit_count: u32,
    /// Non-fatal problems (skipped pages, unreadable sheets, OCR gaps).
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ExtractedDocument {
    /// Sort nodes into document order. Extractors may produce pages out of
    /// order when they run in parallel.
    pub fn sort_by_provenance(&mut self) {
        self.nodes.sort_by(|a, b| a.provenance.cmp(&b.provenance));
    }

    /// Distinct provenance units covered by at least one node.
    pub fn covered_units(&self) -> BTreeSet<u32> {
        self.nodes.iter().map(|n| n.provenance.unit).collect()
    }

    pub fn groundable_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_groundable()).count()
    }

    pub fn tables(&self) -> impl Iterator<Item = (&Table, &Provenance)> {
        self.nodes.iter().filter_map(|n| match &n.payload {
            NodePayload::Table { table } => Some((table, &n.provenance)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_number_handles_business_formats() {
        assert_eq!(parse_number("1,234.5"), Some(1234.5));
        assert_eq!(parse_number("$12"), Some(12.0));
        assert_eq!(parse_number("(300)"), Some(-300.0));
        assert_eq!(parse_number("45%"), Some(45.0));
        assert_eq!(parse_number("-4.2e3"), Some(-4200.0));
        assert_eq!(parse_number("Jan"), None);
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("$"), None);
    }

    #[test]
    fn numeric_column_uses_majority_rule() {
        let t = Table::new(
            vec!["region".into(), "sales".into()],
            vec![
                vec!["North".into(), "10".into()],
                vec!["South".into(), "n/a".into()],
                vec!["East".into(), "30".into()],
            ],
        );
        assert!(!t.is_numeric_column(0));
        assert!(t.is_numeric_column(1));
        assert_eq!(t.numeric_columns(), vec![1]);
    }

    #[test]
    fn table_markdown_keeps_header_and_escapes_pipes() {
        let t = Table::new(
            vec!["a".into(), "b".into()],
            vec![vec!["x|y".into(), "2".into()]],
        );
        let md = t.to_markdown();
        assert!(md.starts_with("| a | b |\n| --- | --- |"));
        assert!(md.contains("x\\|y"));
    }

    #[test]
    fn short_rows_are_padded() {
        let t = Table::new(vec!["a".into(), "b".into()], vec![vec!["1".into()]]);
        assert_eq!(t.rows[0].len(), 2);
    }

    #[test]
    fn provenance_orders_by_unit_then_rows() {
        let a = Provenance::unit(1, 3);
        let b = Provenance::unit(2, 0);
        let c = Provenance::unit(1, 0).with_rows(5, 9);
        let mut v = vec![b.clone(), c.clone(), a.clone()];
        v.sort();
        assert_eq!(v, vec![a, c, b]);
    }

    #[test]
    fn kind_detection() {
        assert_eq!(DocumentKind::from_mime("application/pdf"), Some(DocumentKind::Pdf));
        assert_eq!(DocumentKind::from_mime("text/csv; charset=utf-8"), Some(DocumentKind::Csv));
        assert_eq!(DocumentKind::from_mime("image/png"), Some(DocumentKind::Image));
        assert_eq!(DocumentKind::from_extension("XLSX"), Some(DocumentKind::Spreadsheet));
        assert_eq!(DocumentKind::sniff(b"%PDF-1.7"), Some(DocumentKind::Pdf));
        assert_eq!(DocumentKind::sniff(b"month,revenue"), None);
        assert_eq!(DocumentKind::from_extension("docx"), Some(DocumentKind::Docx));
        assert_eq!(
            DocumentKind::from_mime("application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
            Some(DocumentKind::Docx)
        );
    }

    fn zip_with(parts: &[&str]) -> Vec<u8> {
        use std::io::Write;
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for part in parts {
            zip.start_file(*part, zip::write::SimpleFileOptions::default()).unwrap();
            zip.write_all(b"<x/>").unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn zip_containers_sniffed_by_main_part() {
        let docx = zip_with(&["[Content_Types].xml", "word/document.xml"]);
        let xlsx = zip_with(&["[Content_Types].xml", "xl/workbook.xml"]);
        let other = zip_with(&["notes.txt"]);
        assert_eq!(DocumentKind::sniff(&docx), Some(DocumentKind::Docx));
        assert_eq!(DocumentKind::sniff(&xlsx), Some(DocumentKind::Spreadsheet));
        assert_eq!(DocumentKind::sniff(&other), None);
        assert_eq!(DocumentKind::sniff(b"PK\x03\x04truncated"), None);
    }
}
