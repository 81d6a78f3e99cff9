//! CSV and XLSX extraction.
//!
//! Both formats end up as a raw grid of strings which [`sanitize_grid`]
//! turns into a [`Table`]: blank rows and columns dropped, the header row
//! located heuristically (exports often carry a title block above the real
//! header), and header names made unique.
//!
//! XLSX is read directly from the OOXML zip: `xl/workbook.xml` for sheet
//! names and order, `xl/_rels/workbook.xml.rels` for sheet part paths,
//! `xl/sharedStrings.xml` for the string table, then one worksheet part per
//! sheet. Each sheet is one provenance unit.

use super::{ExtractContext, ExtractionStrategy};
use crate::document::{parse_number, ContentNode, DocumentKind, ExtractedDocument, Provenance, Table};
use crate::error::ReportError;
use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use tracing::{debug, warn};

/// Rows scanned when looking for the header.
const HEADER_SCAN_ROWS: usize = 20;
pub(super) const MAX_XML_ENTRY_BYTES: u64 = 64 * 1024 * 1024;
const XLSX_MAX_SHEETS: usize = 64;
const XLSX_MAX_CELLS_PER_SHEET: usize = 1_000_000;

// ── Grid sanitising ──────────────────────────────────────────────────────

/// Turn a raw grid into a table, or `None` when nothing is left.
///
/// The header is the row, among the first 20, with the most non-empty
/// non-numeric cells (at least two; earliest wins ties). Rows above it are
/// discarded. Without such a row every row is data and columns are named
/// `column_1`, `column_2`, ….
pub fn sanitize_grid(grid: Vec<Vec<String>>) -> Option<Table> {
    let rows: Vec<Vec<String>> = grid
        .into_iter()
        .map(|r| r.into_iter().map(|c| c.trim().to_string()).collect::<Vec<_>>())
        .filter(|r| r.iter().any(|c| !c.is_empty()))
        .collect();
    if rows.is_empty() {
        return None;
    }
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);

    let textual = |r: &Vec<String>| {
        r.iter()
            .filter(|c| !c.is_empty() && parse_number(c).is_none())
            .count()
    };
    let mut header_idx = None;
    let mut best = 1;
    for (i, r) in rows.iter().take(HEADER_SCAN_ROWS).enumerate() {
        let n = textual(r);
        if n > best {
            best = n;
            header_idx = Some(i);
        }
    }

    let (raw_headers, data): (Vec<String>, Vec<Vec<String>>) = match header_idx {
        Some(h) => (rows[h].clone(), rows[h + 1..].to_vec()),
        None => (Vec::new(), rows),
    };

    let keep: Vec<usize> = (0..width)
        .filter(|&i| {
            raw_headers.get(i).map(|c| !c.is_empty()).unwrap_or(false)
                || data.iter().any(|r| r.get(i).map(|c| !c.is_empty()).unwrap_or(false))
        })
        .collect();
    if keep.is_empty() {
        return None;
    }

    let headers = unique_headers(
        keep.iter()
            .enumerate()
            .map(|(pos, &i)| match raw_headers.get(i).filter(|c| !c.is_empty()) {
                Some(h) => h.clone(),
                None => format!("column_{}", pos + 1),
            })
            .collect(),
    );
    let data: Vec<Vec<String>> = data
        .into_iter()
        .map(|r| keep.iter().map(|&i| r.get(i).cloned().unwrap_or_default()).collect::<Vec<_>>())
        .filter(|r: &Vec<String>| r.iter().any(|c| !c.is_empty()))
        .collect();
    if data.is_empty() {
        return None;
    }
    Some(Table::new(headers, data))
}

fn unique_headers(names: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    names
        .into_iter()
        .map(|name| {
            let key = name.to_lowercase();
            let n = seen.entry(key).or_insert(0);
            *n += 1;
            if *n == 1 {
                name
            } else {
                format!("{name}_{n}")
            }
        })
        .collect()
}

// ── CSV ──────────────────────────────────────────────────────────────────

/// Comma, semicolon or tab separated text.
pub struct CsvExtractor;

fn read_csv(bytes: &[u8], delimiter: u8) -> Result<Vec<Vec<String>>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(bytes);
    let mut grid = Vec::new();
    for record in reader.byte_records() {
        let record = record?;
        grid.push(
            record
                .iter()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .collect(),
        );
    }
    Ok(grid)
}

/// Most records with more than one field wins; comma on a tie.
fn detect_delimiter(bytes: &[u8]) -> u8 {
    let sample = &bytes[..bytes.len().min(8 * 1024)];
    let mut best = (b',', 0usize);
    for d in [b',', b';', b'\t'] {
        let multi = read_csv(sample, d)
            .map(|g| g.iter().filter(|r| r.len() > 1).count())
            .unwrap_or(0);
        if multi > best.1 {
            best = (d, multi);
        }
    }
    best.0
}

#[async_trait]
impl ExtractionStrategy for CsvExtractor {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn kind(&self) -> DocumentKind {
        DocumentKind::Csv
    }

    async fn extract(&self, bytes: &[u8], _ctx: &ExtractContext) -> Result<ExtractedDocument, ReportError> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let delimiter = detect_delimiter(bytes);
        let grid = read_csv(bytes, delimiter).map_err(|e| ReportError::ExtractionFailure {
            kind: "csv".into(),
            detail: e.to_string(),
        })?;
        debug!("CSV: {} raw rows, delimiter {:?}", grid.len(), delimiter as char);

        let mut doc = ExtractedDocument {
            unit_count: 1,
            ..Default::default()
        };
        if let Some(table) = sanitize_grid(grid) {
            doc.nodes.push(ContentNode::table(Provenance::unit(1, 0), table));
        }
        Ok(doc)
    }
}

// ── XLSX ─────────────────────────────────────────────────────────────────

/// Office Open XML workbooks.
pub struct SpreadsheetExtractor;

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

#[async_trait]
impl ExtractionStrategy for SpreadsheetExtractor {
    fn name(&self) -> &'static str {
        "xlsx"
    }

    fn kind(&self) -> DocumentKind {
        DocumentKind::Spreadsheet
    }

    async fn extract(&self, bytes: &[u8], _ctx: &ExtractContext) -> Result<ExtractedDocument, ReportError> {
        let owned = bytes.to_vec();
        tokio::task::spawn_blocking(move || extract_xlsx(&owned))
            .await
            .map_err(|e| ReportError::Internal(format!("Spreadsheet task panicked: {e}")))?
    }
}

fn ooxml_err(detail: impl std::fmt::Display) -> ReportError {
    ReportError::ExtractionFailure {
        kind: "spreadsheet".into(),
        detail: detail.to_string(),
    }
}

fn extract_xlsx(bytes: &[u8]) -> Result<ExtractedDocument, ReportError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(ooxml_err)?;
    if archive.by_name("xl/workbook.xml").is_err() {
        return Err(ReportError::UnsupportedFormat {
            detail: "zip archive is not an XLSX workbook (no xl/workbook.xml)".into(),
        });
    }
    let shared = read_shared_strings(&mut archive)?;
    let sheets = list_sheets(&mut archive)?;

    let mut doc = ExtractedDocument {
        unit_count: sheets.len().min(XLSX_MAX_SHEETS) as u32,
        ..Default::default()
    };
    for (idx, (name, part)) in sheets.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
        let unit = idx as u32 + 1;
        let grid = read_zip_entry_bounded(&mut archive, &part, MAX_XML_ENTRY_BYTES)
            .and_then(|xml| read_sheet_grid(&xml, &shared));
        match grid {
            Ok(grid) => match sanitize_grid(grid) {
                Some(table) => {
                    debug!("sheet {unit} '{name}': {} rows x {} cols", table.rows.len(), table.width());
                    doc.nodes
                        .push(ContentNode::table(Provenance::unit(unit, 0).with_label(name), table));
                }
                None => doc.warnings.push(format!("sheet {unit} '{name}' is empty")),
            },
            Err(e) => {
                warn!("skipping sheet {unit} '{name}': {e}");
                doc.warnings.push(format!("sheet {unit} '{name}' unreadable: {e}"));
            }
        }
    }
    Ok(doc)
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str, max_bytes: u64) -> Result<Vec<u8>, ReportError> {
    let entry = archive.by_name(name).map_err(|e| ooxml_err(format!("{name}: {e}")))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ooxml_err(format!("{name}: {e}")))?;
    if out.len() as u64 >= max_bytes {
        return Err(ooxml_err(format!("ZIP entry {name} exceeds size limit ({max_bytes} bytes)")));
    }
    Ok(out)
}

pub(super) fn attr(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.local_name().as_ref() == local {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ReportError> {
    if archive.by_name("xl/sharedStrings.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current.clear(),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                current.push_str(&te.unescape().unwrap_or_default());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(format!("sharedStrings.xml: {e}"))),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// `(sheet name, zip part path)` in workbook order.
fn list_sheets(archive: &mut Archive<'_>) -> Result<Vec<(String, String)>, ReportError> {
    let mut rels: HashMap<String, String> = HashMap::new();
    if let Ok(xml) = read_zip_entry_bounded(archive, "xl/_rels/workbook.xml.rels", MAX_XML_ENTRY_BYTES) {
        let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"Relationship" => {
                    if let (Some(id), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Target")) {
                        let path = match target.strip_prefix('/') {
                            Some(abs) => abs.to_string(),
                            None => format!("xl/{target}"),
                        };
                        rels.insert(id, path);
                    }
                }
                Ok(Event::Eof) | Err(_) => break,
                _ => {}
            }
            buf.clear();
        }
    }

    let xml = read_zip_entry_bounded(archive, "xl/workbook.xml", MAX_XML_ENTRY_BYTES)?;
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut sheets = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                let name = attr(&e, b"name").unwrap_or_else(|| format!("Sheet{}", sheets.len() + 1));
                let part = attr(&e, b"id")
                    .and_then(|id| rels.get(&id).cloned())
                    .unwrap_or_else(|| format!("xl/worksheets/sheet{}.xml", sheets.len() + 1));
                sheets.push((name, part));
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(format!("workbook.xml: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    if sheets.is_empty() {
        let mut parts: Vec<String> = archive
            .file_names()
            .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
            .map(str::to_string)
            .collect();
        parts.sort_by_key(|n| {
            n.trim_start_matches("xl/worksheets/sheet")
                .trim_end_matches(".xml")
                .parse::<u32>()
                .unwrap_or(u32::MAX)
        });
        sheets = parts
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("Sheet{}", i + 1), p))
            .collect();
    }
    Ok(sheets)
}

/// `"BC12"` → zero-based column 54.
fn column_index(cell_ref: &str) -> Option<usize> {
    let letters: String = cell_ref.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    if letters.is_empty() {
        return None;
    }
    let mut n = 0usize;
    for c in letters.chars() {
        n = n * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    Some(n - 1)
}

fn read_sheet_grid(xml: &[u8], shared: &[String]) -> Result<Vec<Vec<String>>, ReportError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut grid: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut col = 0usize;
    let mut cell_type = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut cells = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    row = Vec::new();
                    col = 0;
                }
                b"c" => {
                    if let Some(c) = attr(&e, b"r").and_then(|r| column_index(&r)) {
                        col = c;
                    }
                    cell_type = attr(&e, b"t").unwrap_or_default();
                    value.clear();
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"c" => col += 1,
            Ok(Event::Text(te)) if in_value => {
                value.push_str(&te.unescape().unwrap_or_default());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let text = match cell_type.as_str() {
                        "s" => value
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared.get(i).cloned())
                            .unwrap_or_default(),
                        "b" => (if value.trim() == "1" { "TRUE" } else { "FALSE" }).to_string(),
                        _ => value.clone(),
                    };
                    if row.len() <= col {
                        row.resize(col + 1, String::new());
                    }
                    row[col] = text;
                    col += 1;
                    cells += 1;
                    if cells >= XLSX_MAX_CELLS_PER_SHEET {
                        grid.push(std::mem::take(&mut row));
                        break;
                    }
                }
                b"row" => grid.push(std::mem::take(&mut row)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(format!("worksheet: {e}"))),
            _ => {}
        }
        buf.clear();
    }
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter().map(|r| r.iter().map(|s| s.to_string()).collect()).collect()
    }

    #[test]
    fn header_found_below_title_block() {
        let g = grid(&[
            &["Quarterly Sales Export", "", ""],
            &["", "", ""],
            &["Region", "Q1", "Q2"],
            &["North", "100", "120"],
            &["South", "90", "95"],
        ]);
        let t = sanitize_grid(g).unwrap();
        assert_eq!(t.headers, vec!["Region", "Q1", "Q2"]);
        assert_eq!(t.rows.len(), 2);
    }

    #[test]
    fn blank_columns_dropped_and_names_deduped() {
        let g = grid(&[&["name", "", "value", "Value"], &["a", "", "1", "2"]]);
        let t = sanitize_grid(g).unwrap();
        assert_eq!(t.headers, vec!["name", "value", "Value_2"]);
        assert_eq!(t.rows[0], vec!["a", "1", "2"]);
    }

    #[test]
    fn all_numeric_grid_gets_generated_headers() {
        let t = sanitize_grid(grid(&[&["1", "2"], &["3", "4"]])).unwrap();
        assert_eq!(t.headers, vec!["column_1", "column_2"]);
        assert_eq!(t.rows.len(), 2);
    }

    #[test]
    fn empty_grid_is_none() {
        assert!(sanitize_grid(grid(&[&["", " "]])).is_none());
    }

    #[test]
    fn semicolon_delimiter_detected() {
        assert_eq!(detect_delimiter(b"a;b;c\n1;2;3\n"), b';');
        assert_eq!(detect_delimiter(b"month,revenue\nJan,100\n"), b',');
    }

    #[test]
    fn column_letters() {
        assert_eq!(column_index("A1"), Some(0));
        assert_eq!(column_index("Z9"), Some(25));
        assert_eq!(column_index("AA1"), Some(26));
        assert_eq!(column_index("12"), None);
    }

    #[test]
    fn sheet_xml_with_shared_and_inline_strings() {
        let xml = br#"<worksheet><sheetData>
            <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="inlineStr"><is><t>revenue</t></is></c></row>
            <row r="2"><c r="A2" t="s"><v>1</v></c><c r="C2"><v>42</v></c></row>
        </sheetData></worksheet>"#;
        let shared = vec!["month".to_string(), "Jan".to_string()];
        let g = read_sheet_grid(xml, &shared).unwrap();
        assert_eq!(g[0], vec!["month", "revenue"]);
        assert_eq!(g[1], vec!["Jan", "", "42"]);
    }

    const SHEET_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";

    /// Workbook with one part per `(name, worksheet body)`, inline strings only.
    fn workbook(sheets: &[(&str, String)]) -> Vec<u8> {
        use std::io::Write;

        let mut entries = Vec::new();
        let mut listed = String::new();
        let mut rels = String::new();
        for (i, (name, body)) in sheets.iter().enumerate() {
            let n = i + 1;
            listed.push_str(&format!(r#"<sheet name="{name}" sheetId="{n}" r:id="rId{n}"/>"#));
            rels.push_str(&format!(
                r#"<Relationship Id="rId{n}" Type="worksheet" Target="worksheets/sheet{n}.xml"/>"#
            ));
            entries.push((format!("xl/worksheets/sheet{n}.xml"), body.clone()));
        }
        entries.push((
            "xl/workbook.xml".to_string(),
            format!(
                r#"<workbook xmlns="{SHEET_NS}" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>{listed}</sheets></workbook>"#
            ),
        ));
        entries.push((
            "xl/_rels/workbook.xml.rels".to_string(),
            format!(r#"<Relationships>{rels}</Relationships>"#),
        ));

        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let opts = zip::write::SimpleFileOptions::default();
        for (name, body) in entries {
            zip.start_file(name, opts).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn region_sheet(rows: &[(&str, u32)]) -> String {
        let mut xml = format!(
            r#"<worksheet xmlns="{SHEET_NS}"><sheetData><row r="1"><c r="A1" t="inlineStr"><is><t>region</t></is></c><c r="B1" t="inlineStr"><is><t>units</t></is></c></row>"#
        );
        for (i, (label, value)) in rows.iter().enumerate() {
            let r = i + 2;
            xml.push_str(&format!(
                r#"<row r="{r}"><c r="A{r}" t="inlineStr"><is><t>{label}</t></is></c><c r="B{r}"><v>{value}</v></c></row>"#
            ));
        }
        xml.push_str("</sheetData></worksheet>");
        xml
    }

    /// `<row>` closed by `</sheetData>`: rejected by the XML reader.
    fn truncated_sheet() -> String {
        format!(r#"<worksheet xmlns="{SHEET_NS}"><sheetData><row r="1"><c r="A1"><v>7</v></c></sheetData></worksheet>"#)
    }

    #[test]
    fn each_sheet_is_one_unit_and_bad_sheets_are_skipped() {
        let bytes = workbook(&[
            ("North", region_sheet(&[("Q1", 40), ("Q2", 44)])),
            ("South", region_sheet(&[("Q1", 25), ("Q2", 29)])),
            ("East", region_sheet(&[("Q1", 31), ("Q2", 30)])),
            ("Scratch", truncated_sheet()),
        ]);
        let doc = extract_xlsx(&bytes).unwrap();

        assert_eq!(doc.unit_count, 4);
        let units: Vec<u32> = doc.nodes.iter().map(|n| n.provenance.unit).collect();
        assert_eq!(units, vec![1, 2, 3]);
        let labels: Vec<&str> = doc.nodes.iter().filter_map(|n| n.provenance.label.as_deref()).collect();
        assert_eq!(labels, vec!["North", "South", "East"]);

        assert_eq!(doc.warnings.len(), 1, "{:?}", doc.warnings);
        assert!(doc.warnings[0].starts_with("sheet 4 'Scratch' unreadable"));
    }

    #[test]
    fn bad_sheet_between_good_ones_keeps_later_units() {
        let bytes = workbook(&[
            ("North", region_sheet(&[("Q1", 40), ("Q2", 44)])),
            ("Scratch", truncated_sheet()),
            ("East", region_sheet(&[("Q1", 31), ("Q2", 30)])),
        ]);
        let doc = extract_xlsx(&bytes).unwrap();

        let units: Vec<u32> = doc.nodes.iter().map(|n| n.provenance.unit).collect();
        assert_eq!(units, vec![1, 3]);
        assert_eq!(doc.warnings.len(), 1);
        assert!(doc.warnings[0].contains("sheet 2"));
    }

    #[test]
    fn zip_without_workbook_is_unsupported() {
        let bytes = {
            use std::io::Write;
            let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
            zip.start_file("notes.txt", zip::write::SimpleFileOptions::default()).unwrap();
            zip.write_all(b"hello").unwrap();
            zip.finish().unwrap().into_inner()
        };
        assert!(matches!(extract_xlsx(&bytes), Err(ReportError::UnsupportedFormat { .. })));
    }
}
