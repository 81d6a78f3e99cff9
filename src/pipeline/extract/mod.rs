//! Content Extractor: raw bytes → normalised [`ContentNode`] sequence.
//!
//! ```text
//! bytes + declared type ──▶ detect_kind ──▶ ExtractorRegistry::find
//!                                                 │
//!      ┌──────────┬──────────────┬──────────┬─────┼──────────┐
//!      ▼          ▼              ▼          ▼     ▼          ▼
//!     csv    spreadsheet        docx       pdf  image       text
//! ```
//!
//! Each [`ExtractionStrategy`] owns one [`DocumentKind`]. Strategies may
//! process pages concurrently; [`extract`] re-sorts their output into
//! provenance order and rejects documents with nothing groundable.

mod docx;
mod scan;
mod pdf;
mod tabular;
mod text;

pub use self::docx::DocxExtractor;
pub use self::scan::ImageExtractor;
pub use self::pdf::{should_use_ocr, PdfExtractor};
pub use self::tabular::{sanitize_grid, CsvExtractor, SpreadsheetExtractor};
pub use self::text::TextExtractor;

use crate::artifact::ArtifactStore;
use crate::cancel::Cancellation;
use crate::config::ReportConfig;
use crate::document::{DocumentKind, ExtractedDocument};
use crate::error::ReportError;
use crate::pipeline::ocr::OcrEngine;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Extraction knobs taken from [`ReportConfig`].
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub password: Option<String>,
    /// Embedded images smaller than this on either side are skipped.
    pub min_image_px: u32,
    /// Longest edge when rasterising a page for OCR.
    pub max_rendered_pixels: u32,
    pub ocr_concurrency: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self::from(&ReportConfig::default())
    }
}

impl From<&ReportConfig> for ExtractOptions {
    fn from(c: &ReportConfig) -> Self {
        Self {
            password: c.password.clone(),
            min_image_px: c.min_image_px,
            max_rendered_pixels: c.max_rendered_pixels,
            ocr_concurrency: c.ocr_concurrency.max(1),
        }
    }
}

/// Per-job state an extractor may touch.
#[derive(Clone)]
pub struct ExtractContext {
    pub store: Arc<ArtifactStore>,
    /// `None` disables the OCR fallback.
    pub ocr: Option<Arc<dyn OcrEngine>>,
    pub cancel: Cancellation,
    pub options: ExtractOptions,
}

impl ExtractContext {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        Self {
            store,
            ocr: None,
            cancel: Cancellation::new(),
            options: ExtractOptions::default(),
        }
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub fn with_cancel(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_options(mut self, options: ExtractOptions) -> Self {
        self.options = options;
        self
    }
}

/// One input format.
#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> DocumentKind;

    /// Parse `bytes`. Unreadable pages or sheets become warnings; only a
    /// document that cannot be opened at all is an error.
    async fn extract(&self, bytes: &[u8], ctx: &ExtractContext) -> Result<ExtractedDocument, ReportError>;
}

/// Kind → strategy dispatch table.
pub struct ExtractorRegistry {
    strategies: Vec<Arc<dyn ExtractionStrategy>>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(PdfExtractor));
        registry.register(Arc::new(CsvExtractor));
        registry.register(Arc::new(SpreadsheetExtractor));
        registry.register(Arc::new(DocxExtractor));
        registry.register(Arc::new(ImageExtractor));
        registry.register(Arc::new(TextExtractor));
        registry
    }
}

impl ExtractorRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Add a strategy. A later registration for the same kind wins.
    pub fn register(&mut self, strategy: Arc<dyn ExtractionStrategy>) {
        self.strategies.retain(|s| s.kind() != strategy.kind());
        self.strategies.push(strategy);
    }

    pub fn find(&self, kind: DocumentKind) -> Option<Arc<dyn ExtractionStrategy>> {
        self.strategies.iter().find(|s| s.kind() == kind).cloned()
    }

    pub fn kinds(&self) -> Vec<DocumentKind> {
        self.strategies.iter().map(|s| s.kind()).collect()
    }
}

/// Decide the document kind.
///
/// The declared MIME type wins, then the file extension, then magic bytes.
/// A declared binary format whose bytes do not match is treated as a
/// corrupted file (`ExtractionFailure`); a declared type this crate does
/// not handle is `UnsupportedFormat`.
pub fn detect_kind(
    bytes: &[u8],
    declared_type: Option<&str>,
    file_name: Option<&str>,
) -> Result<DocumentKind, ReportError> {
    if bytes.is_empty() {
        return Err(ReportError::ExtractionFailure {
            kind: declared_type.unwrap_or("unknown").to_string(),
            detail: "document is empty".into(),
        });
    }

    let declared = declared_type
        .map(str::trim)
        .filter(|m| !m.is_empty() && !m.eq_ignore_ascii_case("application/octet-stream"));
    let from_name = file_name
        .and_then(|n| Path::new(n).extension())
        .and_then(|e| e.to_str())
        .and_then(DocumentKind::from_extension);

    let claimed = match declared {
        Some(mime) => match DocumentKind::from_mime(mime) {
            // Servers often label CSV downloads as text/plain.
            Some(DocumentKind::Text) if from_name == Some(DocumentKind::Csv) => Some(DocumentKind::Csv),
            Some(kind) => Some(kind),
            None => {
                return Err(ReportError::UnsupportedFormat {
                    detail: format!("declared type '{mime}'"),
                })
            }
        },
        None => from_name,
    };
    let sniffed = DocumentKind::sniff(bytes);

    let kind = match claimed {
        Some(kind) => {
            verify_claim(kind, bytes, sniffed)?;
            kind
        }
        None => match sniffed {
            Some(kind) => kind,
            None if looks_textual(bytes) => {
                if looks_like_csv(bytes) {
                    DocumentKind::Csv
                } else {
                    DocumentKind::Text
                }
            }
            None => {
                return Err(ReportError::UnsupportedFormat {
                    detail: format!(
                        "unrecognised content{}",
                        file_name.map(|n| format!(" in '{n}'")).unwrap_or_default()
                    ),
                })
            }
        },
    };
    debug!("detected document kind: {kind}");
    Ok(kind)
}

fn verify_claim(kind: DocumentKind, bytes: &[u8], sniffed: Option<DocumentKind>) -> Result<(), ReportError> {
    let corrupted = |detail: &str| ReportError::ExtractionFailure {
        kind: kind.as_str().into(),
        detail: detail.into(),
    };
    match kind {
        DocumentKind::Pdf if sniffed != Some(DocumentKind::Pdf) => {
            Err(corrupted("missing %PDF header; the file is corrupted or not a PDF"))
        }
        DocumentKind::Spreadsheet if sniffed != Some(DocumentKind::Spreadsheet) => {
            Err(corrupted("no xl/workbook.xml in a zip container; the workbook is corrupted"))
        }
        DocumentKind::Docx if sniffed != Some(DocumentKind::Docx) => {
            Err(corrupted("no word/document.xml in a zip container; the document is corrupted"))
        }
        DocumentKind::Image if sniffed != Some(DocumentKind::Image) => {
            Err(corrupted("image data could not be recognised"))
        }
        DocumentKind::Csv | DocumentKind::Text if !looks_textual(bytes) => {
            Err(corrupted("binary content in a text document"))
        }
        _ => Ok(()),
    }
}

fn looks_textual(bytes: &[u8]) -> bool {
    let sample = &bytes[..bytes.len().min(8 * 1024)];
    if sample.contains(&0) {
        return false;
    }
    // A multi-byte character may be cut at the sample boundary.
    match std::str::from_utf8(sample) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    }
}

/// At least two lines sharing the same non-zero comma count.
fn looks_like_csv(bytes: &[u8]) -> bool {
    let sample = String::from_utf8_lossy(&bytes[..bytes.len().min(4 * 1024)]);
    let counts: Vec<usize> = sample
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(5)
        .map(|l| l.matches(',').count())
        .collect();
    counts.len() >= 2 && counts[0] > 0 && counts.iter().all(|&c| c == counts[0])
}

/// Run the strategy for `kind` and normalise its output.
pub async fn extract(
    registry: &ExtractorRegistry,
    bytes: &[u8],
    kind: DocumentKind,
    ctx: &ExtractContext,
) -> Result<ExtractedDocument, ReportError> {
    let strategy = registry.find(kind).ok_or_else(|| ReportError::UnsupportedFormat {
        detail: format!("no extractor registered for {kind}"),
    })?;
    info!("Extracting {} bytes with the {} extractor", bytes.len(), strategy.name());

    let mut doc = strategy.extract(bytes, ctx).await?;
    doc.sort_by_provenance();
    for w in &doc.warnings {
        warn!("{w}");
    }

    if doc.groundable_count() == 0 {
        return Err(ReportError::ExtractionFailure {
            kind: kind.as_str().into(),
            detail: format!(
                "no usable text or tables in {} {}(s)",
                doc.unit_count,
                kind.unit_name()
            ),
        });
    }
    info!(
        "Extracted {} node(s) from {}/{} {}(s)",
        doc.nodes.len(),
        doc.covered_units().len(),
        doc.unit_count,
        kind.unit_name()
    );
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ContentNode;
    use crate::document::Provenance;

    #[test]
    fn declared_pdf_without_header_is_corrupted() {
        let err = detect_kind(b"garbage bytes", Some("application/pdf"), None).unwrap_err();
        assert!(matches!(err, ReportError::ExtractionFailure { .. }));
    }

    #[test]
    fn unknown_declared_type_is_unsupported() {
        let err = detect_kind(b"PK\x03\x04", Some("application/zip"), None).unwrap_err();
        assert!(matches!(err, ReportError::UnsupportedFormat { .. }));
    }

    #[test]
    fn extension_then_sniffing() {
        assert_eq!(detect_kind(b"a,b\n1,2\n", None, Some("data.csv")).unwrap(), DocumentKind::Csv);
        assert_eq!(detect_kind(b"%PDF-1.4 ...", None, Some("blob")).unwrap(), DocumentKind::Pdf);
        assert_eq!(detect_kind(b"month,revenue\nJan,1\n", None, None).unwrap(), DocumentKind::Csv);
        assert_eq!(detect_kind(b"Plain notes.\nMore notes.", None, None).unwrap(), DocumentKind::Text);
        assert_eq!(
            detect_kind(b"%PDF-1.7", Some("application/octet-stream"), None).unwrap(),
            DocumentKind::Pdf
        );
    }

    fn zip_with(part: &str) -> Vec<u8> {
        use std::io::Write;
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        zip.start_file(part, zip::write::SimpleFileOptions::default()).unwrap();
        zip.write_all(b"<x/>").unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn word_and_excel_packages_are_told_apart() {
        let docx = zip_with("word/document.xml");
        let xlsx = zip_with("xl/workbook.xml");
        assert_eq!(detect_kind(&docx, None, None).unwrap(), DocumentKind::Docx);
        assert_eq!(detect_kind(&xlsx, None, Some("blob")).unwrap(), DocumentKind::Spreadsheet);
        assert_eq!(detect_kind(&docx, None, Some("memo.docx")).unwrap(), DocumentKind::Docx);

        // A Word package named like a workbook is a broken workbook.
        let err = detect_kind(&docx, None, Some("q3.xlsx")).unwrap_err();
        assert!(matches!(err, ReportError::ExtractionFailure { .. }));
        let err = detect_kind(&xlsx, None, Some("memo.docx")).unwrap_err();
        assert!(matches!(err, ReportError::ExtractionFailure { .. }));

        let err = detect_kind(&zip_with("notes.txt"), None, None).unwrap_err();
        assert!(matches!(err, ReportError::UnsupportedFormat { .. }));
    }

    #[test]
    fn binary_without_magic_is_unsupported() {
        let err = detect_kind(&[0u8, 1, 2, 3, 0, 9], None, None).unwrap_err();
        assert!(matches!(err, ReportError::UnsupportedFormat { .. }));
    }

    struct Scrambled;

    #[async_trait]
    impl ExtractionStrategy for Scrambled {
        fn name(&self) -> &'static str {
            "scrambled"
        }
        fn kind(&self) -> DocumentKind {
            DocumentKind::Text
        }
        async fn extract(&self, _b: &[u8], _c: &ExtractContext) -> Result<ExtractedDocument, ReportError> {
            Ok(ExtractedDocument {
                nodes: vec![
                    ContentNode::text(Provenance::unit(3, 0), "three"),
                    ContentNode::text(Provenance::unit(1, 0), "one"),
                    ContentNode::text(Provenance::unit(2, 0), "two"),
                ],
                unit_count: 3,
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn output_is_sorted_and_tiles_units() {
        let mut registry = ExtractorRegistry::empty();
        registry.register(Arc::new(Scrambled));
        let ctx = ExtractContext::new(Arc::new(ArtifactStore::new("job")));
        let doc = extract(&registry, b"x", DocumentKind::Text, &ctx).await.unwrap();
        let units: Vec<u32> = doc.nodes.iter().map(|n| n.provenance.unit).collect();
        assert_eq!(units, vec![1, 2, 3]);
        assert_eq!(doc.covered_units().into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn whitespace_only_text_is_extraction_failure() {
        let registry = ExtractorRegistry::default();
        let ctx = ExtractContext::new(Arc::new(ArtifactStore::new("job")));
        let err = extract(&registry, b"   \n\n  ", DocumentKind::Text, &ctx).await.unwrap_err();
        assert!(matches!(err, ReportError::ExtractionFailure { .. }));
    }

    #[test]
    fn registry_covers_every_kind() {
        let registry = ExtractorRegistry::default();
        for kind in [
            DocumentKind::Pdf,
            DocumentKind::Csv,
            DocumentKind::Spreadsheet,
            DocumentKind::Docx,
            DocumentKind::Image,
            DocumentKind::Text,
        ] {
            assert!(registry.find(kind).is_some(), "{kind}");
        }
    }
}
