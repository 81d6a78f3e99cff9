//! Document renderer: report markdown → A4 PDF via printpdf.
//!
//! Only the markdown subset the synthesizer produces is understood:
//! `#`..`###` headings, paragraphs, `-`/`*`/`1.` list items, pipe tables,
//! fenced code, rules and `![alt](artifact:<id>)` images. Inline emphasis is
//! stripped. Text uses the builtin Helvetica faces, so glyphs outside
//! Latin-1 are transliterated or replaced.
//!
//! Every artifact reference is resolved against the job's store before any
//! drawing starts; one unresolvable reference fails the whole render.

use crate::artifact::{artifact_refs, ArtifactId, ArtifactStore};
use crate::error::RenderError;
use once_cell::sync::Lazy;
use printpdf::image_crate::{DynamicImage, GenericImageView};
use printpdf::{
    BuiltinFont, Image, ImageTransform, IndirectFontRef, Mm, PdfDocument, PdfDocumentReference,
    PdfLayerReference,
};
use regex::Regex;
use std::collections::HashMap;
use std::io::BufWriter;
use tracing::{debug, info};

const PAGE_W: f32 = 210.0;
const PAGE_H: f32 = 297.0;
const MARGIN: f32 = 20.0;
const CONTENT_W: f32 = PAGE_W - 2.0 * MARGIN;
const PT_TO_MM: f32 = 0.3528;
/// Average Helvetica glyph width as a fraction of the font size.
const AVG_GLYPH: f32 = 0.5;
const BODY_PT: f32 = 10.5;

static RE_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^!\[([^\]]*)\]\(artifact:([A-Za-z0-9_-]+)\)\s*$").unwrap());
static RE_ORDERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)[.)]\s+(.*)$").unwrap());
static RE_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\([^)]*\)").unwrap());
static RE_EMPHASIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\*\*|__|\*|`)").unwrap());

/// One layout block.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Block {
    Heading { level: usize, text: String },
    Paragraph(String),
    Bullet { marker: String, text: String },
    Table { headers: Vec<String>, rows: Vec<Vec<String>> },
    Image { alt: String, id: ArtifactId },
    Code(Vec<String>),
    Rule,
}

fn is_pipe_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 1 && t.starts_with('|') && t.ends_with('|')
}

fn pipe_cells(line: &str) -> Vec<String> {
    let t = line.trim();
    t[1..t.len() - 1].split('|').map(|c| c.trim().to_string()).collect()
}

fn is_separator_row(line: &str) -> bool {
    line.trim().chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// Strip inline markdown down to display text.
fn plain(text: &str) -> String {
    let text = RE_LINK.replace_all(text, "$1");
    let text = RE_EMPHASIS.replace_all(&text, "");
    text.trim_matches('_').trim().to_string()
}

/// Split markdown into layout blocks.
pub(crate) fn parse_blocks(markdown: &str) -> Vec<Block> {
    let lines: Vec<&str> = markdown.lines().collect();
    let mut blocks = Vec::new();
    let mut para: Vec<String> = Vec::new();
    let mut i = 0;

    fn flush(para: &mut Vec<String>, blocks: &mut Vec<Block>) {
        if !para.is_empty() {
            blocks.push(Block::Paragraph(para.join(" ")));
            para.clear();
        }
    }

    while i < lines.len() {
        let line = lines[i].trim_end();
        let trimmed = line.trim();

        if trimmed.is_empty() {
            flush(&mut para, &mut blocks);
            i += 1;
            continue;
        }

        if trimmed.starts_with("```") {
            flush(&mut para, &mut blocks);
            let mut code = Vec::new();
            i += 1;
            while i < lines.len() && !lines[i].trim().starts_with("```") {
                code.push(lines[i].to_string());
                i += 1;
            }
            blocks.push(Block::Code(code));
            i += 1;
            continue;
        }

        if let Some(caps) = RE_IMAGE.captures(trimmed) {
            flush(&mut para, &mut blocks);
            blocks.push(Block::Image {
                alt: caps[1].to_string(),
                id: ArtifactId::new(&caps[2]),
            });
            i += 1;
            continue;
        }

        if trimmed.starts_with('#') {
            let level = trimmed.chars().take_while(|c| *c == '#').count();
            if level <= 6 && trimmed[level..].starts_with(' ') {
                flush(&mut para, &mut blocks);
                blocks.push(Block::Heading {
                    level: level.min(3),
                    text: plain(&trimmed[level..]),
                });
                i += 1;
                continue;
            }
        }

        if matches!(trimmed, "---" | "***" | "___") {
            flush(&mut para, &mut blocks);
            blocks.push(Block::Rule);
            i += 1;
            continue;
        }

        if is_pipe_row(trimmed) {
            let end = lines[i..]
                .iter()
                .position(|l| !is_pipe_row(l))
                .map(|p| i + p)
                .unwrap_or(lines.len());
            let rows: Vec<&str> = lines[i..end].to_vec();
            if rows.len() >= 2 && is_separator_row(rows[1]) {
                flush(&mut para, &mut blocks);
                blocks.push(Block::Table {
                    headers: pipe_cells(rows[0]).iter().map(|c| plain(c)).collect(),
                    rows: rows[2..]
                        .iter()
                        .map(|r| pipe_cells(r).iter().map(|c| plain(c)).collect())
                        .collect(),
                });
                i = end;
                continue;
            }
        }

        if let Some(rest) = trimmed.strip_prefix("- ").or_else(|| trimmed.strip_prefix("* ")) {
            flush(&mut para, &mut blocks);
            blocks.push(Block::Bullet {
                marker: "-".into(),
                text: plain(rest),
            });
            i += 1;
            continue;
        }
        if let Some(caps) = RE_ORDERED.captures(trimmed) {
            flush(&mut para, &mut blocks);
            blocks.push(Block::Bullet {
                marker: format!("{}.", &caps[1]),
                text: plain(&caps[2]),
            });
            i += 1;
            continue;
        }

        para.push(plain(trimmed));
        i += 1;
    }
    flush(&mut para, &mut blocks);
    blocks
}

/// Map text onto what the builtin WinAnsi fonts can draw.
fn printable(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2013}' | '\u{2014}' => '-',
            '\u{2022}' => '-',
            '\u{00A0}' => ' ',
            c if (c as u32) < 0x20 => ' ',
            c if (c as u32) <= 0xFF => c,
            _ => '?',
        })
        .collect()
}

/// Greedy word wrap to a character budget.
fn wrap(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(8);
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let mut word = word.to_string();
        while word.chars().count() > max_chars {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let head: String = word.chars().take(max_chars).collect();
            word = word.chars().skip(max_chars).collect();
            lines.push(head);
        }
        if current.is_empty() {
            current = word;
        } else if current.chars().count() + 1 + word.chars().count() <= max_chars {
            current.push(' ');
            current.push_str(&word);
        } else {
            lines.push(std::mem::replace(&mut current, word));
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn chars_for(width_mm: f32, size_pt: f32) -> usize {
    (width_mm / (size_pt * AVG_GLYPH * PT_TO_MM)) as usize
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('~');
    out
}

struct Fonts {
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    mono: IndirectFontRef,
}

/// Cursor over the page sequence; opens a new page when a block no longer fits.
struct Writer {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    fonts: Fonts,
    y: f32,
    pages: usize,
}

impl Writer {
    fn new(title: &str) -> Result<Self, RenderError> {
        let (doc, page, layer) = PdfDocument::new(title, Mm(PAGE_W), Mm(PAGE_H), "Layer 1");
        let font = |f: BuiltinFont| {
            doc.add_builtin_font(f)
                .map_err(|e| RenderError::Writer(format!("font: {e}")))
        };
        let fonts = Fonts {
            regular: font(BuiltinFont::Helvetica)?,
            bold: font(BuiltinFont::HelveticaBold)?,
            mono: font(BuiltinFont::Courier)?,
        };
        let layer = doc.get_page(page).get_layer(layer);
        Ok(Self {
            doc,
            layer,
            fonts,
            y: PAGE_H - MARGIN,
            pages: 1,
        })
    }

    fn ensure(&mut self, height: f32) {
        if self.y - height >= MARGIN {
            return;
        }
        let (page, layer) = self.doc.add_page(Mm(PAGE_W), Mm(PAGE_H), "Layer 1");
        self.layer = self.doc.get_page(page).get_layer(layer);
        self.y = PAGE_H - MARGIN;
        self.pages += 1;
    }

    fn text_line(&mut self, text: &str, size: f32, x: f32, font: &IndirectFontRef) {
        let line_h = size * PT_TO_MM * 1.4;
        self.ensure(line_h);
        self.y -= line_h;
        self.layer
            .use_text(printable(text), size, Mm(x), Mm(self.y), font);
    }

    fn gap(&mut self, mm: f32) {
        self.y -= mm;
    }

    fn heading(&mut self, level: usize, text: &str) {
        let size = match level {
            1 => 20.0,
            2 => 15.0,
            _ => 12.5,
        };
        // Keep a heading on the same page as the first lines after it.
        self.ensure(size * PT_TO_MM * 1.4 + 15.0);
        self.gap(if level == 1 { 0.0 } else { 3.0 });
        let bold = self.fonts.bold.clone();
        for line in wrap(text, chars_for(CONTENT_W, size)) {
            self.text_line(&line, size, MARGIN, &bold);
        }
        self.gap(1.5);
    }

    fn paragraph(&mut self, text: &str, indent: f32) {
        let regular = self.fonts.regular.clone();
        for line in wrap(text, chars_for(CONTENT_W - indent, BODY_PT)) {
            self.text_line(&line, BODY_PT, MARGIN + indent, &regular);
        }
        self.gap(2.0);
    }

    fn bullet(&mut self, marker: &str, text: &str) {
        let regular = self.fonts.regular.clone();
        let indent = 6.0;
        let lines = wrap(text, chars_for(CONTENT_W - indent, BODY_PT));
        for (n, line) in lines.iter().enumerate() {
            self.text_line(line, BODY_PT, MARGIN + indent, &regular);
            if n == 0 {
                self.layer
                    .use_text(marker, BODY_PT, Mm(MARGIN + 1.0), Mm(self.y), &regular);
            }
        }
        self.gap(1.0);
    }

    fn table(&mut self, headers: &[String], rows: &[Vec<String>]) {
        let cols = headers.len().max(1);
        let size = if cols > 6 { 8.0 } else { 9.0 };
        let col_w = CONTENT_W / cols as f32;
        let budget = chars_for(col_w - 1.5, size);
        let bold = self.fonts.bold.clone();
        let regular = self.fonts.regular.clone();

        let draw_row = |w: &mut Writer, cells: &[String], font: &IndirectFontRef| {
            let line_h = size * PT_TO_MM * 1.5;
            w.ensure(line_h);
            w.y -= line_h;
            for (c, cell) in cells.iter().take(cols).enumerate() {
                w.layer.use_text(
                    printable(&truncate(cell, budget)),
                    size,
                    Mm(MARGIN + c as f32 * col_w),
                    Mm(w.y),
                    font,
                );
            }
        };
        draw_row(self, headers, &bold);
        let underline: Vec<String> = (0..cols).map(|_| "-".repeat(budget.min(12))).collect();
        draw_row(self, &underline, &regular);
        for row in rows {
            draw_row(self, row, &regular);
        }
        self.gap(3.0);
    }

    fn code(&mut self, lines: &[String]) {
        let mono = self.fonts.mono.clone();
        let size = 8.5;
        // Courier advances 0.6 em per glyph.
        let budget = ((CONTENT_W - 4.0) / (size * 0.6 * PT_TO_MM)) as usize;
        for line in lines {
            self.text_line(&truncate(line, budget), size, MARGIN + 4.0, &mono);
        }
        self.gap(2.0);
    }

    fn image(&mut self, image: &DynamicImage, alt: &str) {
        let (w_px, h_px) = (image.width().max(1) as f32, image.height().max(1) as f32);
        let natural_w = w_px * 25.4 / 96.0;
        let max_h = PAGE_H - 2.0 * MARGIN - 12.0;
        let mut width = natural_w.min(CONTENT_W);
        if width * h_px / w_px > max_h {
            width = max_h * w_px / h_px;
        }
        let height = width * h_px / w_px;
        let dpi = w_px * 25.4 / width;

        self.ensure(height + 8.0);
        self.y -= height;
        Image::from_dynamic_image(image).add_to_layer(
            self.layer.clone(),
            ImageTransform {
                translate_x: Some(Mm(MARGIN + (CONTENT_W - width) / 2.0)),
                translate_y: Some(Mm(self.y)),
                dpi: Some(dpi),
                ..Default::default()
            },
        );
        if !alt.trim().is_empty() {
            let regular = self.fonts.regular.clone();
            self.text_line(alt, 8.5, MARGIN + (CONTENT_W - width) / 2.0, &regular);
        }
        self.gap(4.0);
    }

    fn finish(self) -> Result<(Vec<u8>, usize), RenderError> {
        let pages = self.pages;
        let mut bytes = Vec::new();
        self.doc
            .save(&mut BufWriter::new(&mut bytes))
            .map_err(|e| RenderError::Writer(e.to_string()))?;
        Ok((bytes, pages))
    }
}

/// Resolve and decode every image the markdown references.
fn load_images(
    markdown: &str,
    store: &ArtifactStore,
) -> Result<HashMap<ArtifactId, DynamicImage>, RenderError> {
    let refs = artifact_refs(markdown);
    let mut artifacts = Vec::with_capacity(refs.len());
    for id in refs {
        let artifact = store.get(&id).ok_or_else(|| RenderError::MissingArtifact {
            id: id.as_str().to_string(),
        })?;
        artifacts.push(artifact);
    }

    let mut images = HashMap::new();
    for artifact in artifacts {
        let decoded = printpdf::image_crate::load_from_memory(&artifact.bytes).map_err(|e| {
            RenderError::UndecodableArtifact {
                id: artifact.id.as_str().to_string(),
                detail: e.to_string(),
            }
        })?;
        // printpdf embeds RGB without an alpha mask.
        images.insert(artifact.id, DynamicImage::ImageRgb8(decoded.to_rgb8()));
    }
    Ok(images)
}

/// Render report markdown to PDF bytes.
///
/// CPU-bound; call it from `spawn_blocking` inside async code.
pub fn render_pdf(markdown: &str, store: &ArtifactStore, title: &str) -> Result<Vec<u8>, RenderError> {
    let images = load_images(markdown, store)?;
    let blocks = parse_blocks(markdown);
    debug!("rendering {} block(s), {} image(s)", blocks.len(), images.len());

    let mut w = Writer::new(title)?;
    for block in &blocks {
        match block {
            Block::Heading { level, text } => w.heading(*level, text),
            Block::Paragraph(text) => w.paragraph(text, 0.0),
            Block::Bullet { marker, text } => w.bullet(marker, text),
            Block::Table { headers, rows } => w.table(headers, rows),
            Block::Code(lines) => w.code(lines),
            Block::Rule => w.gap(4.0),
            Block::Image { alt, id } => match images.get(id) {
                Some(img) => w.image(img, alt),
                None => {
                    return Err(RenderError::MissingArtifact {
                        id: id.as_str().to_string(),
                    })
                }
            },
        }
    }
    let (bytes, pages) = w.finish()?;
    info!("Rendered PDF: {} page(s), {} bytes", pages, bytes.len());
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactKind;
    use crate::pipeline::encode::png_bytes;
    use image::{Rgb, RgbImage};

    fn chart_png() -> Vec<u8> {
        png_bytes(&image::DynamicImage::ImageRgb8(RgbImage::from_pixel(
            200,
            120,
            Rgb([30, 90, 200]),
        )))
        .unwrap()
    }

    #[test]
    fn blocks_cover_the_report_subset() {
        let md = "# Report\n\n_Generated today_\n\n## Key Metrics\n\nRevenue **rose** [S1].\n\n- first\n2. second\n\n| a | b |\n|---|---|\n| 1 | 2 |\n\n![Key Metrics](artifact:job-abc)\n";
        let blocks = parse_blocks(md);
        assert_eq!(
            blocks[0],
            Block::Heading {
                level: 1,
                text: "Report".into()
            }
        );
        assert_eq!(blocks[1], Block::Paragraph("Generated today".into()));
        assert_eq!(blocks[3], Block::Paragraph("Revenue rose [S1].".into()));
        assert!(matches!(&blocks[4], Block::Bullet { marker, .. } if marker == "-"));
        assert!(matches!(&blocks[5], Block::Bullet { marker, .. } if marker == "2."));
        assert!(matches!(&blocks[6], Block::Table { rows, .. } if rows.len() == 1));
        assert_eq!(
            blocks[7],
            Block::Image {
                alt: "Key Metrics".into(),
                id: ArtifactId::new("job-abc")
            }
        );
    }

    #[test]
    fn wrap_respects_budget() {
        let lines = wrap("alpha beta gamma delta epsilon", 11);
        assert_eq!(lines, vec!["alpha beta", "gamma delta", "epsilon"]);
        assert!(wrap(&"x".repeat(30), 10).iter().all(|l| l.len() <= 10));
    }

    #[test]
    fn renders_pdf_with_chart() {
        let store = ArtifactStore::new("job-1");
        let id = store.register(ArtifactKind::Chart, "image/png", chart_png());
        let mut md = format!("# Quarterly Report\n\n## Key Metrics\n\n![Revenue]({})\n", id.reference());
        for n in 0..80 {
            md.push_str(&format!("\n- Observation {n} about revenue and margins.\n"));
        }
        let pdf = render_pdf(&md, &store, "Quarterly Report").unwrap();
        assert!(pdf.starts_with(b"%PDF"));
    }

    #[test]
    fn missing_artifact_fails_before_drawing() {
        let store = ArtifactStore::new("job-1");
        let err = render_pdf("# R\n\n![x](artifact:job-1-deadbeef)\n", &store, "R").unwrap_err();
        assert_eq!(
            err,
            RenderError::MissingArtifact {
                id: "job-1-deadbeef".into()
            }
        );
    }

    #[test]
    fn printable_replaces_unsupported_glyphs() {
        assert_eq!(printable("“quoted” – ok • 中"), "\"quoted\" - ok - ?");
    }
}
