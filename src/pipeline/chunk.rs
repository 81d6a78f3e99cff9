//! Chunker: content nodes → retrieval-sized units.
//!
//! Text is packed greedily from paragraphs, falling back to sentences and
//! finally to word-boundary hard splits for run-on text. Each chunk after the
//! first of a node carries a tail of the previous chunk so a statement that
//! straddles a boundary is retrievable from either side.
//!
//! Tables are never flattened into prose: a table becomes one markdown pipe
//! table chunk, or several row-range fragments that each repeat the header
//! when the table is larger than `max_chars`. A table split into fragments
//! additionally contributes a short statistical summary chunk, since no single
//! fragment holds the whole column. A table that fits one chunk stays one chunk.

use crate::config::ReportConfig;
use crate::document::{ContentNode, NodePayload, Provenance, Table};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Text,
    Table,
    Summary,
}

/// A retrieval unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    /// Position in document order; used as the retrieval tie-breaker.
    pub ordinal: usize,
    pub kind: ChunkKind,
    pub text: String,
    pub provenance: Vec<Provenance>,
    /// SHA-256 of `text`, hex.
    pub hash: String,
    /// The structured rows behind a table chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<Table>,
}

/// Size policy.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    pub target: usize,
    pub overlap: usize,
    pub max_chars: usize,
}

impl From<&ReportConfig> for ChunkOptions {
    fn from(c: &ReportConfig) -> Self {
        Self {
            target: c.chunk_size,
            overlap: c.chunk_overlap,
            max_chars: c.max_chunk_chars,
        }
    }
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self::from(&ReportConfig::default())
    }
}

/// Chunk every node, in order. Ordinals are contiguous from 0.
pub fn chunk(nodes: &[ContentNode], opts: &ChunkOptions) -> Vec<Chunk> {
    let target = opts.target.max(1);
    let max_chars = opts.max_chars.max(target);
    let mut builder = Builder::default();

    for node in nodes {
        match &node.payload {
            NodePayload::Text { text } => {
                for piece in split_text(text, target, opts.overlap, max_chars) {
                    builder.push(ChunkKind::Text, piece, vec![node.provenance.clone()], None);
                }
            }
            NodePayload::Table { table } => {
                if table.is_empty() {
                    continue;
                }
                let fragments = split_table(table, &node.provenance, max_chars);
                let split = fragments.len() > 1;
                for (fragment, prov) in fragments {
                    let text = truncate_chars(&fragment.to_markdown(), max_chars);
                    builder.push(ChunkKind::Table, text, vec![prov], Some(fragment));
                }
                if split {
                    let summary = truncate_chars(&table_summary(table), max_chars);
                    builder.push(ChunkKind::Summary, summary, vec![node.provenance.clone()], None);
                }
            }
            NodePayload::Image { caption, .. } => {
                if let Some(caption) = caption.as_deref().filter(|c| !c.trim().is_empty()) {
                    for piece in split_text(caption, target, opts.overlap, max_chars) {
                        builder.push(ChunkKind::Text, piece, vec![node.provenance.clone()], None);
                    }
                }
            }
        }
    }
    builder.chunks
}

#[derive(Default)]
struct Builder {
    chunks: Vec<Chunk>,
}

impl Builder {
    fn push(&mut self, kind: ChunkKind, text: String, provenance: Vec<Provenance>, table: Option<Table>) {
        if text.trim().is_empty() {
            return;
        }
        let ordinal = self.chunks.len();
        let hash = hex::encode(Sha256::digest(text.as_bytes()));
        self.chunks.push(Chunk {
            id: format!("c{ordinal}"),
            ordinal,
            kind,
            text,
            provenance,
            hash,
            table,
        });
    }
}

// ── Text ─────────────────────────────────────────────────────────────────

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Split `text` into chunk bodies of at most `target` chars, with overlap
/// prefixes, each at most `max_chars`.
pub fn split_text(text: &str, target: usize, overlap: usize, max_chars: usize) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if char_len(trimmed) <= target {
        return vec![trimmed.to_string()];
    }

    let mut bodies: Vec<String> = Vec::new();
    let mut current = String::new();
    for (piece, sep) in pieces(trimmed, target) {
        let needed = if current.is_empty() {
            char_len(&piece)
        } else {
            char_len(&current) + sep.len() + char_len(&piece)
        };
        if needed > target && !current.is_empty() {
            bodies.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str(sep);
        }
        current.push_str(&piece);
    }
    if !current.is_empty() {
        bodies.push(current);
    }

    let mut out = Vec::with_capacity(bodies.len());
    for (i, body) in bodies.iter().enumerate() {
        if i == 0 || overlap == 0 {
            out.push(body.clone());
            continue;
        }
        let room = max_chars.saturating_sub(char_len(body) + 1).min(overlap);
        let prefix = overlap_tail(&bodies[i - 1], room);
        if prefix.is_empty() {
            out.push(body.clone());
        } else {
            out.push(format!("{prefix} {body}"));
        }
    }
    out
}

/// Paragraphs, then sentences, then word-wrapped slices, each ≤ `target`.
/// The separator is what joins the piece to its predecessor.
fn pieces(text: &str, target: usize) -> Vec<(String, &'static str)> {
    let mut out = Vec::new();
    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if char_len(para) <= target {
            out.push((para.to_string(), "\n\n"));
            continue;
        }
        let mut first = true;
        for sentence in sentences(para) {
            let sep = if first { "\n\n" } else { " " };
            first = false;
            if char_len(sentence) <= target {
                out.push((sentence.to_string(), sep));
            } else {
                for (j, slice) in hard_wrap(sentence, target).into_iter().enumerate() {
                    out.push((slice, if j == 0 { sep } else { " " }));
                }
            }
        }
    }
    out
}

fn sentences(para: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = para.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            if let Some(&(j, next)) = chars.peek() {
                if next.is_whitespace() {
                    let s = para[start..i + c.len_utf8()].trim();
                    if !s.is_empty() {
                        out.push(s);
                    }
                    start = j;
                }
            }
        }
    }
    let tail = para[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Split at the last whitespace before `target` chars, or hard at `target`.
fn hard_wrap(s: &str, target: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = s.trim();
    while char_len(rest) > target {
        let limit = rest.char_indices().nth(target).map(|(i, _)| i).unwrap_or(rest.len());
        let cut = rest[..limit]
            .rfind(char::is_whitespace)
            .filter(|&p| p > 0)
            .unwrap_or(limit);
        out.push(rest[..cut].trim().to_string());
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

/// Last `n` chars of `s`, starting on a word boundary.
fn overlap_tail(s: &str, n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let total = char_len(s);
    if total <= n {
        return s.trim().to_string();
    }
    let start = s.char_indices().nth(total - n).map(|(i, _)| i).unwrap_or(0);
    let tail = &s[start..];
    match tail.find(char::is_whitespace) {
        Some(p) => tail[p..].trim().to_string(),
        None => String::new(),
    }
}

// ── Tables ───────────────────────────────────────────────────────────────

/// Row-range fragments whose markdown fits `max_chars`, each with its
/// 1-indexed row range in provenance.
fn split_table(table: &Table, base: &Provenance, max_chars: usize) -> Vec<(Table, Provenance)> {
    let offset = base.rows.map(|r| r.start.saturating_sub(1)).unwrap_or(0);
    let whole = table.to_markdown();
    if char_len(&whole) <= max_chars {
        let prov = base
            .clone()
            .with_rows(offset + 1, offset + table.rows.len());
        return vec![(table.clone(), prov)];
    }

    let header_len = char_len(&table.slice_rows(0, 0).to_markdown());
    let mut out = Vec::new();
    let mut start = 0;
    while start < table.rows.len() {
        let mut end = start;
        let mut len = header_len;
        while end < table.rows.len() {
            let row_len = char_len(&Table::new(table.headers.clone(), vec![table.rows[end].clone()]).to_markdown())
                - header_len;
            if end > start && len + row_len > max_chars {
                break;
            }
            len += row_len;
            end += 1;
        }
        let fragment = table.slice_rows(start, end);
        let prov = base.clone().with_rows(offset + start + 1, offset + end);
        out.push((fragment, prov));
        start = end;
    }
    out
}

/// Plain-language statistics for a table: size, per-column type, numeric
/// min/mean/max/total, and the most frequent values of text columns.
pub fn table_summary(table: &Table) -> String {
    let mut out = format!(
        "Dataset summary: {} rows x {} columns.",
        table.rows.len(),
        table.width()
    );
    for (idx, header) in table.headers.iter().enumerate() {
        if table.is_numeric_column(idx) {
            let values: Vec<f64> = table.numeric_column(idx).into_iter().flatten().collect();
            if values.is_empty() {
                continue;
            }
            let total: f64 = values.iter().sum();
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            out.push_str(&format!(
                "\nColumn '{}' (numeric, {} values): min {}, mean {}, max {}, total {}.",
                header,
                values.len(),
                fmt_num(min),
                fmt_num(total / values.len() as f64),
                fmt_num(max),
                fmt_num(total)
            ));
            if let (Some(first), Some(last)) = (values.first(), values.last()) {
                if values.len() > 1 && *first != 0.0 {
                    out.push_str(&format!(
                        " First-to-last change: {:+.1}%.",
                        (last - first) / first.abs() * 100.0
                    ));
                }
            }
        } else {
            let mut counts: HashMap<&str, usize> = HashMap::new();
            for cell in table.column(idx).map(str::trim).filter(|c| !c.is_empty()) {
                *counts.entry(cell).or_default() += 1;
            }
            if counts.is_empty() {
                continue;
            }
            let mut top: Vec<(&str, usize)> = counts.iter().map(|(k, v)| (*k, *v)).collect();
            top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
            let shown: Vec<String> = top.iter().take(3).map(|(k, v)| format!("{k} ({v})")).collect();
            out.push_str(&format!(
                "\nColumn '{}' (text, {} distinct): most frequent {}.",
                header,
                counts.len(),
                shown.join(", ")
            ));
        }
    }
    out
}

fn fmt_num(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v:.2}")
    }
}
