//! Post-processing: deterministic cleanup of model-written section bodies.
//!
//! Even well-prompted models occasionally introduce artefacts that break
//! the assembled report:
//!
//! - Wrapping output in ` ```markdown ... ``` ` fences
//! - Repeating the section title as `# Title` or `## Title`, which would
//!   collide with the report's own heading levels
//! - Inventing `![chart](chart.png)` links to files that do not exist
//! - Windows line endings and zero-width characters
//!
//! Each rule is a pure `&str -> String` pass, applied in a fixed order by
//! [`clean_section`].

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every rule to a raw section body.
///
/// Rules (applied in order):
/// 1. Strip outer markdown fences
/// 2. Normalise line endings (CRLF → LF)
/// 3. Drop a leading heading that repeats the section name
/// 4. Demote `#`/`##` headings to `###` so they nest under the section
/// 5. Remove image links that do not point at a job artifact
/// 6. Strip invisible Unicode
/// 7. Trim trailing whitespace per line and collapse runs of blank lines
pub fn clean_section(raw: &str, section_name: &str) -> String {
    let s = strip_markdown_fences(raw);
    let s = normalise_line_endings(&s);
    let s = drop_repeated_title(&s, section_name);
    let s = demote_headings(&s);
    let s = remove_foreign_images(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    collapse_blank_lines(&s).trim().to_string()
}

// ── Rule 1: Strip outer markdown fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\r?\n(.*?)\r?\n```\s*$").unwrap());

pub fn strip_markdown_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Drop repeated title ──────────────────────────────────────────────

static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.*?)\s*#*\s*$").unwrap());

fn drop_repeated_title(input: &str, section_name: &str) -> String {
    let trimmed = input.trim_start();
    let (first, rest) = match trimmed.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (trimmed, ""),
    };
    let repeats = RE_HEADING
        .captures(first)
        .map(|c| {
            c[2].trim_matches(|ch: char| ch == '*' || ch.is_whitespace())
                .eq_ignore_ascii_case(section_name.trim())
        })
        .unwrap_or(false);
    if repeats {
        rest.to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 4: Demote headings ──────────────────────────────────────────────────

fn demote_headings(input: &str) -> String {
    let mut in_code = false;
    input
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_code = !in_code;
                return line.to_string();
            }
            if in_code {
                return line.to_string();
            }
            match RE_HEADING.captures(line) {
                Some(c) if c[1].len() < 3 => format!("### {}", &c[2]),
                _ => line.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Remove foreign image links ───────────────────────────────────────
//
// Charts are attached by the synthesizer using `artifact:` references. Any
// other image link in a model answer points at nothing the renderer can
// resolve, so it is replaced by its alt text in italics.

static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());

fn remove_foreign_images(input: &str) -> String {
    RE_IMAGE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let alt = caps[1].trim();
            if caps[2].trim().starts_with(crate::artifact::ARTIFACT_SCHEME) {
                caps[0].to_string()
            } else if alt.is_empty() {
                String::new()
            } else {
                format!("*{}*", alt)
            }
        })
        .to_string()
}

// ── Rule 6: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 7: Whitespace ───────────────────────────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────────
