//! Prompts for grounded section synthesis and OCR.
//!
//! Every prompt lives here so a change in wording is a one-file edit and
//! tests can inspect exactly what the model sees.
//!
//! Callers can override the section system prompt via
//! [`crate::config::ReportConfig::system_prompt`]; the constants here are
//! used only when no override is provided.

use crate::config::SectionSpec;
use crate::document::DocumentKind;
use crate::pipeline::retrieve::ScoredChunk;

/// Phrase the model must use when the context cannot support a section.
/// Degraded placeholders reuse it so readers see one wording.
pub const INSUFFICIENT_CONTEXT: &str = "Insufficient grounded context available";

/// Default system prompt for writing one report section.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a senior business analyst writing one section of a strategic report about a single source document.

Follow these rules precisely:

1. GROUNDING
   - Use ONLY the numbered context excerpts supplied by the user
   - Every figure, name, and claim must come from an excerpt
   - Cite excerpts inline with their tag, e.g. [S1] or [S2, S3]
   - Never invent numbers, trends, or comparisons that the excerpts do not state

2. INSUFFICIENT CONTEXT
   - If the excerpts cannot support the section goal, reply with exactly:
     Insufficient grounded context available.
   - Do not pad the section with generic advice

3. STRUCTURE
   - Do NOT repeat the section title; it is added for you
   - Use ### for sub-headings if needed, never # or ##
   - Prefer short paragraphs and - bullet lists
   - Markdown pipe tables are allowed when comparing figures

4. OUTPUT FORMAT
   - Output ONLY the Markdown body of the section
   - Do NOT wrap in ```markdown fences
   - Do NOT include images or links; charts are attached separately"#;

/// System prompt for transcribing a scanned page or image.
pub const OCR_PROMPT: &str = r#"You are an OCR engine. Transcribe all legible text in the image exactly as written, in natural reading order.

- Keep line breaks between paragraphs
- Render tables as Markdown pipe tables with the header row first
- Do not describe the image, summarise, or add commentary
- If the image contains no legible text, output nothing"#;

/// User message for the OCR call.
pub const OCR_INSTRUCTION: &str = "Transcribe the text in this image.";

/// Body used when a section could not be generated.
pub fn degraded_placeholder(reason: &str) -> String {
    format!("_{INSUFFICIENT_CONTEXT}: {}._", reason.trim().trim_end_matches('.'))
}

/// Build the user message for one section.
///
/// Excerpts are numbered `S1..Sn` in ranking order and tagged with their
/// provenance so the model can cite them, e.g. `[S1 | page 2]`.
pub fn build_section_prompt(
    section: &SectionSpec,
    context: &[ScoredChunk],
    kind: DocumentKind,
    document_title: Option<&str>,
) -> String {
    let mut out = String::new();
    if let Some(title) = document_title {
        out.push_str(&format!("Document: {title}\n"));
    }
    out.push_str(&format!("Section: {}\n", section.name));
    out.push_str(&format!("Goal: {}\n\n", section.goal));

    if context.is_empty() {
        out.push_str("Context excerpts: none were found.\n");
    } else {
        out.push_str("Context excerpts:\n\n");
        for (i, hit) in context.iter().enumerate() {
            out.push_str(&format!("[S{} | {}]\n", i + 1, provenance_tag(hit, kind)));
            out.push_str(hit.chunk.text.trim());
            out.push_str("\n\n");
        }
    }
    out.push_str(&format!(
        "Write the \"{}\" section using only these excerpts.",
        section.name
    ));
    out
}

/// Citation label for a chunk: its first provenance entry, plus a count when
/// it spans several.
pub fn provenance_tag(hit: &ScoredChunk, kind: DocumentKind) -> String {
    match hit.chunk.provenance.as_slice() {
        [] => kind.unit_name().to_string(),
        [only] => only.tag(kind),
        [first, rest @ ..] => format!("{} (+{} more)", first.tag(kind), rest.len()),
    }
}
