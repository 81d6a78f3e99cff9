//! Retriever: top-k chunks for a query by cosine similarity.
//!
//! Ranking is total and deterministic: score descending, then chunk ordinal
//! ascending, so equal scores always favour content earlier in the document.

use crate::error::ReportError;
use crate::pipeline::chunk::{Chunk, ChunkKind};
use crate::pipeline::embed::{cosine_similarity, SearchIndex};
use std::cmp::Ordering;

/// A retrieved chunk with its similarity.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Top `k` chunks for `query`. Returns every chunk when `k` exceeds the
/// index size.
pub async fn retrieve(index: &SearchIndex, query: &str, k: usize) -> Result<Vec<ScoredChunk>, ReportError> {
    let q = index.embed_query(query).await?;
    Ok(rank(index, &q, k, |_| true))
}

/// Like [`retrieve`], restricted to table chunks. Used to pick chart data.
pub async fn retrieve_tables(
    index: &SearchIndex,
    query: &str,
    k: usize,
) -> Result<Vec<ScoredChunk>, ReportError> {
    let q = index.embed_query(query).await?;
    Ok(rank(index, &q, k, |c| c.kind == ChunkKind::Table && c.table.is_some()))
}

/// Rank indexed chunks that pass `filter` against a query vector.
pub fn rank<F>(index: &SearchIndex, query: &[f32], k: usize, filter: F) -> Vec<ScoredChunk>
where
    F: Fn(&Chunk) -> bool,
{
    let mut scored: Vec<(f32, &Chunk)> = index
        .entries()
        .iter()
        .filter(|e| filter(&e.chunk))
        .map(|e| (cosine_similarity(query, &e.vector), &e.chunk))
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then(a.1.ordinal.cmp(&b.1.ordinal))
    });
    scored
        .into_iter()
        .take(k)
        .map(|(score, chunk)| ScoredChunk {
            chunk: chunk.clone(),
            score,
        })
        .collect()
}
