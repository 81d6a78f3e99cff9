//! Embedding indexer: chunks → an in-memory, job-scoped similarity index.
//!
//! Two backends implement [`EmbeddingBackend`]:
//! - **[`ProviderEmbedder`]** wraps any `edgequake_llm` embedding provider
//!   (OpenAI, Gemini, Ollama, …).
//! - **[`HashingEmbedder`]** is a deterministic feature-hashing embedder with
//!   no network access, used for offline runs and tests.
//!
//! Batches are embedded concurrently but the index keeps chunk order, and it
//! is complete before the first retrieval runs.

use crate::error::ReportError;
use crate::pipeline::chunk::Chunk;
use async_trait::async_trait;
use edgequake_llm::EmbeddingProvider;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Turns texts into vectors.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn name(&self) -> &str;

    /// One vector per input, same order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ReportError>;
}

/// [`EmbeddingBackend`] over an `edgequake_llm` embedding provider.
pub struct ProviderEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl EmbeddingBackend for ProviderEmbedder {
    fn name(&self) -> &str {
        "edgequake-llm"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ReportError> {
        self.provider
            .embed(texts)
            .await
            .map_err(|e| ReportError::IndexingFailure {
                detail: format!("embedding provider error: {e}"),
            })
    }
}

/// Feature-hashing bag of words and word bigrams, L2-normalised.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();
        for t in &tokens {
            self.add(&mut v, t.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.add(&mut v, bigram.as_bytes(), 0.5);
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }

    fn add(&self, v: &mut [f32], feature: &[u8], weight: f32) {
        let h = fnv1a(feature);
        let idx = (h % self.dim as u64) as usize;
        let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        v[idx] += sign * weight;
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

#[async_trait]
impl EmbeddingBackend for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ReportError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// A chunk and its vector.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Ephemeral similarity index for one job.
pub struct SearchIndex {
    entries: Vec<IndexedChunk>,
    dim: usize,
    embedder: Arc<dyn EmbeddingBackend>,
}

impl std::fmt::Debug for SearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndex")
            .field("entries", &self.entries.len())
            .field("dim", &self.dim)
            .field("embedder", &self.embedder.name())
            .finish()
    }
}

impl SearchIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn entries(&self) -> &[IndexedChunk] {
        &self.entries
    }

    /// Embed a query with the backend that built the index.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>, ReportError> {
        let mut vectors = self.embedder.embed(&[query.to_string()]).await?;
        let v = vectors.pop().ok_or_else(|| ReportError::IndexingFailure {
            detail: "embedding backend returned no vector for the query".into(),
        })?;
        if v.len() != self.dim {
            return Err(ReportError::IndexingFailure {
                detail: format!("query vector has dimension {}, index has {}", v.len(), self.dim),
            });
        }
        Ok(v)
    }
}

/// Embed `chunks` and build the index.
///
/// Chunks with identical text are indexed once (first occurrence wins).
/// Any backend error, count mismatch or dimension mismatch is an
/// `IndexingFailure`.
pub async fn index(
    chunks: Vec<Chunk>,
    embedder: Arc<dyn EmbeddingBackend>,
    batch_size: usize,
    concurrency: usize,
) -> Result<SearchIndex, ReportError> {
    let mut seen = HashSet::new();
    let unique: Vec<Chunk> = chunks
        .into_iter()
        .filter(|c| seen.insert(c.hash.clone()))
        .collect();
    if unique.is_empty() {
        return Err(ReportError::IndexingFailure {
            detail: "no chunks to index".into(),
        });
    }

    let batches: Vec<Vec<String>> = unique
        .chunks(batch_size.max(1))
        .map(|b| b.iter().map(|c| c.text.clone()).collect())
        .collect();
    info!(
        "Embedding {} chunks in {} batch(es) via {}",
        unique.len(),
        batches.len(),
        embedder.name()
    );

    let vectors: Vec<Vec<Vec<f32>>> = stream::iter(batches.into_iter().enumerate().map(|(i, texts)| {
        let embedder = Arc::clone(&embedder);
        async move {
            let out = embedder.embed(&texts).await?;
            if out.len() != texts.len() {
                return Err(ReportError::IndexingFailure {
                    detail: format!("batch {i}: {} texts but {} vectors", texts.len(), out.len()),
                });
            }
            debug!("batch {i}: {} vectors", out.len());
            Ok(out)
        }
    }))
    .buffered(concurrency.max(1))
    .try_collect()
    .await?;

    let vectors: Vec<Vec<f32>> = vectors.into_iter().flatten().collect();
    let dim = vectors.first().map(Vec::len).unwrap_or(0);
    if dim == 0 {
        return Err(ReportError::IndexingFailure {
            detail: "embedding backend returned empty vectors".into(),
        });
    }
    if let Some(bad) = vectors.iter().position(|v| v.len() != dim || v.iter().any(|x| !x.is_finite())) {
        return Err(ReportError::IndexingFailure {
            detail: format!("vector {bad} is malformed (expected {dim} finite components)"),
        });
    }

    let entries = unique
        .into_iter()
        .zip(vectors)
        .map(|(chunk, vector)| IndexedChunk { chunk, vector })
        .collect();
    Ok(SearchIndex {
        entries,
        dim,
        embedder,
    })
}

/// Cosine similarity; 0.0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
