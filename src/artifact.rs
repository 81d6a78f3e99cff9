//! Job-scoped, append-only store for binary assets (extracted images, charts).
//!
//! Artifacts are referenced from report markdown as `artifact:<id>`, never
//! by filesystem path, so the HTTP boundary can map them to download URLs
//! and the PDF renderer can resolve them to bytes.
//!
//! Ids are content-addressed inside a job: `<job prefix>-<sha256 prefix>`.
//! Registering the same bytes twice returns the existing id, and an existing
//! id is never overwritten, so concurrent chart/image registration needs no
//! coordination beyond the map lock.

use crate::error::ReportError;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// URI scheme used for artifact references inside markdown.
pub const ARTIFACT_SCHEME: &str = "artifact:";

/// Opaque artifact identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `artifact:<id>`, the form embedded in markdown.
    pub fn reference(&self) -> String {
        format!("{ARTIFACT_SCHEME}{}", self.0)
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    ExtractedImage,
    Chart,
}

/// A stored binary asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub job_id: String,
    pub kind: ArtifactKind,
    pub media_type: String,
    #[serde(skip)]
    pub bytes: Arc<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// File extension matching the media type.
    pub fn extension(&self) -> &'static str {
        match self.media_type.as_str() {
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "application/pdf" => "pdf",
            _ => "bin",
        }
    }
}

/// Per-job artifact store.
#[derive(Debug)]
pub struct ArtifactStore {
    job_id: String,
    prefix: String,
    entries: RwLock<HashMap<ArtifactId, Artifact>>,
    order: RwLock<Vec<ArtifactId>>,
}

impl ArtifactStore {
    pub fn new(job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        let prefix: String = job_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect();
        Self {
            job_id,
            prefix,
            entries: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Register bytes and return their id. Identical bytes of the same kind
    /// map to the same id; an existing artifact is never replaced.
    pub fn register(
        &self,
        kind: ArtifactKind,
        media_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> ArtifactId {
        let digest = Sha256::digest(&bytes);
        let tag = match kind {
            ArtifactKind::ExtractedImage => "img",
            ArtifactKind::Chart => "chart",
        };
        let id = ArtifactId::new(format!(
            "{}-{}-{}",
            self.prefix,
            tag,
            &hex::encode(digest)[..16]
        ));

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&id) {
            debug!(artifact = %id, "artifact already registered");
            return id;
        }
        let artifact = Artifact {
            id: id.clone(),
            job_id: self.job_id.clone(),
            kind,
            media_type: media_type.into(),
            bytes: Arc::new(bytes),
            created_at: Utc::now(),
        };
        debug!(artifact = %id, bytes = artifact.bytes.len(), "registered artifact");
        entries.insert(id.clone(), artifact);
        self.order
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(id.clone());
        id
    }

    pub fn get(&self, id: &ArtifactId) -> Option<Artifact> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn get_str(&self, id: &str) -> Option<Artifact> {
        self.get(&ArtifactId::new(id))
    }

    pub fn contains(&self, id: &ArtifactId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Artifacts in registration order.
    pub fn list(&self) -> Vec<Artifact> {
        let order = self.order.read().unwrap_or_else(|e| e.into_inner());
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        order.iter().filter_map(|id| entries.get(id).cloned()).collect()
    }

    pub fn list_kind(&self, kind: ArtifactKind) -> Vec<Artifact> {
        self.list().into_iter().filter(|a| a.kind == kind).collect()
    }

    /// Write every artifact into `dir` as `<id>.<ext>`, atomically per file.
    pub async fn persist(&self, dir: &Path) -> Result<Vec<PathBuf>, ReportError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ReportError::OutputWriteFailed {
                path: dir.to_path_buf(),
                source: e,
            })?;
        let mut written = Vec::new();
        for artifact in self.list() {
            let path = dir.join(format!("{}.{}", artifact.id, artifact.extension()));
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, artifact.bytes.as_slice())
                .await
                .map_err(|e| ReportError::OutputWriteFailed {
                    path: path.clone(),
                    source: e,
                })?;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| ReportError::OutputWriteFailed {
                    path: path.clone(),
                    source: e,
                })?;
            written.push(path);
        }
        Ok(written)
    }
}

static RE_ARTIFACT_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"artifact:([A-Za-z0-9][A-Za-z0-9_\-]*)").unwrap());

/// Every `artifact:<id>` reference in `markdown`, in order of appearance,
/// without duplicates.
pub fn artifact_refs(markdown: &str) -> Vec<ArtifactId> {
    let mut seen = Vec::new();
    for caps in RE_ARTIFACT_REF.captures_iter(markdown) {
        let id = ArtifactId::new(&caps[1]);
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

/// Rewrite `artifact:<id>` references to `<base>/artifacts/<id>` fetchable
/// URLs. This is the boundary's job; the core only ever emits opaque ids.
pub fn rewrite_artifact_links(markdown: &str, base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    RE_ARTIFACT_REF
        .replace_all(markdown, |caps: &regex::Captures<'_>| {
            format!("{base}/artifacts/{}", &caps[1])
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_content_addressed_and_append_only() {
        let store = ArtifactStore::new("3f2a9c1e-0000-4000-8000-000000000000");
        let a = store.register(ArtifactKind::Chart, "image/png", vec![1, 2, 3]);
        let b = store.register(ArtifactKind::Chart, "image/png", vec![1, 2, 3]);
        let c = store.register(ArtifactKind::Chart, "image/png", vec![4, 5, 6]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(store.len(), 2);
        assert!(a.as_str().starts_with("3f2a9c1e-chart-"));
        assert_eq!(store.get(&a).unwrap().bytes.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn refs_are_extracted_in_order() {
        let md = "![a](artifact:job1-chart-aa) text ![b](artifact:job1-img-bb) ![a](artifact:job1-chart-aa)";
        let refs = artifact_refs(md);
        assert_eq!(
            refs,
            vec![ArtifactId::new("job1-chart-aa"), ArtifactId::new("job1-img-bb")]
        );
    }

    #[test]
    fn rewrite_links_to_boundary_urls() {
        let md = "![Revenue](artifact:abc-chart-01)";
        let out = rewrite_artifact_links(md, "https://reports.example.com/");
        assert_eq!(
            out,
            "![Revenue](https://reports.example.com/artifacts/abc-chart-01)"
        );
    }

    #[tokio::test]
    async fn persist_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new("job");
        let id = store.register(ArtifactKind::ExtractedImage, "image/png", vec![9; 10]);
        let written = store.persist(dir.path()).await.unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].ends_with(format!("{id}.png")));
        assert_eq!(std::fs::read(&written[0]).unwrap(), vec![9; 10]);
    }
}
