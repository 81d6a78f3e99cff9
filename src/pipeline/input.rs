//! Input resolution: normalise a user-supplied path or URL to raw bytes.
//!
//! Every extractor works from an in-memory byte slice (pdfium included, via
//! `load_pdf_from_byte_slice`), so URLs are downloaded straight into memory
//! and no temp file is needed. The declared type comes from the HTTP
//! `Content-Type` header for URLs and from the file extension otherwise.

use crate::error::ReportError;
use std::path::PathBuf;
use tracing::{debug, info};

/// A document ready for extraction.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub bytes: Vec<u8>,
    /// File name used for extension-based type detection and output naming.
    pub name: String,
    /// MIME type as declared by the origin, if any.
    pub declared_type: Option<String>,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to document bytes.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<SourceDocument, ReportError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(input).await
    }
}

async fn resolve_local(path_str: &str) -> Result<SourceDocument, ReportError> {
    let path = PathBuf::from(path_str);
    let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => ReportError::PermissionDenied { path: path.clone() },
        _ => ReportError::FileNotFound { path: path.clone() },
    })?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path_str.to_string());
    debug!("Read local document {} ({} bytes)", path.display(), bytes.len());
    Ok(SourceDocument {
        bytes,
        name,
        declared_type: None,
    })
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<SourceDocument, ReportError> {
    info!("Downloading document from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ReportError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let map_err = |e: reqwest::Error| {
        if e.is_timeout() {
            ReportError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            ReportError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };

    let response = client.get(url).send().await.map_err(map_err)?;
    if !response.status().is_success() {
        return Err(ReportError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let declared_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let disposition = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let name = extract_filename(url, disposition.as_deref());

    let bytes = response.bytes().await.map_err(map_err)?.to_vec();
    info!("Downloaded {} ({} bytes)", name, bytes.len());

    Ok(SourceDocument {
        bytes,
        name,
        declared_type,
    })
}

/// File name from `Content-Disposition`, else the last URL path segment,
/// else `"download"`.
fn extract_filename(url: &str, content_disposition: Option<&str>) -> String {
    if let Some(cd) = content_disposition {
        if let Some(pos) = cd.find("filename=") {
            let name = cd[pos + "filename=".len()..]
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .trim_matches('"');
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }

    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    "download".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn test_extract_filename() {
        assert_eq!(extract_filename("https://x.io/files/q3.xlsx?sig=1", None), "q3.xlsx");
        assert_eq!(
            extract_filename("https://x.io/dl", Some("attachment; filename=\"sales.csv\"")),
            "sales.csv"
        );
        assert_eq!(extract_filename("https://x.io/dl", None), "download");
    }

    #[tokio::test]
    async fn missing_local_file() {
        let err = resolve_input("/definitely/not/here.pdf", 5).await.unwrap_err();
        assert!(matches!(err, ReportError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn local_file_keeps_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sales.csv");
        std::fs::write(&path, "month,revenue\nJan,1\n").unwrap();
        let doc = resolve_input(path.to_str().unwrap(), 5).await.unwrap();
        assert_eq!(doc.name, "sales.csv");
        assert!(doc.declared_type.is_none());
        assert_eq!(doc.bytes.len(), 20);
    }
}
