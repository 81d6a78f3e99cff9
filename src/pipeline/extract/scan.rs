//! Scanned pages and photos (PNG, JPEG, TIFF, BMP, GIF, WEBP).
//!
//! The image itself is kept as an artifact; its text comes from OCR.

use super::{ExtractContext, ExtractionStrategy};
use crate::artifact::ArtifactKind;
use crate::document::{ContentNode, DocumentKind, ExtractedDocument, Provenance};
use crate::error::{ReportError, SectionError};
use crate::pipeline::encode::png_bytes;
use async_trait::async_trait;
use image::imageops::FilterType;
use tracing::{debug, info};

pub struct ImageExtractor;

#[async_trait]
impl ExtractionStrategy for ImageExtractor {
    fn name(&self) -> &'static str {
        "image-ocr"
    }

    fn kind(&self) -> DocumentKind {
        DocumentKind::Image
    }

    async fn extract(&self, bytes: &[u8], ctx: &ExtractContext) -> Result<ExtractedDocument, ReportError> {
        let owned = bytes.to_vec();
        let max_px = ctx.options.max_rendered_pixels;
        let (original, for_ocr) = tokio::task::spawn_blocking(move || {
            let img = image::load_from_memory(&owned).map_err(|e| ReportError::ExtractionFailure {
                kind: DocumentKind::Image.as_str().into(),
                detail: format!("image could not be decoded: {e}"),
            })?;
            debug!("decoded {}x{} image", img.width(), img.height());
            let scaled = if img.width() > max_px || img.height() > max_px {
                img.resize(max_px, max_px, FilterType::Triangle)
            } else {
                img.clone()
            };
            let encode = |i: &image::DynamicImage| {
                png_bytes(i).map_err(|e| ReportError::Internal(format!("PNG encoding failed: {e}")))
            };
            Ok::<_, ReportError>((encode(&img)?, encode(&scaled)?))
        })
        .await
        .map_err(|e| ReportError::Internal(format!("Image task panicked: {e}")))??;

        let mut doc = ExtractedDocument {
            unit_count: 1,
            ..Default::default()
        };
        let id = ctx.store.register(ArtifactKind::ExtractedImage, "image/png", original);
        doc.nodes.push(ContentNode::image(Provenance::unit(1, 0), id, None));

        let Some(ocr) = ctx.ocr.as_ref() else {
            doc.warnings.push("image input without an OCR engine yields no text".into());
            return Ok(doc);
        };
        info!("Running OCR with {}", ocr.name());
        match ocr.recognize(&for_ocr, &ctx.cancel).await {
            Ok(text) if !text.trim().is_empty() => {
                doc.nodes.push(ContentNode::text(Provenance::unit(1, 1), text));
            }
            Ok(_) => doc.warnings.push("OCR found no legible text".into()),
            Err(SectionError::Cancelled) => {
                return Err(ReportError::Cancelled {
                    stage: "extracting".into(),
                })
            }
            Err(e) => doc.warnings.push(format!("OCR failed: {e}")),
        }
        Ok(doc)
    }
}
