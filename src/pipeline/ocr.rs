//! OCR for scanned images and image-only PDF pages.
//!
//! OCR engine internals are a black box behind [`OcrEngine`]. The shipped
//! engine, [`VisionOcr`], sends the page as a PNG to a vision-capable model
//! through the same [`LlmGateway`] that writes report sections, so it
//! inherits retry, timeout and cancellation behaviour for free.

use crate::cancel::Cancellation;
use crate::error::SectionError;
use crate::pipeline::encode::image_data;
use crate::pipeline::llm::{LlmGateway, ModelRequest};
use crate::pipeline::postprocess::strip_markdown_fences;
use crate::prompts::{OCR_INSTRUCTION, OCR_PROMPT};
use async_trait::async_trait;
use tracing::debug;

/// Turns an image into text.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Transcribe a PNG. An empty string means no legible text.
    async fn recognize(&self, png: &[u8], cancel: &Cancellation) -> Result<String, SectionError>;
}

/// OCR through a multimodal chat model.
pub struct VisionOcr {
    gateway: LlmGateway,
    max_tokens: usize,
}

impl VisionOcr {
    pub fn new(gateway: LlmGateway, max_tokens: usize) -> Self {
        Self {
            gateway,
            max_tokens: max_tokens.max(256),
        }
    }
}

#[async_trait]
impl OcrEngine for VisionOcr {
    fn name(&self) -> &str {
        "vision-llm"
    }

    async fn recognize(&self, png: &[u8], cancel: &Cancellation) -> Result<String, SectionError> {
        let request = ModelRequest {
            system: OCR_PROMPT.to_string(),
            user: OCR_INSTRUCTION.to_string(),
            images: vec![image_data(png)],
            temperature: 0.0,
            max_tokens: self.max_tokens,
        };
        let generation = self.gateway.generate(&request, cancel).await?;
        debug!(
            "OCR: {} chars in {}ms ({} attempt(s))",
            generation.content.len(),
            generation.duration_ms,
            generation.attempts
        );
        Ok(strip_markdown_fences(&generation.content).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::{BackendError, GatewayPolicy, ModelBackend, ModelReply};
    use std::sync::Arc;

    struct Transcriber;

    #[async_trait]
    impl ModelBackend for Transcriber {
        async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, BackendError> {
            assert_eq!(request.images.len(), 1);
            assert_eq!(request.images[0].mime_type, "image/png");
            Ok(ModelReply {
                content: "```\nINVOICE 42\nTotal: $1,200\n```".into(),
                prompt_tokens: 100,
                completion_tokens: 8,
            })
        }
    }

    #[tokio::test]
    async fn vision_ocr_strips_fences() {
        let gw = LlmGateway::new(
            Arc::new(Transcriber),
            GatewayPolicy {
                max_retries: 0,
                retry_backoff_ms: 1,
                api_timeout_ms: 1_000,
            },
        );
        let ocr = VisionOcr::new(gw, 2048);
        let text = ocr.recognize(b"\x89PNG", &Cancellation::new()).await.unwrap();
        assert_eq!(text, "INVOICE 42\nTotal: $1,200");
    }
}
