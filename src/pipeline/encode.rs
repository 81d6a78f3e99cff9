//! Image encoding for the two places images leave the process: PNG bytes
//! for the artifact store and base64 `ImageData` for vision model requests.
//!
//! PNG is used everywhere because it is lossless; JPEG artefacts around
//! rendered text hurt OCR accuracy and make chart labels blurry.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode an image as PNG bytes.
pub fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Wrap PNG bytes for a multimodal request.
///
/// `detail: "high"` keeps fine print legible for GPT-4-class models, which
/// otherwise downscale to a single 512 px tile.
pub fn image_data(png: &[u8]) -> ImageData {
    let b64 = STANDARD.encode(png);
    debug!("Encoded image → {} bytes base64", b64.len());
    ImageData::new(b64, "image/png").with_detail("high")
}

/// Rasterised page or scan → request-ready image.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    Ok(image_data(&png_bytes(img)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([0, 90, 200, 255])));
        let png = png_bytes(&img).unwrap();
        assert!(png.starts_with(&[0x89, b'P', b'N', b'G']));

        let data = encode_page(&img).unwrap();
        assert_eq!(data.mime_type, "image/png");
        assert_eq!(STANDARD.decode(&data.data).unwrap(), png);
    }
}
