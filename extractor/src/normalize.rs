// Recescan
// SPDX-FileCopyrightText: 2026 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Upload validation and canonicalization.
//!
//! Every extraction request passes through [`normalize`] exactly once. It
//! rejects hopeless inputs early and hands every downstream path the same
//! canonical form, so vision and OCR never disagree about what image they saw.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};

use crate::error::ExtractError;

/// Hard cap on upload size.
pub const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;

/// Longest edge of the canonical bitmap. Larger uploads are downscaled, not
/// rejected; receipt text survives 2000px fine and OCR gets faster.
pub const MAX_CANONICAL_DIMENSION: u32 = 2000;

/// Quality for JPEG re-encodes of downscaled bitmaps.
pub const JPEG_QUALITY: u8 = 80;

/// The canonical form of one upload.
///
/// `image` is `None` only for pass-through inputs (HEIC) that no local decoder
/// handles; the vision path can still try them, the OCR path cannot.
#[derive(Debug, Clone)]
pub struct CanonicalImage {
    pub bytes: Vec<u8>,
    pub image: Option<DynamicImage>,
    pub extension: &'static str,
}

impl CanonicalImage {
    pub fn decoded(&self) -> Option<&DynamicImage> {
        self.image.as_ref()
    }
}

/// ISO base media sniff. HEIC/HEIF containers carry `ftyp` at offset 4.
pub fn looks_like_heic(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[4..8] == b"ftyp"
}

/// Validate raw upload bytes and produce the canonical image.
///
/// Oversized bitmaps come back downscaled and re-encoded as JPEG; everything
/// else keeps its original bytes. Undecodable non-HEIC data is rejected.
pub fn normalize(bytes: &[u8]) -> Result<CanonicalImage, ExtractError> {
    if bytes.is_empty() {
        return Err(ExtractError::InvalidImage {
            reason: "empty image data".to_string(),
        });
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ExtractError::InvalidImage {
            reason: format!(
                "image is {} bytes, limit is {} bytes",
                bytes.len(),
                MAX_IMAGE_BYTES
            ),
        });
    }

    if looks_like_heic(bytes) {
        log::warn!("HEIC/HEIF upload passed through without decoding; OCR will be skipped");
        return Ok(CanonicalImage {
            bytes: bytes.to_vec(),
            image: None,
            extension: "heic",
        });
    }

    let format = image::guess_format(bytes).map_err(|_| ExtractError::InvalidImage {
        reason: "unrecognized image format".to_string(),
    })?;
    let extension = extension_for(format).ok_or_else(|| ExtractError::InvalidImage {
        reason: format!("unsupported image format: {format:?}"),
    })?;
    let decoded = image::load_from_memory(bytes).map_err(|err| ExtractError::InvalidImage {
        reason: format!("failed to decode {extension} data: {err}"),
    })?;

    let (width, height) = decoded.dimensions();
    if width > MAX_CANONICAL_DIMENSION || height > MAX_CANONICAL_DIMENSION {
        log::info!(
            "downscaling {width}x{height} upload to fit {MAX_CANONICAL_DIMENSION}px"
        );
        let resized = decoded.resize(
            MAX_CANONICAL_DIMENSION,
            MAX_CANONICAL_DIMENSION,
            FilterType::Lanczos3,
        );
        let jpeg = encode_jpeg(&resized).map_err(|err| ExtractError::InvalidImage {
            reason: format!("failed to re-encode downscaled image: {err}"),
        })?;
        return Ok(CanonicalImage {
            bytes: jpeg,
            image: Some(resized),
            extension: "jpg",
        });
    }

    Ok(CanonicalImage {
        bytes: bytes.to_vec(),
        image: Some(decoded),
        extension,
    })
}

/// JPEG-encode a bitmap at [`JPEG_QUALITY`], flattening alpha first since the
/// JPEG encoder only takes opaque pixels.
pub fn encode_jpeg(image: &DynamicImage) -> anyhow::Result<Vec<u8>> {
    let mut buf = std::io::Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
    let opaque = DynamicImage::ImageRgb8(image.to_rgb8());
    opaque.write_with_encoder(encoder)?;
    Ok(buf.into_inner())
}

fn extension_for(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Jpeg => Some("jpg"),
        ImageFormat::Png => Some("png"),
        ImageFormat::WebP => Some("webp"),
        ImageFormat::Bmp => Some("bmp"),
        ImageFormat::Tiff => Some("tif"),
        ImageFormat::Gif => Some("gif"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([250, 250, 250]));
        let mut buf = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_rejects_empty_input() {
        let err = normalize(&[]).unwrap_err();
        assert!(matches!(err, ExtractError::InvalidImage { .. }));
    }

    #[test]
    fn test_rejects_oversized_input() {
        let blob = vec![0u8; MAX_IMAGE_BYTES + 1];
        let err = normalize(&blob).unwrap_err();
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn test_rejects_unrecognized_bytes() {
        let err = normalize(b"definitely not an image").unwrap_err();
        assert!(matches!(err, ExtractError::InvalidImage { .. }));
    }

    #[test]
    fn test_rejects_truncated_png() {
        // Valid magic followed by garbage: the format sniff passes, decoding
        // must not.
        let mut bytes = png_bytes(16, 16);
        bytes.truncate(24);
        let err = normalize(&bytes).unwrap_err();
        assert!(matches!(err, ExtractError::InvalidImage { .. }));
    }

    #[test]
    fn test_small_png_passes_through_unchanged() {
        let bytes = png_bytes(32, 24);
        let canonical = normalize(&bytes).unwrap();
        assert_eq!(canonical.bytes, bytes);
        assert_eq!(canonical.extension, "png");
        assert!(canonical.decoded().is_some());
    }

    #[test]
    fn test_oversized_bitmap_is_downscaled() {
        let bytes = png_bytes(2400, 120);
        let canonical = normalize(&bytes).unwrap();
        assert_eq!(canonical.extension, "jpg");
        let decoded = canonical.decoded().unwrap();
        let (w, h) = decoded.dimensions();
        assert!(w <= MAX_CANONICAL_DIMENSION && h <= MAX_CANONICAL_DIMENSION);
        // Re-encoded payload must itself decode.
        assert!(image::load_from_memory(&canonical.bytes).is_ok());
    }

    #[test]
    fn test_heic_passes_through_undecoded() {
        let mut bytes = vec![0u8; 32];
        bytes[4..8].copy_from_slice(b"ftyp");
        bytes[8..12].copy_from_slice(b"heic");
        let canonical = normalize(&bytes).unwrap();
        assert_eq!(canonical.extension, "heic");
        assert!(canonical.decoded().is_none());
        assert_eq!(canonical.bytes, bytes);
    }
}
