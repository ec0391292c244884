// Recescan
// SPDX-FileCopyrightText: 2026 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Local text recognition.
//!
//! The canonical bitmap is cleaned up, handed to an [`OcrEngine`] under a
//! short ladder of page segmentation modes, and the best-scoring run wins.
//! This module knows nothing about receipts; turning its text into fields is
//! [`crate::heuristics`]' job.

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};

/// Default recognition languages: Japanese receipts with latin fragments.
pub const DEFAULT_OCR_LANG: &str = "jpn+eng";

/// Page segmentation modes tried per image: uniform block, full auto, single
/// column, sparse text.
pub const OCR_PSM_LADDER: &[&str] = &["6", "3", "4", "11"];

/// Preprocessing toggles. Each stage can be skipped on its own; some
/// receipts read better without one.
#[derive(Debug, Clone, Copy)]
pub struct OcrPreprocessConfig {
    pub grayscale: bool,
    pub denoise: bool,
    pub contrast: bool,
    pub binarize: bool,
}

impl Default for OcrPreprocessConfig {
    fn default() -> Self {
        Self {
            grayscale: true,
            denoise: true,
            contrast: true,
            binarize: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub lang: String,
    pub preprocess: OcrPreprocessConfig,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            lang: DEFAULT_OCR_LANG.to_string(),
            preprocess: OcrPreprocessConfig::default(),
        }
    }
}

/// Raw result of one recognition run.
#[derive(Debug, Clone, Default)]
pub struct OcrOutput {
    pub text: String,
    /// Engine-reported mean confidence in `[0.0, 1.0]`; 0 when unknown.
    pub confidence: f64,
}

/// A text recognition backend.
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// False when the backend cannot run at all (missing native libraries,
    /// missing language data). Callers skip recognition entirely then.
    fn available(&self) -> bool;

    /// Recognize text in a PNG-encoded bitmap. `psm` is the page segmentation
    /// hint handed to the engine.
    fn recognize(&self, png: &[u8], psm: &str) -> anyhow::Result<OcrOutput>;
}

#[cfg(feature = "ocr")]
mod engine {
    use anyhow::Context as _;
    use leptess::{LepTess, Variable};

    use super::{OcrEngine, OcrOutput};

    /// Tesseract-backed engine. A fresh `LepTess` per call keeps the engine
    /// `Sync` without locking.
    pub struct TesseractEngine {
        lang: String,
        available: bool,
    }

    impl TesseractEngine {
        pub fn new(lang: &str) -> Self {
            let available = match LepTess::new(None, lang) {
                Ok(_) => true,
                Err(err) => {
                    log::warn!("tesseract initialization failed for '{lang}': {err}");
                    false
                }
            };
            Self {
                lang: lang.to_string(),
                available,
            }
        }
    }

    impl OcrEngine for TesseractEngine {
        fn name(&self) -> &'static str {
            "tesseract"
        }

        fn available(&self) -> bool {
            self.available
        }

        fn recognize(&self, png: &[u8], psm: &str) -> anyhow::Result<OcrOutput> {
            let mut engine = LepTess::new(None, &self.lang)
                .with_context(|| format!("failed to initialize tesseract for '{}'", self.lang))?;
            engine
                .set_variable(Variable::TesseditPagesegMode, psm)
                .context("failed to set page segmentation mode")?;
            engine
                .set_image_from_mem(png)
                .context("failed to load bitmap into tesseract")?;
            let text = engine
                .get_utf8_text()
                .context("tesseract returned undecodable text")?;
            let confidence = f64::from(engine.mean_text_conf().max(0)) / 100.0;
            Ok(OcrOutput { text, confidence })
        }
    }
}

#[cfg(not(feature = "ocr"))]
mod engine {
    use super::{OcrEngine, OcrOutput};

    /// Compiled-out engine. Reports itself unavailable so the pipeline
    /// degrades the OCR path instead of erroring.
    pub struct TesseractEngine {
        lang: String,
    }

    impl TesseractEngine {
        pub fn new(lang: &str) -> Self {
            Self {
                lang: lang.to_string(),
            }
        }
    }

    impl OcrEngine for TesseractEngine {
        fn name(&self) -> &'static str {
            "tesseract(stub)"
        }

        fn available(&self) -> bool {
            false
        }

        fn recognize(&self, _png: &[u8], _psm: &str) -> anyhow::Result<OcrOutput> {
            anyhow::bail!(
                "tesseract support for '{}' is not compiled in (enable the `ocr` feature)",
                self.lang
            )
        }
    }
}

pub use engine::TesseractEngine;

/// Run recognition over the canonical bitmap and keep the best result.
///
/// Runs are ranked by [`text_quality_score`], ties broken by engine-reported
/// confidence. An unavailable engine or an all-empty ladder yields the empty
/// output rather than an error.
pub fn run_ocr(engine: &dyn OcrEngine, image: &DynamicImage, config: &OcrConfig) -> OcrOutput {
    if !engine.available() {
        log::warn!(
            "ocr engine '{}' unavailable, skipping text recognition",
            engine.name()
        );
        return OcrOutput::default();
    }

    let prepared = preprocess(image, &config.preprocess);
    let png = match encode_png(&prepared) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::warn!("failed to encode preprocessed bitmap: {err:#}");
            return OcrOutput::default();
        }
    };

    let mut best = OcrOutput::default();
    let mut best_score = 0.0f64;
    for psm in OCR_PSM_LADDER {
        let output = match engine.recognize(&png, psm) {
            Ok(output) => output,
            Err(err) => {
                log::warn!("ocr run failed (psm {psm}): {err:#}");
                continue;
            }
        };
        let score = text_quality_score(&output.text);
        log::debug!(
            "ocr psm {psm}: quality {score:.3}, engine confidence {:.2}",
            output.confidence
        );
        if score > best_score || (score == best_score && output.confidence > best.confidence) {
            best_score = score;
            best = output;
        }
    }

    if best.text.trim().is_empty() {
        log::info!("ocr produced no usable text");
    }
    best
}

/// Clean the bitmap up for recognition: the configured subset of luma
/// conversion, 3x3 median denoise, linear contrast stretch and Otsu
/// binarization. With grayscale off the remaining stages run per color
/// channel and the engine gets color input.
pub fn preprocess(image: &DynamicImage, config: &OcrPreprocessConfig) -> DynamicImage {
    if config.grayscale {
        let mut gray = image.to_luma8();
        if config.denoise {
            gray = median_denoise(&gray);
        }
        if config.contrast {
            gray = stretch_contrast(&gray);
        }
        if config.binarize {
            gray = otsu_threshold(&gray);
        }
        DynamicImage::ImageLuma8(gray)
    } else {
        let mut rgb = image.to_rgb8();
        if config.denoise {
            rgb = per_channel(&rgb, median_denoise);
        }
        if config.contrast {
            rgb = per_channel(&rgb, stretch_contrast);
        }
        if config.binarize {
            rgb = per_channel(&rgb, otsu_threshold);
        }
        DynamicImage::ImageRgb8(rgb)
    }
}

/// Run a single-plane stage over each color channel independently.
fn per_channel(image: &RgbImage, stage: fn(&GrayImage) -> GrayImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut out = image.clone();
    for channel in 0..3usize {
        let plane = GrayImage::from_fn(width, height, |x, y| {
            image::Luma([image.get_pixel(x, y)[channel]])
        });
        let staged = stage(&plane);
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            pixel[channel] = staged.get_pixel(x, y)[0];
        }
    }
    out
}

/// Score recognized text in `[0.0, 1.0]` on volume, line structure and the
/// share of readable characters. Receipts are short, so the volume targets
/// are modest.
pub fn text_quality_score(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }

    let char_count = trimmed.chars().count();
    let line_count = trimmed.lines().filter(|l| !l.trim().is_empty()).count();
    let length_score = (char_count as f64 / 600.0).min(1.0);
    let line_score = (line_count as f64 / 25.0).min(1.0);

    let mut visible = 0usize;
    let mut readable = 0usize;
    for ch in trimmed.chars().filter(|c| !c.is_whitespace()) {
        visible += 1;
        if ch.is_alphanumeric() || ch.is_ascii_punctuation() || matches!(ch, '¥' | '￥') {
            readable += 1;
        }
    }
    let readable_ratio = if visible == 0 {
        0.0
    } else {
        readable as f64 / visible as f64
    };

    let score = length_score * 0.5 + line_score * 0.25 + readable_ratio * 0.25;
    (score * 1000.0).round() / 1000.0
}

fn encode_png(image: &DynamicImage) -> anyhow::Result<Vec<u8>> {
    let mut buf = std::io::Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

/// 3x3 median filter. Cheap salt-and-pepper removal for camera shots.
fn median_denoise(image: &GrayImage) -> GrayImage {
    let (width, height) = image.dimensions();
    if width < 3 || height < 3 {
        return image.clone();
    }
    let mut out = image.clone();
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut window = [0u8; 9];
            let mut i = 0;
            for dy in 0..3u32 {
                for dx in 0..3u32 {
                    window[i] = image.get_pixel(x + dx - 1, y + dy - 1)[0];
                    i += 1;
                }
            }
            window.sort_unstable();
            out.put_pixel(x, y, image::Luma([window[4]]));
        }
    }
    out
}

/// Linear min-max stretch to the full value range.
fn stretch_contrast(image: &GrayImage) -> GrayImage {
    let mut lo = u8::MAX;
    let mut hi = u8::MIN;
    for p in image.pixels() {
        lo = lo.min(p[0]);
        hi = hi.max(p[0]);
    }
    if lo >= hi {
        return image.clone();
    }
    let range = f64::from(hi - lo);
    let mut out = image.clone();
    for p in out.pixels_mut() {
        p[0] = ((f64::from(p[0] - lo) / range) * 255.0).round() as u8;
    }
    out
}

/// Global Otsu threshold: pick the cut that maximizes between-class variance,
/// then binarize.
fn otsu_threshold(image: &GrayImage) -> GrayImage {
    let mut histogram = [0u64; 256];
    for p in image.pixels() {
        histogram[p[0] as usize] += 1;
    }
    let total = u64::from(image.width()) * u64::from(image.height());
    if total == 0 {
        return image.clone();
    }

    let sum_all: f64 = histogram
        .iter()
        .enumerate()
        .map(|(value, count)| value as f64 * *count as f64)
        .sum();
    let mut sum_bg = 0.0f64;
    let mut weight_bg = 0u64;
    let mut best_threshold = 0u8;
    let mut best_variance = 0.0f64;
    for t in 0..256usize {
        weight_bg += histogram[t];
        if weight_bg == 0 {
            continue;
        }
        let weight_fg = total - weight_bg;
        if weight_fg == 0 {
            break;
        }
        sum_bg += t as f64 * histogram[t] as f64;
        let mean_bg = sum_bg / weight_bg as f64;
        let mean_fg = (sum_all - sum_bg) / weight_fg as f64;
        let variance = weight_bg as f64 * weight_fg as f64 * (mean_bg - mean_fg).powi(2);
        if variance > best_variance {
            best_variance = variance;
            best_threshold = t as u8;
        }
    }

    let mut out = image.clone();
    for p in out.pixels_mut() {
        p[0] = if p[0] > best_threshold { 255 } else { 0 };
    }
    out
}
