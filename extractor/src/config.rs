// Recescan
// SPDX-FileCopyrightText: 2026 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Extractor configuration.
//!
//! Everything is injected at construction; nothing in the crate reads the
//! environment after [`ExtractorConfig::from_env`] returns.

use std::time::Duration;

use chrono::NaiveDate;

use crate::ocr::OcrConfig;
use crate::record::RequestedMode;

pub const ENV_OLLAMA_URL: &str = "RECESCAN_OLLAMA_URL";
pub const ENV_VISION_MODEL: &str = "RECESCAN_VISION_MODEL";
pub const ENV_VISION_TIMEOUT_SECS: &str = "RECESCAN_VISION_TIMEOUT_SECS";
pub const ENV_DEFAULT_MODE: &str = "RECESCAN_DEFAULT_MODE";

pub const DEFAULT_VISION_MODEL: &str = "qwen2.5vl:7b";
pub const DEFAULT_VISION_TIMEOUT_SECS: u64 = 30;

/// Connection settings for the vision model endpoint.
#[derive(Debug, Clone)]
pub struct VisionConfig {
    /// Base URL of an Ollama-compatible server, without the `/api/chat` path.
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// `None` means the vision path is unavailable and auto mode goes
    /// straight to OCR.
    pub vision: Option<VisionConfig>,
    /// Mode used when a request does not name one.
    pub default_mode: RequestedMode,
    pub ocr: OcrConfig,
    /// Fixed processing date for reproducible runs; `None` resolves to the
    /// local date per request.
    pub processing_date: Option<NaiveDate>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            vision: None,
            default_mode: RequestedMode::Auto,
            ocr: OcrConfig::default(),
            processing_date: None,
        }
    }
}

impl ExtractorConfig {
    /// Read configuration from `RECESCAN_*` environment variables and log
    /// what came out of it.
    pub fn from_env() -> Self {
        let config = Self::resolve(|key| std::env::var(key).ok());
        match &config.vision {
            Some(v) => log::info!("vision path enabled: model '{}' at {}", v.model, v.base_url),
            None => log::info!("vision path disabled ({ENV_OLLAMA_URL} not set)"),
        }
        config
    }

    pub fn vision_available(&self) -> bool {
        self.vision.is_some()
    }

    fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vision = lookup(ENV_OLLAMA_URL)
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .map(|base_url| VisionConfig {
                base_url,
                model: lookup(ENV_VISION_MODEL)
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| DEFAULT_VISION_MODEL.to_string()),
                timeout: Duration::from_secs(
                    lookup(ENV_VISION_TIMEOUT_SECS)
                        .and_then(|raw| raw.trim().parse().ok())
                        .unwrap_or(DEFAULT_VISION_TIMEOUT_SECS),
                ),
            });
        let default_mode = lookup(ENV_DEFAULT_MODE)
            .and_then(|raw| {
                raw.parse::<RequestedMode>()
                    .map_err(|err| log::warn!("{ENV_DEFAULT_MODE}: {err}, using auto"))
                    .ok()
            })
            .unwrap_or_default();
        Self {
            vision,
            default_mode,
            ocr: OcrConfig::default(),
            processing_date: None,
        }
    }
}
