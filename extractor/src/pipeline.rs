// Recescan
// SPDX-FileCopyrightText: 2026 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Request orchestration: one image in, one record (or terminal error) out.
//!
//! The mode selector is deliberately small. Auto runs vision first and falls
//! through to OCR on any vision-path failure; explicit `ai` never falls
//! through; explicit `ocr` never contacts the model. Everything the paths
//! produce funnels into [`crate::reconcile`].

use serde::Serialize;

use crate::config::ExtractorConfig;
use crate::error::ExtractError;
use crate::heuristics;
use crate::normalize;
use crate::ocr::{self, OcrEngine, TesseractEngine};
use crate::reconcile;
use crate::record::{Candidate, ReceiptRecord, RequestedMode};
use crate::vision::{OllamaVisionClient, VisionClient};

/// What this process can actually do, for callers that want to pick a mode
/// up front.
#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub ocr_available: bool,
    pub vision_available: bool,
    pub vision_model: Option<String>,
    pub default_mode: String,
    pub available_modes: Vec<String>,
    /// Best mode to ask for; `None` when no path can run at all.
    pub recommended_mode: Option<String>,
}

/// The extraction decision core. One instance is `Send + Sync` and serves
/// any number of sequential or concurrent requests; each request is an
/// independent unit of work.
pub struct Extractor {
    config: ExtractorConfig,
    ocr_engine: Box<dyn OcrEngine>,
    vision_client: Option<Box<dyn VisionClient>>,
}

impl Extractor {
    /// Build with production collaborators resolved from the config.
    pub fn from_config(config: ExtractorConfig) -> Self {
        let ocr_engine: Box<dyn OcrEngine> = Box::new(TesseractEngine::new(&config.ocr.lang));
        let vision_client: Option<Box<dyn VisionClient>> = config
            .vision
            .clone()
            .map(|vision| Box::new(OllamaVisionClient::new(vision)) as Box<dyn VisionClient>);
        Self::with_collaborators(config, ocr_engine, vision_client)
    }

    /// Build with explicit collaborators. Tests inject scripted engines here.
    pub fn with_collaborators(
        config: ExtractorConfig,
        ocr_engine: Box<dyn OcrEngine>,
        vision_client: Option<Box<dyn VisionClient>>,
    ) -> Self {
        Self {
            config,
            ocr_engine,
            vision_client,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        let ocr_available = self.ocr_engine.available();
        let vision_available = self.vision_client.is_some();
        let mut available_modes = Vec::new();
        // Auto only counts when it has at least one path to dispatch to.
        if vision_available || ocr_available {
            available_modes.push("auto".to_string());
        }
        if vision_available {
            available_modes.push("ai".to_string());
        }
        if ocr_available {
            available_modes.push("ocr".to_string());
        }
        let recommended_mode = if vision_available {
            Some("auto".to_string())
        } else if ocr_available {
            Some("ocr".to_string())
        } else {
            None
        };
        Capabilities {
            ocr_available,
            vision_available,
            vision_model: self.config.vision.as_ref().map(|v| v.model.clone()),
            default_mode: self.config.default_mode.to_string(),
            available_modes,
            recommended_mode,
        }
    }

    /// Run one extraction request.
    ///
    /// `mode` overrides the configured default when given. The only terminal
    /// failures are a rejected upload, a vision failure under explicit `ai`,
    /// and no usable total after every path that was allowed to run.
    pub fn extract(
        &self,
        bytes: &[u8],
        mode: Option<RequestedMode>,
    ) -> Result<ReceiptRecord, ExtractError> {
        let requested = mode.unwrap_or(self.config.default_mode);
        let today = self
            .config
            .processing_date
            .unwrap_or_else(|| chrono::Local::now().date_naive());
        log::info!(
            "extraction started: mode {requested}, {} input bytes",
            bytes.len()
        );

        let canonical = normalize::normalize(bytes)?;

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut vision_failure: Option<String> = None;

        if requested != RequestedMode::Ocr {
            match self.vision_client.as_deref() {
                Some(client) => match client.extract_fields(&canonical) {
                    Ok(fields) if fields.is_empty() => {
                        log::warn!("vision path returned an empty candidate");
                        vision_failure =
                            Some("vision model read nothing from the image".to_string());
                    }
                    Ok(fields) => {
                        log::info!("vision path produced a candidate");
                        candidates.push(Candidate::Vision(fields));
                    }
                    Err(err) => {
                        log::warn!("vision path failed: {err:#}");
                        vision_failure = Some(format!("{err:#}"));
                    }
                },
                None => {
                    log::info!("vision path not configured");
                    vision_failure = Some("no vision endpoint configured".to_string());
                }
            }
        }

        if requested == RequestedMode::Ai
            && let Some(reason) = vision_failure
        {
            return Err(ExtractError::VisionFailed { reason });
        }

        if self.should_run_ocr(requested, &candidates) {
            match canonical.decoded() {
                Some(decoded) => {
                    let output = ocr::run_ocr(self.ocr_engine.as_ref(), decoded, &self.config.ocr);
                    if !output.text.trim().is_empty() {
                        let fields = heuristics::extract_fields(&output.text, today);
                        if fields.is_empty() {
                            log::info!("heuristics found no fields in the ocr text");
                        } else {
                            candidates.push(Candidate::Regex(fields));
                        }
                    }
                }
                None => log::warn!("no decoded bitmap available, skipping the ocr path"),
            }
        }

        let record = reconcile::reconcile(candidates, today)?;
        log::info!(
            "extraction finished: mode {}, confidence {:.2}",
            record.processing_mode,
            record.confidence_score
        );
        Ok(record)
    }

    fn should_run_ocr(&self, requested: RequestedMode, candidates: &[Candidate]) -> bool {
        match requested {
            RequestedMode::Ocr => true,
            RequestedMode::Ai => false,
            RequestedMode::Auto => match candidates.first() {
                // Skip the fallback only when vision already populated every
                // scalar field; partial candidates still want back-fill.
                Some(Candidate::Vision(fields)) => !fields.is_complete(),
                _ => true,
            },
        }
    }
}
