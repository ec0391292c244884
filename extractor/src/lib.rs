// Recescan
// SPDX-FileCopyrightText: 2026 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Extraction decision core for receipt photos.
//!
//! One receipt image goes in; one normalized, confidence-scored
//! [`ReceiptRecord`] comes out. Two independent paths can populate it: a
//! multimodal vision model reading the image directly, and a local OCR
//! engine whose text is mined with Japanese receipt heuristics. The mode
//! selector in [`pipeline`] decides which paths run, and [`reconcile`]
//! merges whatever they produced.
//!
//! The crate is synchronous throughout and free of ambient state; endpoints,
//! models and the processing date all arrive through [`ExtractorConfig`].

pub mod config;
pub mod error;
pub mod heuristics;
pub mod normalize;
pub mod ocr;
pub mod pipeline;
pub mod reconcile;
pub mod record;
pub mod vision;

pub use config::{ExtractorConfig, VisionConfig};
pub use error::ExtractError;
pub use pipeline::{Capabilities, Extractor};
pub use record::{
    Candidate, CandidateFields, ProcessingMode, ReceiptItem, ReceiptRecord, RequestedMode,
    UNKNOWN_STORE_PLACEHOLDER,
};
