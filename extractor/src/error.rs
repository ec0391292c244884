// Recescan
// SPDX-FileCopyrightText: 2026 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

use thiserror::Error;

/// Terminal failures of an extraction request.
///
/// Everything else (an unreachable vision endpoint in auto mode, an OCR run
/// that reads nothing, a garbled model response) degrades to another path and
/// never surfaces here.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The upload was rejected before any extraction ran.
    #[error("invalid image: {reason}")]
    InvalidImage { reason: String },

    /// Explicit AI mode was requested and the vision path could not deliver.
    #[error("vision extraction failed: {reason}")]
    VisionFailed { reason: String },

    /// Every path that ran finished without a usable total amount.
    #[error("no usable total amount could be extracted from the receipt")]
    NoAmountFound,
}
