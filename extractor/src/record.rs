// Recescan
// SPDX-FileCopyrightText: 2026 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Record types shared by every extraction path.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Store name used when no extraction path could read one off the receipt.
pub const UNKNOWN_STORE_PLACEHOLDER: &str = "不明な店舗";

/// Which path(s) actually contributed fields to the final record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// The vision model supplied every populated field.
    Ai,
    /// OCR text plus heuristics supplied every populated field.
    Ocr,
    /// Vision output back-filled from heuristics, or the other way around.
    Hybrid,
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessingMode::Ai => "ai",
            ProcessingMode::Ocr => "ocr",
            ProcessingMode::Hybrid => "hybrid",
        };
        f.write_str(label)
    }
}

/// Mode requested by the caller, before the selector resolves what runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestedMode {
    /// Vision first, OCR + heuristics as the fallback.
    #[default]
    Auto,
    /// Vision only; a vision failure is terminal.
    Ai,
    /// OCR + heuristics only; the vision model is never contacted.
    Ocr,
}

impl fmt::Display for RequestedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequestedMode::Auto => "auto",
            RequestedMode::Ai => "ai",
            RequestedMode::Ocr => "ocr",
        };
        f.write_str(label)
    }
}

impl FromStr for RequestedMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(RequestedMode::Auto),
            "ai" => Ok(RequestedMode::Ai),
            "ocr" => Ok(RequestedMode::Ocr),
            other => Err(format!("unknown extraction mode: {other}")),
        }
    }
}

/// One line item read off the receipt. Only the vision path produces these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptItem {
    pub name: String,
    /// Unit price in whole yen.
    pub price: i64,
}

/// The normalized result of one extraction request.
///
/// `store_name`, `date` and `total_amount` are always populated; the rest stay
/// `None` when nothing on the receipt supported them. Dates serialize as
/// `YYYY-MM-DD`, amounts are whole yen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub store_name: String,
    pub date: NaiveDate,
    /// True when `date` is the processing date because no date was found.
    pub date_was_defaulted: bool,
    pub total_amount: i64,
    pub tax_excluded_amount: Option<i64>,
    pub tax_included_amount: Option<i64>,
    pub expense_category: Option<String>,
    pub items: Vec<ReceiptItem>,
    pub payment_method: Option<String>,
    pub processing_mode: ProcessingMode,
    /// Heuristic trust score in `[0.0, 1.0]`, not a calibrated probability.
    pub confidence_score: f64,
}

/// Partially populated field set produced by a single extraction path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateFields {
    pub store_name: Option<String>,
    pub date: Option<NaiveDate>,
    pub total_amount: Option<i64>,
    pub tax_excluded_amount: Option<i64>,
    pub tax_included_amount: Option<i64>,
    pub expense_category: Option<String>,
    pub items: Vec<ReceiptItem>,
    pub payment_method: Option<String>,
}

impl CandidateFields {
    /// True when the path found nothing at all.
    pub fn is_empty(&self) -> bool {
        self.store_name.is_none()
            && self.date.is_none()
            && self.total_amount.is_none()
            && self.tax_excluded_amount.is_none()
            && self.tax_included_amount.is_none()
            && self.expense_category.is_none()
            && self.items.is_empty()
            && self.payment_method.is_none()
    }

    /// True when every scalar field is populated. Line items are optional on
    /// real receipts, so they do not count against completeness.
    pub fn is_complete(&self) -> bool {
        self.store_name.is_some()
            && self.date.is_some()
            && self.total_amount.is_some()
            && self.tax_excluded_amount.is_some()
            && self.tax_included_amount.is_some()
            && self.expense_category.is_some()
            && self.payment_method.is_some()
    }
}

/// A candidate record tagged with the path that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    Vision(CandidateFields),
    Regex(CandidateFields),
}
