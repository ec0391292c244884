// Recescan
// SPDX-FileCopyrightText: 2026 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Candidate reconciliation.
//!
//! Takes whatever the paths produced and emits the one record the caller
//! sees. A vision candidate that read a total is authoritative and the
//! heuristics only fill its gaps; without a vision total the heuristic
//! candidate drives. Required fields that survive to the end unpopulated get
//! safe defaults, and every default or back-fill costs confidence.

use std::cmp;

use chrono::NaiveDate;

use crate::error::ExtractError;
use crate::heuristics;
use crate::record::{
    Candidate, CandidateFields, ProcessingMode, ReceiptRecord, UNKNOWN_STORE_PLACEHOLDER,
};

pub const VISION_BASE_CONFIDENCE: f64 = 1.0;
pub const OCR_BASE_CONFIDENCE: f64 = 0.6;
pub const DEFAULTED_FIELD_PENALTY: f64 = 0.1;
pub const BACKFILLED_FIELD_PENALTY: f64 = 0.05;

/// Totals further apart than this fraction of the larger one get a warning.
const DIVERGENCE_WARN_RATIO: f64 = 0.1;

/// Merge path candidates into the final record.
///
/// `today` is the processing date used when no receipt date was found.
pub fn reconcile(
    candidates: Vec<Candidate>,
    today: NaiveDate,
) -> Result<ReceiptRecord, ExtractError> {
    let mut vision: Option<CandidateFields> = None;
    let mut regex: Option<CandidateFields> = None;
    for candidate in candidates {
        match candidate {
            Candidate::Vision(fields) => vision = Some(fields),
            Candidate::Regex(fields) => regex = Some(fields),
        }
    }

    warn_on_divergence(vision.as_ref(), regex.as_ref());

    let (fields, vision_primary, processing_mode, backfilled) = match (vision, regex) {
        (Some(v), Some(r)) if v.total_amount.is_some() => {
            let (merged, taken) = backfill(v, r);
            let mode = if taken > 0 {
                ProcessingMode::Hybrid
            } else {
                ProcessingMode::Ai
            };
            (merged, true, mode, taken)
        }
        (Some(v), None) if v.total_amount.is_some() => (v, true, ProcessingMode::Ai, 0),
        // Vision ran but read no total: the heuristic candidate drives and
        // vision only fills its gaps.
        (Some(v), Some(r)) => {
            let (merged, taken) = backfill(r, v);
            let mode = if taken > 0 {
                ProcessingMode::Hybrid
            } else {
                ProcessingMode::Ocr
            };
            (merged, false, mode, taken)
        }
        (None, Some(r)) => (r, false, ProcessingMode::Ocr, 0),
        (Some(_), None) | (None, None) => return Err(ExtractError::NoAmountFound),
    };

    let total_amount = fields.total_amount.ok_or(ExtractError::NoAmountFound)?;
    let (tax_excluded_amount, tax_included_amount) = repair_tax_fields(
        fields.tax_excluded_amount,
        fields.tax_included_amount,
        total_amount,
    );

    let mut defaulted = 0usize;
    let date_was_defaulted = fields.date.is_none();
    let date = match fields.date {
        Some(date) => date,
        None => {
            log::info!("no date extracted, defaulting to processing date {today}");
            defaulted += 1;
            today
        }
    };
    let store_name = match fields
        .store_name
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        Some(name) => name,
        None => {
            log::info!("no store name extracted, using placeholder");
            defaulted += 1;
            UNKNOWN_STORE_PLACEHOLDER.to_string()
        }
    };
    let expense_category = fields
        .expense_category
        .or_else(|| heuristics::infer_expense_category(&store_name))
        .or_else(|| heuristics::infer_category_from_items(&fields.items));

    Ok(ReceiptRecord {
        store_name,
        date,
        date_was_defaulted,
        total_amount,
        tax_excluded_amount,
        tax_included_amount,
        expense_category,
        items: fields.items,
        payment_method: fields.payment_method,
        processing_mode,
        confidence_score: confidence(vision_primary, defaulted, backfilled),
    })
}

/// Fill `base`'s gaps from `other`. Returns the merged fields and how many
/// were taken from `other`.
fn backfill(mut base: CandidateFields, other: CandidateFields) -> (CandidateFields, usize) {
    let mut taken = 0usize;
    if base.store_name.is_none() && other.store_name.is_some() {
        base.store_name = other.store_name;
        taken += 1;
    }
    if base.date.is_none() && other.date.is_some() {
        base.date = other.date;
        taken += 1;
    }
    if base.total_amount.is_none() && other.total_amount.is_some() {
        base.total_amount = other.total_amount;
        taken += 1;
    }
    if base.tax_excluded_amount.is_none() && other.tax_excluded_amount.is_some() {
        base.tax_excluded_amount = other.tax_excluded_amount;
        taken += 1;
    }
    if base.tax_included_amount.is_none() && other.tax_included_amount.is_some() {
        base.tax_included_amount = other.tax_included_amount;
        taken += 1;
    }
    if base.expense_category.is_none() && other.expense_category.is_some() {
        base.expense_category = other.expense_category;
        taken += 1;
    }
    if base.payment_method.is_none() && other.payment_method.is_some() {
        base.payment_method = other.payment_method;
        taken += 1;
    }
    if base.items.is_empty() && !other.items.is_empty() {
        base.items = other.items;
        taken += 1;
    }
    (base, taken)
}

/// Two conservative tax repairs; the extracted total is never modified.
fn repair_tax_fields(
    excluded: Option<i64>,
    included: Option<i64>,
    total: i64,
) -> (Option<i64>, Option<i64>) {
    match (excluded, included) {
        (Some(e), Some(i)) if e > i => {
            log::warn!("tax amounts look swapped (excluded {e} > included {i}), swapping");
            (Some(i), Some(e))
        }
        (Some(e), None) if e <= total => {
            log::debug!("tax-included amount missing, deriving it from the total");
            (Some(e), Some(total))
        }
        other => other,
    }
}

fn warn_on_divergence(vision: Option<&CandidateFields>, regex: Option<&CandidateFields>) {
    let (Some(vt), Some(rt)) = (
        vision.and_then(|f| f.total_amount),
        regex.and_then(|f| f.total_amount),
    ) else {
        return;
    };
    if vt == rt {
        return;
    }
    let ratio = (vt - rt).abs() as f64 / cmp::max(vt, rt) as f64;
    if ratio > DIVERGENCE_WARN_RATIO {
        log::warn!(
            "vision and heuristic totals diverge: {vt} vs {rt} ({:.0}% apart)",
            ratio * 100.0
        );
    }
}

/// The primary path sets the base; every defaulted required field and every
/// back-filled field shaves a fixed slice off.
fn confidence(vision_primary: bool, defaulted: usize, backfilled: usize) -> f64 {
    let base = if vision_primary {
        VISION_BASE_CONFIDENCE
    } else {
        OCR_BASE_CONFIDENCE
    };
    (base
        - defaulted as f64 * DEFAULTED_FIELD_PENALTY
        - backfilled as f64 * BACKFILLED_FIELD_PENALTY)
        .clamp(0.0, 1.0)
}
