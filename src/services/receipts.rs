// Recescan
// SPDX-FileCopyrightText: 2026 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Receipt ledger and CSV export.
//!
//! Wraps the extractor with the bookkeeping the CLI needs: accept an image
//! file, run extraction, keep the result in a store, and export the whole
//! ledger as a spreadsheet-friendly CSV.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, anyhow, bail};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use extractor::{Extractor, ReceiptRecord, RequestedMode};

/// Extensions accepted before any bytes are read.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "bmp", "tif", "tiff", "gif", "heic", "heif",
];

/// Column order bookkeeping spreadsheets expect.
const CSV_HEADER: &str = "日付,店名・会社名,合計金額,税抜価格,税込価格,費目タグ";

/// Leading BOM so Excel detects UTF-8 instead of Shift-JIS.
const UTF8_BOM: &str = "\u{feff}";

/// One ledger entry: the extracted record plus ingest bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredReceipt {
    pub id: u64,
    pub source: String,
    pub uploaded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: ReceiptRecord,
}

/// Envelope printed for every processed image, success or not.
#[derive(Debug, Clone, Serialize)]
pub struct ReceiptResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<StoredReceipt>,
}

impl ReceiptResponse {
    fn ok(stored: StoredReceipt) -> Self {
        let message = if stored.record.date_was_defaulted {
            "receipt extracted; no date was found, so the processing date was used".to_string()
        } else {
            "receipt extracted".to_string()
        };
        Self {
            success: true,
            message,
            data: Some(stored),
        }
    }

    fn failure(message: String) -> Self {
        Self {
            success: false,
            message,
            data: None,
        }
    }
}

/// Storage behind the ledger. The in-memory store is the default; the trait
/// seam is where a persistent backend would slot in.
pub trait ReceiptStore {
    fn insert(&mut self, source: String, record: ReceiptRecord) -> StoredReceipt;
    fn list(&self) -> &[StoredReceipt];
    fn clear(&mut self) -> usize;

    fn len(&self) -> usize {
        self.list().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Volatile store; ids restart at 1 each run.
#[derive(Debug, Default)]
pub struct MemoryStore {
    receipts: Vec<StoredReceipt>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReceiptStore for MemoryStore {
    fn insert(&mut self, source: String, record: ReceiptRecord) -> StoredReceipt {
        let stored = StoredReceipt {
            id: self.receipts.len() as u64 + 1,
            source,
            uploaded_at: Utc::now(),
            record,
        };
        self.receipts.push(stored.clone());
        stored
    }

    fn list(&self) -> &[StoredReceipt] {
        &self.receipts
    }

    fn clear(&mut self) -> usize {
        let removed = self.receipts.len();
        self.receipts.clear();
        removed
    }
}

/// Extraction plus ledger bookkeeping for a batch of images.
pub struct ReceiptService<S: ReceiptStore> {
    store: S,
}

impl<S: ReceiptStore> ReceiptService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Process one image file end to end. Unreadable files, rejected
    /// extensions and extraction failures all come back as a failure
    /// envelope rather than an error.
    pub fn ingest_file(
        &mut self,
        extractor: &Extractor,
        path: &Path,
        mode: Option<RequestedMode>,
    ) -> ReceiptResponse {
        match self.try_ingest_file(extractor, path, mode) {
            Ok(stored) => ReceiptResponse::ok(stored),
            Err(err) => {
                log::warn!("{}: {err:#}", path.display());
                ReceiptResponse::failure(format!("{err:#}"))
            }
        }
    }

    fn try_ingest_file(
        &mut self,
        extractor: &Extractor,
        path: &Path,
        mode: Option<RequestedMode>,
    ) -> Result<StoredReceipt> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .ok_or_else(|| anyhow!("file has no extension"))?;
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            bail!("unsupported file extension '.{extension}'");
        }
        let bytes =
            fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let source = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();
        self.ingest_bytes(extractor, source, &bytes, mode)
    }

    /// Extract a record from raw bytes and append it to the ledger. A
    /// `None` mode defers to the configured default.
    pub fn ingest_bytes(
        &mut self,
        extractor: &Extractor,
        source: String,
        bytes: &[u8],
        mode: Option<RequestedMode>,
    ) -> Result<StoredReceipt> {
        let record = extractor.extract(bytes, mode)?;
        Ok(self.store.insert(source, record))
    }

    pub fn receipts(&self) -> &[StoredReceipt] {
        self.store.list()
    }

    pub fn clear(&mut self) -> usize {
        self.store.clear()
    }

    /// Write the ledger as CSV. Returns the number of data rows.
    pub fn export_csv(&self, writer: &mut impl Write) -> Result<usize> {
        write!(writer, "{UTF8_BOM}")?;
        writeln!(writer, "{CSV_HEADER}")?;
        for stored in self.store.list() {
            let record = &stored.record;
            writeln!(
                writer,
                "{},{},{},{},{},{}",
                record.date.format("%Y-%m-%d"),
                csv_field(&record.store_name),
                record.total_amount,
                optional_amount(record.tax_excluded_amount),
                optional_amount(record.tax_included_amount),
                csv_field(record.expense_category.as_deref().unwrap_or("")),
            )?;
        }
        Ok(self.store.len())
    }

    /// Write the ledger CSV to `path`. A directory gets a timestamped file
    /// name inside it. Returns the resolved path and row count.
    pub fn export_csv_file(&self, path: &Path) -> Result<(PathBuf, usize)> {
        let resolved = if path.is_dir() {
            path.join(default_export_file_name(Local::now()))
        } else {
            path.to_path_buf()
        };
        let mut file = fs::File::create(&resolved)
            .with_context(|| format!("failed to create {}", resolved.display()))?;
        let rows = self.export_csv(&mut file)?;
        Ok((resolved, rows))
    }
}

/// Default export file name, stamped so repeated exports never collide.
pub fn default_export_file_name(now: DateTime<Local>) -> String {
    format!("receipt_data_{}.csv", now.format("%Y%m%d_%H%M%S"))
}

fn optional_amount(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// RFC 4180 quoting: wrap the value when it holds a comma, quote or newline.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use extractor::{ExtractorConfig, ProcessingMode};

    fn sample_record(store: &str, total: i64, category: Option<&str>) -> ReceiptRecord {
        ReceiptRecord {
            store_name: store.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 5, 3).unwrap(),
            date_was_defaulted: false,
            total_amount: total,
            tax_excluded_amount: None,
            tax_included_amount: Some(total),
            expense_category: category.map(str::to_string),
            items: Vec::new(),
            payment_method: None,
            processing_mode: ProcessingMode::Ocr,
            confidence_score: 0.6,
        }
    }

    fn offline_extractor() -> Extractor {
        Extractor::from_config(ExtractorConfig::default())
    }

    #[test]
    fn test_memory_store_ids_and_clear() {
        let mut store = MemoryStore::new();
        let first = store.insert("a.jpg".to_string(), sample_record("A", 100, None));
        let second = store.insert("b.jpg".to_string(), sample_record("B", 200, None));
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(store.list().len(), 2);

        assert_eq!(store.clear(), 2);
        assert!(store.list().is_empty());
        let again = store.insert("c.jpg".to_string(), sample_record("C", 300, None));
        assert_eq!(again.id, 1);
    }

    #[test]
    fn test_service_clear_empties_the_ledger() {
        let mut store = MemoryStore::new();
        store.insert("a.jpg".to_string(), sample_record("A", 100, None));
        store.insert("b.jpg".to_string(), sample_record("B", 200, None));
        let mut service = ReceiptService::new(store);

        assert_eq!(service.receipts().len(), 2);
        assert_eq!(service.clear(), 2);
        assert!(service.receipts().is_empty());

        let mut buf = Vec::new();
        let rows = service.export_csv(&mut buf).unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_export_csv_golden_rows() {
        let mut store = MemoryStore::new();
        store.insert(
            "a.jpg".to_string(),
            sample_record("ローソン 新宿店", 1000, Some("食費")),
        );
        let mut quoted = sample_record("カフェ, ド・\"クレール\"", 820, None);
        quoted.tax_included_amount = None;
        store.insert("b.jpg".to_string(), quoted);
        let service = ReceiptService::new(store);

        let mut buf = Vec::new();
        let rows = service.export_csv(&mut buf).unwrap();
        assert_eq!(rows, 2);

        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with('\u{feff}'));
        let lines: Vec<&str> = text.trim_start_matches('\u{feff}').lines().collect();
        assert_eq!(lines[0], "日付,店名・会社名,合計金額,税抜価格,税込価格,費目タグ");
        assert_eq!(lines[1], "2024-05-03,ローソン 新宿店,1000,,1000,食費");
        assert_eq!(lines[2], "2024-05-03,\"カフェ, ド・\"\"クレール\"\"\",820,,,");
    }

    #[test]
    fn test_export_csv_file_into_directory() {
        let mut store = MemoryStore::new();
        store.insert("a.jpg".to_string(), sample_record("A", 100, None));
        let service = ReceiptService::new(store);

        let dir = tempfile::tempdir().unwrap();
        let (path, rows) = service.export_csv_file(dir.path()).unwrap();
        assert_eq!(rows, 1);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("receipt_data_"));
        assert!(name.ends_with(".csv"));
        assert!(path.exists());
    }

    #[test]
    fn test_default_export_file_name_format() {
        let stamp = Local.with_ymd_and_hms(2024, 5, 3, 14, 30, 5).unwrap();
        assert_eq!(
            default_export_file_name(stamp),
            "receipt_data_20240503_143005.csv"
        );
    }

    #[test]
    fn test_ingest_file_rejects_unknown_extension() {
        let extractor = offline_extractor();
        let mut service = ReceiptService::new(MemoryStore::new());
        let response = service.ingest_file(&extractor, Path::new("note.txt"), None);
        assert!(!response.success);
        assert!(response.message.contains("unsupported file extension"));
        assert!(service.receipts().is_empty());
    }

    #[test]
    fn test_ingest_file_reports_missing_file() {
        let extractor = offline_extractor();
        let mut service = ReceiptService::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.jpg");
        let response = service.ingest_file(&extractor, &missing, Some(RequestedMode::Ocr));
        assert!(!response.success);
        assert!(response.message.contains("failed to read"));
    }

    #[test]
    fn test_ingest_file_wraps_extraction_failure() {
        let extractor = offline_extractor();
        let mut service = ReceiptService::new(MemoryStore::new());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.png");
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([255, 255, 255]));
        img.save(&path).unwrap();

        let response = service.ingest_file(&extractor, &path, Some(RequestedMode::Ocr));
        assert!(!response.success);
        assert!(response.message.contains("total amount"));
        assert!(service.receipts().is_empty());
    }

    #[test]
    fn test_stored_receipt_serializes_flattened() {
        let mut store = MemoryStore::new();
        let stored = store.insert("a.jpg".to_string(), sample_record("A", 100, None));
        let value = serde_json::to_value(&stored).unwrap();
        assert_eq!(value["id"], 1);
        assert_eq!(value["source"], "a.jpg");
        assert_eq!(value["store_name"], "A");
        assert_eq!(value["total_amount"], 100);
    }
}
