// Recescan
// SPDX-FileCopyrightText: 2026 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! The vision path: hand the receipt image to a multimodal model and get a
//! structured candidate back in one round trip.
//!
//! Model output is treated as hostile input. The response walks a repair
//! ladder (fence stripping, bare-key quoting, object extraction from prose,
//! Japanese key aliases) before anything is trusted, and every field is
//! re-validated on the way into [`CandidateFields`].

use anyhow::{Context as _, anyhow, bail};
use base64::Engine as _;
use chrono::NaiveDate;
use image::GenericImageView;
use image::imageops::FilterType;
use serde_json::Value;

use crate::config::VisionConfig;
use crate::normalize::{CanonicalImage, encode_jpeg};
use crate::record::{CandidateFields, ReceiptItem};

/// Longest edge sent to the chat endpoint; bigger bitmaps upload slowly and
/// do not read better.
const MAX_PAYLOAD_DIMENSION: u32 = 1024;

const SYSTEM_PROMPT: &str = "You are a strict JSON generator. Respond with a single JSON object and \
     nothing else: no explanations, no markdown fences, no text outside the object.";

const USER_PROMPT: &str = "Read this Japanese receipt image and return ONLY a JSON object with exactly \
     these keys: store_name, date, total_amount, tax_excluded_amount, \
     tax_included_amount, expense_category, items, payment_method. Rules: use \
     null for anything you cannot read. date is YYYY-MM-DD; complete partial \
     dates with the most likely year. Amounts are integers in yen with no \
     currency marks. When several candidate totals appear, the largest is \
     usually the final total. items is an array of objects with keys name and \
     price. expense_category is one of 食費, 交通費, 日用品, 書籍, 娯楽費, \
     医療費, 光熱費, 通信費, or null.";

/// A multimodal model that reads receipt images.
pub trait VisionClient: Send + Sync {
    fn name(&self) -> &str;

    /// One attempt at reading the receipt. Any error is a path failure; the
    /// caller decides whether that is terminal.
    fn extract_fields(&self, image: &CanonicalImage) -> anyhow::Result<CandidateFields>;
}

/// Production client for an Ollama-compatible `/api/chat` endpoint.
pub struct OllamaVisionClient {
    config: VisionConfig,
    agent: ureq::Agent,
}

impl OllamaVisionClient {
    pub fn new(config: VisionConfig) -> Self {
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(config.timeout))
            .build()
            .new_agent();
        Self { config, agent }
    }

    fn call_chat_endpoint(&self, image_b64: &str) -> anyhow::Result<String> {
        let payload = serde_json::json!({
            "model": self.config.model,
            "stream": false,
            "options": { "temperature": 0 },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": USER_PROMPT, "images": [image_b64] },
            ],
        });
        let url = format!("{}/api/chat", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::to_string(&payload)?;
        let mut response = self
            .agent
            .post(&url)
            .header("Content-Type", "application/json")
            .send(&body)
            .map_err(|err| anyhow!("vision request to {url} failed: {err}"))?;
        let status = response.status();
        let text = response
            .body_mut()
            .read_to_string()
            .context("failed to read vision response body")?;
        if status != 200 {
            bail!("vision endpoint returned status {status}: {text}");
        }
        let root: Value =
            serde_json::from_str(&text).context("vision response was not valid JSON")?;
        let content = root
            .get("message")
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("vision response had no message content"))?;
        Ok(content.to_string())
    }
}

impl VisionClient for OllamaVisionClient {
    fn name(&self) -> &str {
        &self.config.model
    }

    fn extract_fields(&self, image: &CanonicalImage) -> anyhow::Result<CandidateFields> {
        let payload = payload_bytes(image);
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(&payload);
        log::info!(
            "sending {} byte payload to vision model '{}'",
            payload.len(),
            self.config.model
        );
        let content = self.call_chat_endpoint(&image_b64)?;
        log::debug!("vision raw response: {} chars", content.chars().count());
        let value = parse_structured_response(&content)
            .ok_or_else(|| anyhow!("vision response contained no parseable JSON object"))?;
        Ok(fields_from_value(&value))
    }
}

/// Bitmap actually sent over the wire: the canonical bytes, downscaled and
/// re-encoded when the canonical form is larger than the payload cap.
fn payload_bytes(image: &CanonicalImage) -> Vec<u8> {
    let Some(decoded) = image.decoded() else {
        // Pass-through input (HEIC): let the model try the original bytes.
        return image.bytes.clone();
    };
    let (width, height) = decoded.dimensions();
    if width <= MAX_PAYLOAD_DIMENSION && height <= MAX_PAYLOAD_DIMENSION {
        return image.bytes.clone();
    }
    let resized = decoded.resize(
        MAX_PAYLOAD_DIMENSION,
        MAX_PAYLOAD_DIMENSION,
        FilterType::Lanczos3,
    );
    match encode_jpeg(&resized) {
        Ok(bytes) => {
            log::debug!("downscaled vision payload from {width}x{height}");
            bytes
        }
        Err(err) => {
            log::warn!("failed to downscale vision payload, sending canonical bytes: {err:#}");
            image.bytes.clone()
        }
    }
}

/// Parse a model response into a JSON object, repairing the common failure
/// shapes along the way. `None` means nothing object-shaped survived.
pub fn parse_structured_response(raw: &str) -> Option<Value> {
    let body = strip_code_fences(raw);
    let mut value = serde_json::from_str::<Value>(body)
        .ok()
        .or_else(|| serde_json::from_str(&fix_unquoted_json_keys(body)).ok())
        .or_else(|| {
            let object = extract_json_object(body)?;
            serde_json::from_str(&object)
                .ok()
                .or_else(|| serde_json::from_str(&fix_unquoted_json_keys(&object)).ok())
        })?;
    if !value.is_object() {
        log::warn!("model response parsed to a non-object JSON value");
        return None;
    }
    normalize_japanese_keys(&mut value);
    Some(value)
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start();
    rest.strip_suffix("```").map(str::trim_end).unwrap_or(rest)
}

/// Quote bare object keys (`{store_name: ...}`), walking the text with
/// string-state tracking so values are never touched. A stray closing quote
/// after a bare key (`store_name": ...`) is folded into the repair.
fn fix_unquoted_json_keys(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len() + 16);
    let mut in_string = false;
    let mut escape_next = false;
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if in_string {
            out.push(ch);
            if escape_next {
                escape_next = false;
            } else if ch == '\\' {
                escape_next = true;
            } else if ch == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if ch == '"' {
            in_string = true;
            out.push(ch);
            i += 1;
            continue;
        }
        out.push(ch);
        i += 1;
        if ch != '{' && ch != ',' {
            continue;
        }
        while i < chars.len() && chars[i].is_whitespace() {
            out.push(chars[i]);
            i += 1;
        }
        let start = i;
        while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
            i += 1;
        }
        if i == start {
            continue;
        }
        let ident: String = chars[start..i].iter().collect();
        let mut after = i;
        if after < chars.len() && chars[after] == '"' {
            after += 1;
        }
        let mut probe = after;
        while probe < chars.len() && chars[probe].is_whitespace() {
            probe += 1;
        }
        if probe < chars.len() && chars[probe] == ':' {
            out.push('"');
            out.push_str(&ident);
            out.push('"');
            i = after;
        } else {
            out.push_str(&ident);
        }
    }
    out
}

/// Grab the first balanced top-level object out of surrounding prose.
fn extract_json_object(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;
    for (offset, ch) in raw[start..].char_indices() {
        if in_string {
            if escape_next {
                escape_next = false;
            } else if ch == '\\' {
                escape_next = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(raw[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Key aliases seen from vision models prompted in English over Japanese
/// documents. An existing canonical key is never overwritten.
const KEY_ALIASES: &[(&str, &str)] = &[
    ("店名", "store_name"),
    ("店舗名", "store_name"),
    ("会社名", "store_name"),
    ("日付", "date"),
    ("購入日", "date"),
    ("発行日", "date"),
    ("合計", "total_amount"),
    ("合計金額", "total_amount"),
    ("総額", "total_amount"),
    ("税抜", "tax_excluded_amount"),
    ("税抜金額", "tax_excluded_amount"),
    ("税抜価格", "tax_excluded_amount"),
    ("税込", "tax_included_amount"),
    ("税込金額", "tax_included_amount"),
    ("税込価格", "tax_included_amount"),
    ("費目", "expense_category"),
    ("カテゴリ", "expense_category"),
    ("品目", "items"),
    ("商品", "items"),
    ("明細", "items"),
    ("支払方法", "payment_method"),
    ("支払い方法", "payment_method"),
    ("品名", "name"),
    ("商品名", "name"),
    ("価格", "price"),
    ("金額", "price"),
];

fn normalize_japanese_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (alias, canonical) in KEY_ALIASES {
                let Some(v) = map.remove(*alias) else {
                    continue;
                };
                if map.contains_key(*canonical) {
                    log::debug!("dropped model key '{alias}' shadowed by '{canonical}'");
                } else {
                    log::debug!("normalized model key '{alias}' to '{canonical}'");
                    map.insert((*canonical).to_string(), v);
                }
            }
            for v in map.values_mut() {
                normalize_japanese_keys(v);
            }
        }
        Value::Array(values) => {
            for v in values.iter_mut() {
                normalize_japanese_keys(v);
            }
        }
        _ => {}
    }
}

/// Convert the model's JSON object into candidate fields, tolerating string
/// amounts, currency marks and null-heavy outputs.
pub fn fields_from_value(value: &Value) -> CandidateFields {
    let empty = serde_json::Map::new();
    let map = value.as_object().unwrap_or(&empty);
    CandidateFields {
        store_name: non_empty_string(map.get("store_name")),
        date: map
            .get("date")
            .and_then(Value::as_str)
            .and_then(parse_model_date),
        total_amount: amount_from_value(map.get("total_amount")),
        tax_excluded_amount: amount_from_value(map.get("tax_excluded_amount")),
        tax_included_amount: amount_from_value(map.get("tax_included_amount")),
        expense_category: non_empty_string(map.get("expense_category")),
        items: items_from_value(map.get("items")),
        payment_method: non_empty_string(map.get("payment_method")),
    }
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    (!s.is_empty() && !s.eq_ignore_ascii_case("null")).then(|| s.to_string())
}

fn parse_model_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    for format in ["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    None
}

fn amount_from_value(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => {
            let v = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.round() as i64))?;
            use crate::heuristics::{MAX_PLAUSIBLE_AMOUNT, MIN_PLAUSIBLE_AMOUNT};
            (MIN_PLAUSIBLE_AMOUNT..=MAX_PLAUSIBLE_AMOUNT)
                .contains(&v)
                .then_some(v)
        }
        Value::String(s) => crate::heuristics::parse_amount(s),
        _ => None,
    }
}

fn items_from_value(value: Option<&Value>) -> Vec<ReceiptItem> {
    let Some(Value::Array(raw_items)) = value else {
        return Vec::new();
    };
    let mut items = Vec::with_capacity(raw_items.len());
    for raw in raw_items {
        let Some(obj) = raw.as_object() else { continue };
        let Some(name) = non_empty_string(obj.get("name")) else {
            continue;
        };
        let Some(price) = amount_from_value(obj.get("price")) else {
            continue;
        };
        items.push(ReceiptItem { name, price });
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json_object() {
        let value = parse_structured_response(r#"{"store_name": "ローソン", "total_amount": 1200}"#)
            .unwrap();
        assert_eq!(value["total_amount"], 1200);
    }

    #[test]
    fn test_parse_strips_markdown_fences() {
        let raw = "```json\n{\"total_amount\": 1200}\n```";
        let value = parse_structured_response(raw).unwrap();
        assert_eq!(value["total_amount"], 1200);
    }

    #[test]
    fn test_parse_repairs_unquoted_keys() {
        let raw = r#"{store_name: "ローソン", total_amount: 1200, items: []}"#;
        let value = parse_structured_response(raw).unwrap();
        assert_eq!(value["store_name"], "ローソン");
        assert_eq!(value["total_amount"], 1200);
    }

    #[test]
    fn test_parse_repairs_stray_key_quote() {
        let raw = r#"{store_name": "ローソン", "total_amount": 980}"#;
        let value = parse_structured_response(raw).unwrap();
        assert_eq!(value["store_name"], "ローソン");
    }

    #[test]
    fn test_parse_extracts_object_from_prose() {
        let raw = "Here is the extracted data: {\"total_amount\": 980, \"items\": [{\"name\": \"お茶\", \"price\": 130}]} Hope this helps!";
        let value = parse_structured_response(raw).unwrap();
        assert_eq!(value["total_amount"], 980);
        assert_eq!(value["items"][0]["name"], "お茶");
    }

    #[test]
    fn test_parse_rejects_non_object_and_garbage() {
        assert!(parse_structured_response("[1, 2, 3]").is_none());
        assert!(parse_structured_response("no json here at all").is_none());
        assert!(parse_structured_response("").is_none());
    }

    #[test]
    fn test_parse_normalizes_japanese_keys() {
        let raw = r#"{"店名": "セブンイレブン", "合計金額": "¥1,234", "日付": "2024-05-03"}"#;
        let value = parse_structured_response(raw).unwrap();
        let fields = fields_from_value(&value);
        assert_eq!(fields.store_name, Some("セブンイレブン".to_string()));
        assert_eq!(fields.total_amount, Some(1234));
        assert_eq!(
            fields.date,
            NaiveDate::from_ymd_opt(2024, 5, 3)
        );
    }

    #[test]
    fn test_japanese_key_never_overwrites_english_key() {
        let raw = r#"{"store_name": "ローソン", "店名": "別の店"}"#;
        let value = parse_structured_response(raw).unwrap();
        assert_eq!(value["store_name"], "ローソン");
        assert!(value.get("店名").is_none());
    }

    #[test]
    fn test_fields_from_value_tolerates_messy_amounts() {
        let value: Value = serde_json::from_str(
            r#"{
                "store_name": "  マルエツ  ",
                "date": "2024/05/03",
                "total_amount": "¥4,345",
                "tax_excluded_amount": 3950.0,
                "tax_included_amount": null,
                "expense_category": "null",
                "payment_method": ""
            }"#,
        )
        .unwrap();
        let fields = fields_from_value(&value);
        assert_eq!(fields.store_name, Some("マルエツ".to_string()));
        assert_eq!(fields.date, NaiveDate::from_ymd_opt(2024, 5, 3));
        assert_eq!(fields.total_amount, Some(4345));
        assert_eq!(fields.tax_excluded_amount, Some(3950));
        assert_eq!(fields.tax_included_amount, None);
        assert_eq!(fields.expense_category, None);
        assert_eq!(fields.payment_method, None);
    }

    #[test]
    fn test_fields_from_value_rejects_implausible_amounts() {
        let value: Value =
            serde_json::from_str(r#"{"total_amount": -500, "tax_included_amount": 0}"#).unwrap();
        let fields = fields_from_value(&value);
        assert_eq!(fields.total_amount, None);
        assert_eq!(fields.tax_included_amount, None);
    }

    #[test]
    fn test_items_from_value_skips_malformed_entries() {
        let value: Value = serde_json::from_str(
            r#"{
                "items": [
                    {"name": "おにぎり", "price": 150},
                    {"name": "", "price": 100},
                    {"name": "ラベルなし"},
                    {"商品名": "お茶", "価格": "130円"},
                    "just a string"
                ]
            }"#,
        )
        .unwrap();
        let mut normalized = value.clone();
        normalize_japanese_keys(&mut normalized);
        let items = items_from_value(normalized.get("items"));
        assert_eq!(
            items,
            vec![
                ReceiptItem {
                    name: "おにぎり".to_string(),
                    price: 150
                },
                ReceiptItem {
                    name: "お茶".to_string(),
                    price: 130
                },
            ]
        );
    }

    #[test]
    fn test_parse_model_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 5, 3);
        assert_eq!(parse_model_date("2024-05-03"), expected);
        assert_eq!(parse_model_date("2024/5/3"), expected);
        assert_eq!(parse_model_date(" 2024.05.03 "), expected);
        assert_eq!(parse_model_date("May 3rd"), None);
    }

    #[test]
    fn test_payload_bytes_downscales_large_canonical_bitmaps() {
        let img = image::RgbImage::from_pixel(1600, 800, image::Rgb([240, 240, 240]));
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        let canonical = crate::normalize::normalize(&buf.into_inner()).unwrap();

        let payload = payload_bytes(&canonical);
        let decoded = image::load_from_memory(&payload).unwrap();
        let (w, h) = decoded.dimensions();
        assert!(w <= MAX_PAYLOAD_DIMENSION && h <= MAX_PAYLOAD_DIMENSION);
    }

    #[test]
    fn test_payload_bytes_passes_small_images_through() {
        let img = image::RgbImage::from_pixel(64, 64, image::Rgb([10, 10, 10]));
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        let bytes = buf.into_inner();
        let canonical = crate::normalize::normalize(&bytes).unwrap();
        assert_eq!(payload_bytes(&canonical), bytes);
    }
}
