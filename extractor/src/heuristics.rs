// Recescan
// SPDX-FileCopyrightText: 2026 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Field mining over raw OCR text.
//!
//! Japanese register tape is messy but formulaic: a handful of date shapes,
//! amounts anchored to 合計/小計 keywords, tax lines, and a store name in the
//! first few rows. Everything in here is line oriented and tolerant of the
//! usual OCR damage (full-width digits, stray spaces, dropped currency marks).
//!
//! Line items are deliberately not mined here; only the vision path reads
//! item tables reliably enough to be worth keeping.

use std::cmp;

use chrono::{Datelike, NaiveDate};
use regex::Regex;

use crate::record::{CandidateFields, ReceiptItem};

/// Amounts outside this range are never receipt totals.
pub const MIN_PLAUSIBLE_AMOUNT: i64 = 1;
pub const MAX_PLAUSIBLE_AMOUNT: i64 = 10_000_000;

/// Total-line keywords, most specific first. Matched against lowercased,
/// space-stripped lines so 合 計 and TOTAL both hit.
const TOTAL_KEYWORDS: &[&str] = &["合計", "総額", "お買上", "total", "現計", "計"];

/// Lines that carry an amount but never the total: subtotals, cash tendered,
/// change, loyalty points.
const EXCLUDED_LINE_KEYWORDS: &[&str] = &["小計", "subtotal", "お預", "お釣", "おつり", "ポイント"];

const STORE_BLOCKLIST: &[&str] = &[
    "領収書",
    "領収証",
    "レシート",
    "receipt",
    "invoice",
    "明細",
    "控え",
    "ご利用",
    "お客様",
];

/// Expense category keyword map, matched against the store name first and
/// the item names second. First hit wins.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "食費",
        &[
            "スーパー",
            "コンビニ",
            "マート",
            "食品",
            "セブンイレブン",
            "ローソン",
            "イオン",
            "マルエツ",
            "レストラン",
            "食堂",
            "カフェ",
        ],
    ),
    ("交通費", &["jr", "駅", "バス", "タクシー", "suica", "pasmo", "交通"]),
    ("日用品", &["ドラッグ", "薬局", "ダイソー", "100均", "ホームセンター"]),
    ("書籍", &["書店", "本屋", "ブック", "紀伊國屋"]),
    ("娯楽費", &["映画", "カラオケ", "ゲーム", "アミューズメント"]),
    ("医療費", &["病院", "クリニック", "歯科", "調剤"]),
    ("光熱費", &["電気", "ガス", "水道", "電力", "東京電力", "東京ガス"]),
    ("通信費", &["ドコモ", "au", "ソフトバンク", "モバイル", "携帯", "インターネット"]),
];

/// Mine a candidate field set out of recognized text.
pub fn extract_fields(text: &str, today: NaiveDate) -> CandidateFields {
    let folded = fold_fullwidth(text);
    let store_name = extract_store_name(&folded);
    let (tax_excluded_amount, tax_included_amount) = extract_tax_amounts(&folded);
    let expense_category = store_name.as_deref().and_then(infer_expense_category);
    CandidateFields {
        date: extract_date(&folded, today),
        total_amount: extract_total_amount(&folded),
        tax_excluded_amount,
        tax_included_amount,
        expense_category,
        items: Vec::new(),
        payment_method: detect_payment_method(&folded),
        store_name,
    }
}

/// Fold full-width digits and the punctuation OCR likes to widen into ASCII
/// so one set of patterns matches both spellings.
pub fn fold_fullwidth(text: &str) -> String {
    text.chars()
        .map(|ch| match ch {
            '０'..='９' => char::from_u32(ch as u32 - 0xFEE0).unwrap_or(ch),
            '，' => ',',
            '．' => '.',
            '：' => ':',
            '／' => '/',
            '－' => '-',
            '　' => ' ',
            _ => ch,
        })
        .collect()
}

/// Find the receipt date. Era notation outranks absolute forms, absolute
/// forms outrank year-less ones (which borrow the year from `today`).
///
/// Day-first forms like `03-05-2024` are not supported; guessing between
/// day-first and month-first silently corrupts records, so such text falls
/// through to the date default instead.
pub fn extract_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    if let Some(date) = match_era_date(text) {
        return Some(date);
    }
    if let Some(date) = match_absolute_date(text) {
        return Some(date);
    }
    match_yearless_date(text, today)
}

fn match_era_date(text: &str) -> Option<NaiveDate> {
    // Year one is printed 令和元年 as often as 令和1年.
    let eras: [(&str, i32); 2] = [("令和", 2018), ("平成", 1988)];
    for (era, base) in eras {
        let pattern = format!(
            r"{era}\s*(?P<n>元|\d{{1,2}})\s*年\s*(?P<m>\d{{1,2}})\s*月\s*(?P<d>\d{{1,2}})\s*日?"
        );
        let re = Regex::new(&pattern).ok()?;
        for caps in re.captures_iter(text) {
            let year_in_era: i32 = if &caps["n"] == "元" {
                1
            } else {
                match caps["n"].parse() {
                    Ok(n) => n,
                    Err(_) => continue,
                }
            };
            if let Some(date) = ymd(base + year_in_era, &caps["m"], &caps["d"]) {
                return Some(date);
            }
        }
    }
    None
}

fn match_absolute_date(text: &str) -> Option<NaiveDate> {
    let four_digit = [
        r"(?P<y>\d{4})\s*年\s*(?P<m>\d{1,2})\s*月\s*(?P<d>\d{1,2})\s*日?",
        r"(?P<y>\d{4})[/-](?P<m>\d{1,2})[/-](?P<d>\d{1,2})",
        r"(?P<y>\d{4})\.(?P<m>\d{1,2})\.(?P<d>\d{1,2})",
    ];
    for pattern in four_digit {
        let re = Regex::new(pattern).ok()?;
        for caps in re.captures_iter(text) {
            if let Some(date) = parse_ymd(&caps["y"], &caps["m"], &caps["d"]) {
                return Some(date);
            }
        }
    }

    // Two-digit years are guarded on both sides so strings like 03-05-2024
    // cannot produce a bogus match on their leading segments.
    let two_digit = [
        r"(?:^|[^0-9])(?P<y>\d{2})\s*年\s*(?P<m>\d{1,2})\s*月\s*(?P<d>\d{1,2})\s*日?",
        r"(?:^|[^0-9])(?P<y>\d{2})[/.-](?P<m>\d{1,2})[/.-](?P<d>\d{1,2})(?:[^0-9]|$)",
    ];
    for pattern in two_digit {
        let re = Regex::new(pattern).ok()?;
        for caps in re.captures_iter(text) {
            if let Some(date) = parse_ymd(&caps["y"], &caps["m"], &caps["d"]) {
                return Some(date);
            }
        }
    }
    None
}

fn match_yearless_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let patterns = [
        r"(?P<m>\d{1,2})\s*月\s*(?P<d>\d{1,2})\s*日",
        r"(?:^|[^0-9/.-])(?P<m>\d{1,2})/(?P<d>\d{1,2})(?:[^0-9/.-]|$)",
    ];
    for pattern in patterns {
        let re = Regex::new(pattern).ok()?;
        for caps in re.captures_iter(text) {
            if let Some(date) = ymd(today.year(), &caps["m"], &caps["d"]) {
                return Some(date);
            }
        }
    }
    None
}

/// Two-digit years fold into 2000-2049 / 1950-1999.
fn parse_ymd(year_raw: &str, month_raw: &str, day_raw: &str) -> Option<NaiveDate> {
    let mut year: i32 = year_raw.parse().ok()?;
    if year_raw.len() == 2 {
        year += if year < 50 { 2000 } else { 1900 };
    }
    ymd(year, month_raw, day_raw)
}

fn ymd(year: i32, month_raw: &str, day_raw: &str) -> Option<NaiveDate> {
    let month: u32 = month_raw.parse().ok()?;
    let day: u32 = day_raw.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Find the total. Keyword-anchored lines win over everything; with no
/// keyword hit at all, fall back to the largest currency-marked or
/// comma-grouped number anywhere on the receipt.
pub fn extract_total_amount(text: &str) -> Option<i64> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    for keyword in TOTAL_KEYWORDS {
        for (idx, line) in lines.iter().enumerate() {
            let flat = flatten_line(line);
            if !flat.contains(keyword) || is_excluded_line(&flat) {
                continue;
            }
            if let Some(value) = amount_on_line(line) {
                return Some(value);
            }
            // Narrow register tape prints the amount on the following line.
            if let Some(next) = lines.get(idx + 1)
                && !is_excluded_line(&flatten_line(next))
                && let Some(value) = amount_on_line(next)
            {
                return Some(value);
            }
        }
    }

    fallback_amount(text)
}

/// Lowercase with whitespace removed; OCR loves to split 合計 into 合 計.
fn flatten_line(line: &str) -> String {
    line.to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

fn is_excluded_line(flat_line: &str) -> bool {
    EXCLUDED_LINE_KEYWORDS.iter().any(|w| flat_line.contains(w))
}

/// Amount on a single line: currency-marked numbers first, then the largest
/// bare digit run (which skips stray `10%`-style fragments, never the biggest
/// number on a total line).
fn amount_on_line(line: &str) -> Option<i64> {
    let marked = Regex::new(r"[¥￥]\s*(?P<a>[0-9][0-9,]*)|(?P<b>[0-9][0-9,]*)\s*円").ok()?;
    for caps in marked.captures_iter(line) {
        let Some(m) = caps.name("a").or_else(|| caps.name("b")) else {
            continue;
        };
        if let Some(value) = parse_amount(m.as_str()) {
            return Some(value);
        }
    }

    let bare = Regex::new(r"[0-9][0-9,]*").ok()?;
    bare.find_iter(line)
        .filter_map(|m| parse_amount(m.as_str()))
        .max()
}

fn fallback_amount(text: &str) -> Option<i64> {
    // Bare digit runs are too often phone numbers or register ids to trust
    // here; require a currency mark or comma grouping.
    let re = Regex::new(
        r"[¥￥]\s*(?P<a>[0-9][0-9,]*)|(?P<b>[0-9][0-9,]*)\s*円|(?P<c>[0-9]{1,3}(?:,[0-9]{3})+)",
    )
    .ok()?;
    let mut best: Option<i64> = None;
    for caps in re.captures_iter(text) {
        let Some(m) = caps
            .name("a")
            .or_else(|| caps.name("b"))
            .or_else(|| caps.name("c"))
        else {
            continue;
        };
        if let Some(value) = parse_amount(m.as_str()) {
            best = cmp::max(best, Some(value));
        }
    }
    best
}

/// Parse a digit run (possibly comma-grouped) into whole yen. Values outside
/// the plausible receipt range are discarded.
pub fn parse_amount(raw: &str) -> Option<i64> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() || digits.len() > 9 {
        return None;
    }
    let value: i64 = digits.parse().ok()?;
    (MIN_PLAUSIBLE_AMOUNT..=MAX_PLAUSIBLE_AMOUNT)
        .contains(&value)
        .then_some(value)
}

/// Tax-excluded and tax-included amounts, in that order.
pub fn extract_tax_amounts(text: &str) -> (Option<i64>, Option<i64>) {
    (tax_amount(text, r"(?:税抜|税別)"), tax_amount(text, r"税込"))
}

fn tax_amount(text: &str, keyword: &str) -> Option<i64> {
    let pattern = format!(r"{keyword}[\s:：)）]*[¥￥]?\s*(?P<v>[0-9][0-9,]*)(?P<pct>%?)");
    let re = Regex::new(&pattern).ok()?;
    for caps in re.captures_iter(text) {
        // 税込10% is a rate, not an amount.
        if &caps["pct"] == "%" {
            continue;
        }
        if let Some(value) = parse_amount(&caps["v"]) {
            return Some(value);
        }
    }
    None
}

/// First plausible line near the top of the receipt: short, mostly
/// non-numeric, not boilerplate, not a phone number.
pub fn extract_store_name(text: &str) -> Option<String> {
    for line in text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(10)
    {
        let char_count = line.chars().count();
        if !(2..=50).contains(&char_count) {
            continue;
        }
        let digit_count = line.chars().filter(|c| c.is_ascii_digit()).count();
        // Date and phone lines are mostly digits.
        if digit_count * 10 >= char_count * 3 {
            continue;
        }
        let lowered = line.to_lowercase();
        if STORE_BLOCKLIST.iter().any(|w| lowered.contains(w)) {
            continue;
        }
        if lowered.contains("tel") || line.contains("電話") || line.contains('☎') {
            continue;
        }
        let cleaned = strip_decoration(line);
        if cleaned.chars().count() >= 2 {
            return Some(cleaned);
        }
    }
    None
}

fn strip_decoration(line: &str) -> String {
    line.trim_matches(|c: char| !(c.is_alphanumeric() || matches!(c, '・' | '&' | '.' | '\'')))
        .to_string()
}

/// Payment method label, or `None` when nothing on the receipt names one.
pub fn detect_payment_method(text: &str) -> Option<String> {
    let lowered = text.to_lowercase();
    const METHODS: &[(&str, &[&str])] = &[
        (
            "クレジットカード",
            &["クレジット", "credit", "visa", "mastercard", "jcb", "amex"],
        ),
        (
            "電子マネー",
            &["電子マネー", "suica", "pasmo", "icoca", "nanaco", "waon", "edy"],
        ),
        (
            "QRコード決済",
            &["paypay", "ペイペイ", "d払い", "楽天ペイ", "メルペイ", "au pay"],
        ),
        ("現金", &["現金", "cash", "お預り", "お預かり", "おつり", "お釣"]),
    ];
    for (label, keywords) in METHODS {
        if keywords.iter().any(|k| lowered.contains(k)) {
            return Some((*label).to_string());
        }
    }
    None
}

pub fn infer_expense_category(store_name: &str) -> Option<String> {
    category_for(store_name)
}

pub fn infer_category_from_items(items: &[ReceiptItem]) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    let joined = items
        .iter()
        .map(|i| i.name.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    category_for(&joined)
}

fn category_for(text: &str) -> Option<String> {
    let lowered = text.to_lowercase();
    for (category, keywords) in CATEGORY_KEYWORDS {
        if keywords.iter().any(|k| lowered.contains(k)) {
            return Some((*category).to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn today() -> NaiveDate {
        day(2024, 8, 15)
    }

    #[test]
    fn test_extract_date_absolute_forms() {
        for text in [
            "2024年5月3日",
            "2024年 5月 3日",
            "2024/05/03",
            "2024-05-03",
            "2024.5.3",
            "発行日: 2024/5/3 14:22",
        ] {
            assert_eq!(extract_date(text, today()), Some(day(2024, 5, 3)), "{text}");
        }
    }

    #[test]
    fn test_extract_date_era_forms() {
        assert_eq!(extract_date("令和6年5月3日", today()), Some(day(2024, 5, 3)));
        assert_eq!(extract_date("令和元年10月1日", today()), Some(day(2019, 10, 1)));
        assert_eq!(extract_date("平成31年4月30日", today()), Some(day(2019, 4, 30)));
        // Era patterns outrank the two-digit fold, so 令和16 is 2034, never 2016.
        assert_eq!(extract_date("令和16年5月3日", today()), Some(day(2034, 5, 3)));
    }

    #[test]
    fn test_extract_date_two_digit_years() {
        assert_eq!(extract_date("24/05/03", today()), Some(day(2024, 5, 3)));
        assert_eq!(extract_date("98-05-03", today()), Some(day(1998, 5, 3)));
        assert_eq!(extract_date("24年5月3日", today()), Some(day(2024, 5, 3)));
    }

    #[test]
    fn test_extract_date_yearless_uses_processing_year() {
        assert_eq!(extract_date("5月3日", today()), Some(day(2024, 5, 3)));
        assert_eq!(extract_date("05/03 レジ0012", today()), Some(day(2024, 5, 3)));
    }

    #[test]
    fn test_extract_date_rejects_ambiguous_day_first() {
        // Case from the wild: day-first output would need a guess, so none is made.
        assert_eq!(extract_date("03-05-2024", today()), None);
    }

    #[test]
    fn test_extract_date_ignores_invalid_calendar_days() {
        assert_eq!(extract_date("2024/13/45", today()), None);
        assert_eq!(extract_date("2024年2月30日", today()), None);
    }

    #[test]
    fn test_extract_total_prefers_keyword_over_subtotal() {
        let text = "小計 ¥900\n消費税 ¥100\n合計 ¥1,000";
        assert_eq!(extract_total_amount(text), Some(1000));
    }

    #[test]
    fn test_extract_total_ignores_tendered_and_change() {
        let text = "合計 ¥1,500\nお預り ¥2,000\nお釣り ¥500";
        assert_eq!(extract_total_amount(text), Some(1500));
    }

    #[test]
    fn test_extract_total_amount_on_following_line() {
        let text = "お買上げ合計\n¥3,480";
        assert_eq!(extract_total_amount(text), Some(3480));
    }

    #[test]
    fn test_extract_total_small_and_unmarked_amounts() {
        assert_eq!(extract_total_amount("合計 ¥80"), Some(80));
        assert_eq!(extract_total_amount("合計 1234"), Some(1234));
        assert_eq!(extract_total_amount("TOTAL 2,180円"), Some(2180));
    }

    #[test]
    fn test_extract_total_skips_percent_fragment_on_keyword_line() {
        assert_eq!(extract_total_amount("合計(税込10%) 1,234"), Some(1234));
    }

    #[test]
    fn test_extract_total_keyword_variants() {
        assert_eq!(extract_total_amount("合 計 ¥2,680"), Some(2680));
        assert_eq!(extract_total_amount("お買上 ¥1,780"), Some(1780));
    }

    #[test]
    fn test_extract_total_fallback_takes_largest_marked_number() {
        let text = "おにぎり ¥150\nお茶 130円\n¥1,280";
        assert_eq!(extract_total_amount(text), Some(1280));
    }

    #[test]
    fn test_extract_total_rejects_implausible_values() {
        assert_eq!(extract_total_amount("合計 ¥0"), None);
        assert_eq!(extract_total_amount("合計 ¥15,000,000"), None);
        assert_eq!(extract_total_amount("何も書かれていない"), None);
    }

    #[test]
    fn test_extract_total_folds_fullwidth_digits() {
        let folded = fold_fullwidth("合計 ￥１，２３４");
        assert_eq!(extract_total_amount(&folded), Some(1234));
    }

    #[test]
    fn test_extract_tax_amounts() {
        let (excl, incl) = extract_tax_amounts("税抜 ¥1,000\n税込 ¥1,100");
        assert_eq!(excl, Some(1000));
        assert_eq!(incl, Some(1100));

        let (excl, incl) = extract_tax_amounts("税別 980円");
        assert_eq!(excl, Some(980));
        assert_eq!(incl, None);
    }

    #[test]
    fn test_extract_tax_amounts_skips_rates() {
        let (excl, incl) = extract_tax_amounts("合計(税込10%) ¥1,100");
        assert_eq!(excl, None);
        assert_eq!(incl, None);
    }

    #[test]
    fn test_extract_store_name_picks_first_plausible_line() {
        let text = "***領収書***\nファミリーマート 渋谷店\nTEL 03-1234-5678\n2024/05/03";
        assert_eq!(
            extract_store_name(text),
            Some("ファミリーマート 渋谷店".to_string())
        );
    }

    #[test]
    fn test_extract_store_name_skips_numeric_and_phone_lines() {
        let text = "2024/05/03 12:34\n0120-123-456\n電話 03-1111-2222\nカフェ ド 青山";
        assert_eq!(extract_store_name(text), Some("カフェ ド 青山".to_string()));
    }

    #[test]
    fn test_extract_store_name_none_on_hopeless_text() {
        assert_eq!(extract_store_name("1234567890\n999"), None);
    }

    #[test]
    fn test_detect_payment_method() {
        assert_eq!(
            detect_payment_method("クレジットカード支払い VISA"),
            Some("クレジットカード".to_string())
        );
        assert_eq!(
            detect_payment_method("交通系IC Suicaでのお支払い"),
            Some("電子マネー".to_string())
        );
        assert_eq!(
            detect_payment_method("PayPay残高払い"),
            Some("QRコード決済".to_string())
        );
        assert_eq!(
            detect_payment_method("お預り ¥2,000"),
            Some("現金".to_string())
        );
        assert_eq!(detect_payment_method("合計 ¥1,000"), None);
    }

    #[test]
    fn test_infer_expense_category() {
        assert_eq!(infer_expense_category("ファミリーマート 渋谷店"), Some("食費".to_string()));
        assert_eq!(infer_expense_category("東京電力"), Some("光熱費".to_string()));
        assert_eq!(infer_expense_category("不明な店舗"), None);
    }

    #[test]
    fn test_infer_category_from_items() {
        let items = vec![ReceiptItem {
            name: "タクシー運賃".to_string(),
            price: 2300,
        }];
        assert_eq!(infer_category_from_items(&items), Some("交通費".to_string()));
        assert_eq!(infer_category_from_items(&[]), None);
    }

    #[test]
    fn test_extract_fields_end_to_end() {
        let text = "ローソン 新宿三丁目店\n2024年5月3日\nおにぎり ¥150\n小計 ¥900\n合計 ¥1,000\n(税込)\n現金 ¥1,000";
        let fields = extract_fields(text, today());
        assert_eq!(fields.store_name, Some("ローソン 新宿三丁目店".to_string()));
        assert_eq!(fields.date, Some(day(2024, 5, 3)));
        assert_eq!(fields.total_amount, Some(1000));
        assert_eq!(fields.expense_category, Some("食費".to_string()));
        assert_eq!(fields.payment_method, Some("現金".to_string()));
        assert!(fields.items.is_empty());
    }

    #[test]
    fn test_extract_fields_on_empty_text() {
        let fields = extract_fields("", today());
        assert!(fields.is_empty());
    }
}
