//! Parsing helpers for the Taiwanese exchange wire formats.
//!
//! Exchange tables use Republic-of-China years (western year − 1911),
//! comma-grouped number strings and `--` for "no trade".

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

use super::calendar::taipei_offset;

/// Offset between the ROC calendar and the western calendar.
pub(crate) const ROC_YEAR_OFFSET: i32 = 1911;

/// Parse an ROC date such as `113/01/02` into `2024-01-02`.
///
/// Trailing annotation marks (`＊`, `*`) some tables append are ignored.
pub(crate) fn parse_roc_date(raw: &str) -> Option<NaiveDate> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '/')
        .collect();

    let mut parts = cleaned.split('/');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }

    NaiveDate::from_ymd_opt(year + ROC_YEAR_OFFSET, month, day)
}

/// `ROC/MM/01` for the month containing `date`.
pub(crate) fn roc_month_param(date: NaiveDate) -> String {
    use chrono::Datelike;
    format!("{}/{:02}/01", date.year() - ROC_YEAR_OFFSET, date.month())
}

/// Parse a comma-grouped decimal. Placeholders (`--`, `---`, `X`, empty) give `None`.
pub(crate) fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '-') || trimmed.eq_ignore_ascii_case("x")
    {
        return None;
    }

    let cleaned: String = trimmed.chars().filter(|c| *c != ',').collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a comma-grouped non-negative integer count.
pub(crate) fn parse_count(raw: &str) -> Option<u64> {
    let value = parse_number(raw)?;
    (value >= 0.0).then(|| value.round() as u64)
}

/// Convert a share count to lots (1000 shares), rounding to nearest.
pub(crate) fn shares_to_lots(shares: u64) -> u64 {
    (shares + 500) / 1000
}

/// Cell `i` of a JSON table row as text. Numbers are rendered, other types give `None`.
pub(crate) fn cell(row: &[Value], i: usize) -> Option<String> {
    match row.get(i)? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Trading date in Taipei for a unix timestamp.
pub(crate) fn taipei_date_from_unix(ts: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp(ts, 0).map(|dt| dt.with_timezone(&taipei_offset()).date_naive())
}

// ============================================================================
// Tests
// ============================================================================
