//! Timestamp normalization.
//!
//! Stored timestamps arrive in several encodings: epoch milliseconds, ISO-8601
//! with or without an offset, `YYYY-MM-DD HH:mm:ss`, and `DD/MM/YYYY HH:mm`.
//! Everything funnels into a single UTC instant here, and leaves again as a
//! display string or a calendar-day bucket in the fixed display zone.
//!
//! Nothing in this module fails: unparseable input becomes `None`.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use regex::Regex;
use serde_json::Value;

/// Correction added to every parsed *textual* timestamp.
///
/// The producer writes naive wall-clock values that are read back as UTC, which
/// leaves them three hours early. Drop this to zero once the write path
/// stores true UTC.
pub const STORAGE_SKEW_COMPENSATION_SECS: i64 = 3 * 60 * 60;

/// Offset of the display zone from UTC (UTC-3, no daylight saving).
pub const DISPLAY_UTC_OFFSET_SECS: i64 = -3 * 60 * 60;

/// Rendered in place of a missing instant.
pub const NO_DATE: &str = "No date";

static BR_DATE_TIME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(\d{2})/(\d{2})/(\d{4}) (\d{2}):(\d{2})$").ok());

/// Any of the encodings a timestamp may arrive in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawTimestamp<'a> {
    Text(&'a str),
    Millis(i64),
    Instant(DateTime<Utc>),
    Missing,
}

impl<'a> From<&'a str> for RawTimestamp<'a> {
    fn from(value: &'a str) -> Self {
        RawTimestamp::Text(value)
    }
}

impl<'a> From<&'a String> for RawTimestamp<'a> {
    fn from(value: &'a String) -> Self {
        RawTimestamp::Text(value.as_str())
    }
}

impl From<i64> for RawTimestamp<'_> {
    fn from(value: i64) -> Self {
        RawTimestamp::Millis(value)
    }
}

impl From<DateTime<Utc>> for RawTimestamp<'_> {
    fn from(value: DateTime<Utc>) -> Self {
        RawTimestamp::Instant(value)
    }
}

impl<'a, T: Into<RawTimestamp<'a>>> From<Option<T>> for RawTimestamp<'a> {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(RawTimestamp::Missing)
    }
}

/// Convert any supported encoding into a canonical UTC instant.
///
/// Numbers and instants are taken as-is. Text without an offset is read as
/// UTC, and all text then gets [`STORAGE_SKEW_COMPENSATION_SECS`] added.
pub fn normalize<'a>(input: impl Into<RawTimestamp<'a>>) -> Option<DateTime<Utc>> {
    match input.into() {
        RawTimestamp::Missing => None,
        RawTimestamp::Instant(instant) => Some(instant),
        RawTimestamp::Millis(ms) => DateTime::from_timestamp_millis(ms),
        RawTimestamp::Text(text) => parse_text(text)
            .and_then(|parsed| parsed.checked_add_signed(storage_skew_compensation())),
    }
}

/// A naive `created_at` column value, corrected the same way as its textual
/// form would be.
pub fn normalize_stored(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    naive
        .and_utc()
        .checked_add_signed(storage_skew_compensation())
}

/// [`normalize`] over an untyped JSON value, as found in HTTP payloads.
pub fn normalize_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => normalize(text.as_str()),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .and_then(|ms| normalize(ms)),
        _ => None,
    }
}

/// Format as `DD/MM/YYYY HH:mm` in the display zone, or [`NO_DATE`].
pub fn to_display_string(instant: Option<DateTime<Utc>>) -> String {
    match instant.and_then(display_local) {
        Some(local) => local.format("%d/%m/%Y %H:%M").to_string(),
        None => NO_DATE.to_string(),
    }
}

/// Calendar day (`YYYY-MM-DD`) in the display zone. Zero padded, so buckets
/// sort lexicographically in chronological order.
pub fn to_date_bucket(instant: Option<DateTime<Utc>>) -> Option<String> {
    instant
        .and_then(display_local)
        .map(|local| local.format("%Y-%m-%d").to_string())
}

fn storage_skew_compensation() -> TimeDelta {
    TimeDelta::seconds(STORAGE_SKEW_COMPENSATION_SECS)
}

fn display_local(instant: DateTime<Utc>) -> Option<NaiveDateTime> {
    instant
        .naive_utc()
        .checked_add_signed(TimeDelta::seconds(DISPLAY_UTC_OFFSET_SECS))
}

fn parse_text(raw: &str) -> Option<DateTime<Utc>> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(caps) = BR_DATE_TIME.as_ref().and_then(|re| re.captures(text)) {
        let field = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
        let year = caps.get(3).and_then(|m| m.as_str().parse::<i32>().ok())?;
        let date = NaiveDate::from_ymd_opt(year, field(2)?, field(1)?)?;
        return date.and_hms_opt(field(4)?, field(5)?, 0).map(|n| n.and_utc());
    }

    if let Ok(with_offset) = DateTime::parse_from_rfc3339(text) {
        return Some(with_offset.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(with_offset) = DateTime::parse_from_str(text, format) {
            return Some(with_offset.with_timezone(&Utc));
        }
    }

    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
