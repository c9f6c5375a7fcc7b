//! Timestamp parsing for label metadata and scene identifiers.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;

/// Naive formats tried after RFC 3339, interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y%m%dT%H%M%S"];

/// Parse a timestamp as found in label files.
///
/// Accepts RFC 3339 (`2018-10-07T17:02:42.000Z`, `...+00:00`), a compact
/// `+0000` offset, naive date-times (taken as UTC), and plain dates
/// (midnight UTC).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn scene_date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // 8 date digits, 'T', 6 time digits: S1A_IW_SLC__1SDV_20230101T054512_...
    PATTERN.get_or_init(|| Regex::new(r"\d{8}T\d{6}").unwrap())
}

/// Extract the acquisition start time embedded in a scene identifier.
///
/// Returns the first `YYYYMMDDTHHMMSS` group, or `None` if there is none or
/// it is not a valid date.
pub fn extract_scene_date(scene_id: &str) -> Option<DateTime<Utc>> {
    let found = scene_date_pattern().find(scene_id)?;
    NaiveDateTime::parse_from_str(found.as_str(), "%Y%m%dT%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}
