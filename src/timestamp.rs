//! Timestamp and duration parsing for report fields.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Epoch values above this are milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 1_000_000_000_000;
/// Epoch values above this are seconds; smaller integers are not timestamps.
const EPOCH_SECS_THRESHOLD: i64 = 1_000_000_000;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
];

/// Parses a report timestamp into a UTC instant.
///
/// Accepts epoch seconds, epoch milliseconds, RFC 3339, and a few naive
/// layouts (read as UTC). Returns `None` for anything else.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if s.bytes().all(|b| b.is_ascii_digit()) {
        let val: i64 = s.parse().ok()?;
        return if val > EPOCH_MILLIS_THRESHOLD {
            Utc.timestamp_millis_opt(val).single()
        } else if val > EPOCH_SECS_THRESHOLD {
            Utc.timestamp_opt(val, 0).single()
        } else {
            None
        };
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Cellebrite writes offsets without the colon: 2019-03-05T10:22:01.000+0000
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Parses a call duration: whole seconds, fractional seconds, or `[HH:]MM:SS`.
pub fn parse_duration_secs(raw: &str) -> Option<u64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(secs);
    }
    if let Ok(secs) = s.parse::<f64>() {
        return (secs.is_finite() && secs >= 0.0).then(|| secs.round() as u64);
    }

    let parts: Vec<&str> = s.split(':').collect();
    if !(2..=3).contains(&parts.len()) {
        return None;
    }
    let mut total = 0u64;
    for part in parts {
        let n: u64 = part.parse().ok()?;
        total = total.checked_mul(60)?.checked_add(n)?;
    }
    Some(total)
}
