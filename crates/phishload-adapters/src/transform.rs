use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use phishload_core::{NormalizedRecord, RawRow};

/// Lowercased `verified` values that count as verified.
pub const TRUTHY_TOKENS: [&str; 3] = ["yes", "y", "true"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    MissingPhishId,
    MissingUrl,
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardReason::MissingPhishId => write!(f, "missing phish_id"),
            DiscardReason::MissingUrl => write!(f, "missing url"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformed {
    Accepted(NormalizedRecord),
    Discarded(DiscardReason),
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// Strict ISO-8601: RFC 3339, a naive date-time taken as UTC, or a bare date.
pub fn parse_submission_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn is_verified(raw: Option<&str>) -> bool {
    let lowered = raw.unwrap_or_default().to_lowercase();
    TRUTHY_TOKENS.contains(&lowered.as_str())
}

pub fn transform(row: &RawRow) -> Transformed {
    transform_at(row, Utc::now())
}

/// Only a blank key or url rejects a row; every other field degrades.
pub fn transform_at(row: &RawRow, now: DateTime<Utc>) -> Transformed {
    let Some(phish_id) = non_blank(row.phish_id.as_deref()) else {
        return Transformed::Discarded(DiscardReason::MissingPhishId);
    };
    let Some(url) = non_blank(row.url.as_deref()) else {
        return Transformed::Discarded(DiscardReason::MissingUrl);
    };

    let submission_time = row
        .submission_time
        .as_deref()
        .filter(|raw| !raw.is_empty())
        .and_then(parse_submission_time);

    Transformed::Accepted(NormalizedRecord {
        phish_id,
        url,
        submission_time,
        verified: is_verified(row.verified.as_deref()),
        ingested_at: now,
    })
}
