use chrono::{DateTime, NaiveDateTime, SecondsFormat, Timelike, Utc};

/// All instants handled by the crate are normalized to UTC.
pub type Timestamp = DateTime<Utc>;

/// Parses an ISO-8601 timestamp as sent by the weather API.
///
/// Accepts RFC 3339 with any fixed offset (`Z`, `+00:00`, `+02:00`) and, for
/// robustness, offset-less `YYYY-MM-DDTHH:MM:SS` which is read as UTC.
/// Returns `None` for anything else.
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Canonical wire form: `2025-06-01T12:00:00Z`.
pub fn format_wire_time(t: &Timestamp) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Human form used in folder names, always UTC: `01/06/2025 12:00`.
pub fn format_display_time(t: &Timestamp) -> String {
    t.format("%d/%m/%Y %H:%M").to_string()
}

/// Truncates to the top of the hour (minutes, seconds and sub-seconds zeroed).
pub fn truncate_to_hour(t: Timestamp) -> Timestamp {
    t.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// Picks the entry of `available` closest to `target`. Ties go to the earlier
/// instant so the result does not depend on input order.
pub fn nearest_time(target: Timestamp, available: &[Timestamp]) -> Option<Timestamp> {
    available
        .iter()
        .copied()
        .min_by_key(|t| ((*t - target).num_seconds().unsigned_abs(), *t))
}
