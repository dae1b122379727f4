use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

const ROTATED_TIMESTAMP: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]-[minute]-[second]UTC");

/// Parsed form of `<stem>.<timestamp>.<seq>.log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatedLogName {
    pub stem: String,
    pub timestamp_utc: OffsetDateTime,
    pub seq: u16,
}

pub fn format_rotated_filename(stem: &str, timestamp_utc: OffsetDateTime, seq: u16) -> String {
    let ts = timestamp_utc
        .format(ROTATED_TIMESTAMP)
        .unwrap_or_else(|_| "1970-01-01T00-00-00UTC".to_string());
    format!("{stem}.{ts}.{seq:03}.log")
}

pub fn parse_rotated_filename(file_name: &str, expected_stem: &str) -> Option<RotatedLogName> {
    let middle = file_name
        .strip_prefix(expected_stem)?
        .strip_prefix('.')?
        .strip_suffix(".log")?;
    let (ts_raw, seq_raw) = middle.rsplit_once('.')?;
    if seq_raw.len() != 3 || !seq_raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let timestamp_utc = PrimitiveDateTime::parse(ts_raw, ROTATED_TIMESTAMP)
        .ok()?
        .assume_utc();
    Some(RotatedLogName {
        stem: expected_stem.to_string(),
        timestamp_utc,
        seq: seq_raw.parse().ok()?,
    })
}
