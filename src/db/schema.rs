//! Column conversions shared by the repositories.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use std::str::FromStr;

/// Timestamps are stored as microseconds since the Unix epoch.
pub fn datetime_to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}

/// Parse a text column with `FromStr`, reporting failures as conversion errors.
pub(crate) fn parse_column<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid value '{}': {}", raw, e).into(),
        )
    })
}

/// Parse a JSON text column.
pub(crate) fn json_column(idx: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
