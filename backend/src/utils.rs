use chrono::{DateTime, TimeZone, Utc};
use diesel::result::Error as DieselError;

use crate::error::{Result, StoreError};

pub fn ms_since_epoch() -> i64 {
    Utc::now().timestamp_millis()
}

/// Stored precision is whole milliseconds; anything finer is dropped.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Smallest stored millisecond at or after `ts`, for inclusive lower bounds.
pub fn to_millis_ceil(ts: DateTime<Utc>) -> i64 {
    let ms = ts.timestamp_millis();
    if ts.timestamp_subsec_nanos() % 1_000_000 == 0 {
        ms
    } else {
        ms + 1
    }
}

pub fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        StoreError::Database(DieselError::DeserializationError(
            format!("timestamp {ms} out of range").into(),
        ))
    })
}
