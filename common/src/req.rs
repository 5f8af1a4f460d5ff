use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};

use crate::aqi::AqiCategory;

pub const DEFAULT_RANGE_LIMIT: i64 = 5000;
pub const MAX_RANGE_LIMIT: i64 = 20000;

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct IngestPayload {
    pub sensor_id: String,
    #[serde(deserialize_with = "timestamp")]
    pub ts: DateTime<Utc>,    // device clock
    pub pm25: Option<f64>,    // µg/m³
    pub pm10: Option<f64>,    // µg/m³
    pub co2: Option<f64>,     // ppm
    pub no2: Option<f64>,     // ppm
    pub temp_c: Option<f64>,  // °C
    pub rh: Option<f64>,      // percent
    pub battery: Option<f64>, // percent
    pub firmware: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct IngestResponse {
    pub ok: bool,
    pub sensor_id: String,
    pub aqi: Option<i32>,
    pub aqi_category: Option<AqiCategory>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SensorOut {
    pub id: String,
    pub name: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub location_label: Option<String>,
    pub status: String,
}

/// Partial sensor update.
///
/// The outer `Option` tells whether a key was sent at all, the inner one carries an
/// explicit `null`. Absent keys leave the stored value alone, `null` clears it.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct SensorPatch {
    #[serde(default, deserialize_with = "present")]
    pub name: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub model: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub lat: Option<Option<f64>>,
    #[serde(default, deserialize_with = "present")]
    pub lon: Option<Option<f64>>,
    #[serde(default, deserialize_with = "present")]
    pub location_label: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub status: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ReadingView {
    pub sensor_id: String,
    pub ts: DateTime<Utc>,
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub co2: Option<f64>,
    pub no2: Option<f64>,
    pub temp_c: Option<f64>,
    pub rh: Option<f64>,
    pub battery: Option<f64>,
    pub firmware: Option<String>,
    pub aqi_pm25: Option<i32>,
    pub aqi_category: Option<AqiCategory>,
}

/// One map pin: the latest reading of a sensor plus where the sensor is.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct FleetPoint {
    pub sensor_id: String,
    pub ts: DateTime<Utc>,
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub co2: Option<f64>,
    pub no2: Option<f64>,
    pub temp_c: Option<f64>,
    pub rh: Option<f64>,
    pub aqi_pm25: Option<i32>,
    pub aqi_category: Option<AqiCategory>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub location_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct RangeQuery {
    pub sensor_id: Option<String>,
    #[serde(default, deserialize_with = "optional_timestamp")]
    pub start: Option<DateTime<Utc>>, // inclusive
    #[serde(default, deserialize_with = "optional_timestamp")]
    pub end: Option<DateTime<Utc>>, // inclusive
    #[serde(default = "default_limit")]
    pub limit: i64,
}

impl Default for RangeQuery {
    fn default() -> Self {
        Self {
            sensor_id: None,
            start: None,
            end: None,
            limit: DEFAULT_RANGE_LIMIT,
        }
    }
}

fn default_limit() -> i64 {
    DEFAULT_RANGE_LIMIT
}

// ===============================================
// helpers
// ===============================================

/// Parses an RFC 3339 timestamp. A naive ISO-8601 date-time without offset is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(err) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Utc.from_utc_datetime(&naive))
            .map_err(|_| err),
    }
}

fn timestamp<'de, D>(de: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

fn optional_timestamp<'de, D>(de: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(de)? {
        Some(raw) if !raw.is_empty() => parse_timestamp(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

fn present<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_payload_accepts_offsets_and_naive_times() {
        let payload: IngestPayload = serde_json::from_str(
            r#"{"sensor_id":"RPI-ENG-HALL-01","ts":"2025-10-12T20:00:00+02:00","pm25":12.5}"#,
        )
        .expect("decode");
        assert_eq!(payload.ts, Utc.with_ymd_and_hms(2025, 10, 12, 18, 0, 0).unwrap());
        assert_eq!(payload.pm25, Some(12.5));
        assert_eq!(payload.co2, None);

        let naive: IngestPayload =
            serde_json::from_str(r#"{"sensor_id":"S1","ts":"2025-10-12T18:00:00.250"}"#)
                .expect("decode");
        assert_eq!(naive.ts.timestamp_millis(), payload.ts.timestamp_millis() + 250);
    }

    #[test]
    fn ingest_payload_requires_sensor_and_ts() {
        assert!(serde_json::from_str::<IngestPayload>(r#"{"sensor_id":"S1"}"#).is_err());
        assert!(serde_json::from_str::<IngestPayload>(r#"{"ts":"2025-10-12T18:00:00Z"}"#).is_err());
        assert!(
            serde_json::from_str::<IngestPayload>(r#"{"sensor_id":"S1","ts":"yesterday"}"#)
                .is_err()
        );
    }

    #[test]
    fn patch_distinguishes_absent_from_null() {
        let patch: SensorPatch =
            serde_json::from_str(r#"{"name":"Lobby","location_label":null}"#).expect("decode");
        assert_eq!(patch.name, Some(Some("Lobby".to_string())));
        assert_eq!(patch.location_label, Some(None));
        assert_eq!(patch.lat, None);

        let empty: SensorPatch = serde_json::from_str("{}").expect("decode");
        assert_eq!(empty, SensorPatch::default());
    }

    #[test]
    fn range_query_defaults() {
        let query: RangeQuery = serde_json::from_str("{}").expect("decode");
        assert_eq!(query, RangeQuery::default());
        assert_eq!(query.limit, DEFAULT_RANGE_LIMIT);
    }
}
