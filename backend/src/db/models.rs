use airiq_common::req::{IngestPayload, SensorPatch};
use diesel::prelude::*;

use crate::error::{Result, StoreError};
use crate::schema::{readings, sensors};
use crate::utils::to_millis;

pub const DEFAULT_STATUS: &str = "active";

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable)]
#[diesel(table_name = sensors)]
pub struct Sensor {
    pub id: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub location_label: Option<String>,
    pub installed_at: i64, // ms since epoch
    pub status: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = sensors)]
pub struct NewSensor {
    pub id: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub location_label: Option<String>,
    pub installed_at: i64,
    pub status: String,
}

impl NewSensor {
    /// A bare sensor as created on first contact.
    pub fn with_id(id: impl Into<String>, installed_at: i64) -> Self {
        Self {
            id: id.into(),
            name: None,
            model: None,
            lat: None,
            lon: None,
            location_label: None,
            installed_at,
            status: DEFAULT_STATUS.to_string(),
        }
    }
}

/// Only `Some` fields are written; `Some(None)` stores NULL.
#[derive(Debug, Clone, Default, PartialEq, AsChangeset)]
#[diesel(table_name = sensors)]
pub struct SensorChanges {
    pub name: Option<Option<String>>,
    pub model: Option<Option<String>>,
    pub lat: Option<Option<f64>>,
    pub lon: Option<Option<f64>>,
    pub location_label: Option<Option<String>>,
    pub status: Option<String>,
}

impl SensorChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl TryFrom<SensorPatch> for SensorChanges {
    type Error = StoreError;

    fn try_from(patch: SensorPatch) -> Result<Self> {
        let status = match patch.status {
            Some(None) => return Err(StoreError::Validation("status cannot be null".into())),
            Some(Some(status)) if status.trim().is_empty() => {
                return Err(StoreError::Validation("status cannot be empty".into()))
            }
            status => status.flatten(),
        };
        Ok(Self {
            name: patch.name,
            model: patch.model,
            lat: patch.lat,
            lon: patch.lon,
            location_label: patch.location_label,
            status,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, QueryableByName, Identifiable)]
#[diesel(table_name = readings)]
pub struct Reading {
    pub id: i64,
    pub sensor_id: String,
    pub ts: i64, // ms since epoch
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub co2: Option<f64>,
    pub no2: Option<f64>,
    pub temp_c: Option<f64>,
    pub rh: Option<f64>,
    pub battery: Option<f64>,
    pub firmware: Option<String>,
    pub raw_json: String,
}

#[derive(Debug, Clone, Default, Insertable)]
#[diesel(table_name = readings)]
pub struct NewReading {
    pub sensor_id: String,
    pub ts: i64,
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub co2: Option<f64>,
    pub no2: Option<f64>,
    pub temp_c: Option<f64>,
    pub rh: Option<f64>,
    pub battery: Option<f64>,
    pub firmware: Option<String>,
    pub raw_json: String,
}

impl TryFrom<&IngestPayload> for NewReading {
    type Error = StoreError;

    fn try_from(payload: &IngestPayload) -> Result<Self> {
        let raw_json = serde_json::to_string(payload)
            .map_err(|err| StoreError::Validation(format!("payload not serializable: {err}")))?;
        Ok(Self {
            sensor_id: payload.sensor_id.clone(),
            ts: to_millis(payload.ts),
            pm25: payload.pm25,
            pm10: payload.pm10,
            co2: payload.co2,
            no2: payload.no2,
            temp_c: payload.temp_c,
            rh: payload.rh,
            battery: payload.battery,
            firmware: payload.firmware.clone(),
            raw_json,
        })
    }
}
