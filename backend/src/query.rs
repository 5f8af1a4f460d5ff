//! Read side: the views handed to clients, with the AQI attached where it is surfaced.

use std::collections::HashMap;

use airiq_common::aqi::classify;
use airiq_common::req::{
    FleetPoint, RangeQuery, ReadingView, SensorOut, SensorPatch, MAX_RANGE_LIMIT,
};
use log::{debug, warn};

use crate::db::models::{Reading, Sensor, SensorChanges};
use crate::db::{RangeFilter, Store};
use crate::error::{Result, StoreError};
use crate::utils::from_millis;

/// History rows carry raw measurements only, AQI fields are left empty.
fn reading_view(reading: Reading) -> Result<ReadingView> {
    Ok(ReadingView {
        ts: from_millis(reading.ts)?,
        sensor_id: reading.sensor_id,
        pm25: reading.pm25,
        pm10: reading.pm10,
        co2: reading.co2,
        no2: reading.no2,
        temp_c: reading.temp_c,
        rh: reading.rh,
        battery: reading.battery,
        firmware: reading.firmware,
        aqi_pm25: None,
        aqi_category: None,
    })
}

fn classified_view(reading: Reading) -> Result<ReadingView> {
    let (aqi_pm25, aqi_category) = classify(reading.pm25);
    Ok(ReadingView {
        aqi_pm25,
        aqi_category,
        ..reading_view(reading)?
    })
}

fn fleet_point(reading: Reading, sensor: &Sensor) -> Result<FleetPoint> {
    let (aqi_pm25, aqi_category) = classify(reading.pm25);
    Ok(FleetPoint {
        ts: from_millis(reading.ts)?,
        sensor_id: reading.sensor_id,
        pm25: reading.pm25,
        pm10: reading.pm10,
        co2: reading.co2,
        no2: reading.no2,
        temp_c: reading.temp_c,
        rh: reading.rh,
        aqi_pm25,
        aqi_category,
        lat: sensor.lat,
        lon: sensor.lon,
        location_label: sensor.location_label.clone(),
    })
}

impl From<Sensor> for SensorOut {
    fn from(sensor: Sensor) -> Self {
        Self {
            id: sensor.id,
            name: sensor.name,
            lat: sensor.lat,
            lon: sensor.lon,
            location_label: sensor.location_label,
            status: sensor.status,
        }
    }
}

pub async fn latest_for_sensor(store: &Store, sensor_id: String) -> Result<Option<ReadingView>> {
    store
        .run(move |store| store.latest_for_sensor(&sensor_id))
        .await?
        .map(classified_view)
        .transpose()
}

/// Latest reading of every sensor that has reported, joined with where the sensor is.
pub async fn fleet_snapshot(store: &Store) -> Result<Vec<FleetPoint>> {
    let (latest, sensors) = store
        .run(|store| Ok((store.latest_for_fleet()?, store.list_sensors()?)))
        .await?;
    let sensors: HashMap<String, Sensor> = sensors
        .into_iter()
        .map(|sensor| (sensor.id.clone(), sensor))
        .collect();

    let mut points = Vec::with_capacity(latest.len());
    for reading in latest {
        match sensors.get(&reading.sensor_id) {
            Some(sensor) => points.push(fleet_point(reading, sensor)?),
            None => warn!("reading {} references unknown sensor {}", reading.id, reading.sensor_id),
        }
    }
    debug!("fleet snapshot with {} sensors", points.len());
    Ok(points)
}

pub async fn range(store: &Store, query: RangeQuery) -> Result<Vec<ReadingView>> {
    if !(1..=MAX_RANGE_LIMIT).contains(&query.limit) {
        return Err(StoreError::Validation(format!(
            "limit must be between 1 and {MAX_RANGE_LIMIT}, got {}",
            query.limit
        )));
    }
    if let (Some(start), Some(end)) = (query.start, query.end) {
        if start > end {
            return Err(StoreError::Validation("start is after end".into()));
        }
    }

    let filter = RangeFilter {
        sensor_id: query.sensor_id.filter(|id| !id.is_empty()),
        start: query.start,
        end: query.end,
        limit: query.limit,
    };
    store
        .run(move |store| store.range_query(&filter))
        .await?
        .into_iter()
        .map(reading_view)
        .collect()
}

pub async fn list_sensors(store: &Store) -> Result<Vec<SensorOut>> {
    let sensors = store.run(|store| store.list_sensors()).await?;
    Ok(sensors.into_iter().map(SensorOut::from).collect())
}

pub async fn patch_sensor(store: &Store, id: String, patch: SensorPatch) -> Result<SensorOut> {
    let changes = SensorChanges::try_from(patch)?;
    let sensor = store
        .run(move |store| store.patch_sensor(&id, &changes))
        .await?;
    Ok(sensor.into())
}
