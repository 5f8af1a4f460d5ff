use airiq_common::aqi::classify;
use airiq_common::req::{IngestPayload, IngestResponse};
use log::info;

use crate::db::models::{NewReading, NewSensor};
use crate::db::Store;
use crate::error::{Result, StoreError};
use crate::utils::{from_millis, ms_since_epoch};

/// Records one telemetry sample, registering the sensor on first contact.
///
/// The AQI is computed for the response only; the stored reading keeps the raw `pm25`.
/// The echoed timestamp is the stored one, at millisecond precision.
pub async fn ingest(store: &Store, payload: IngestPayload) -> Result<IngestResponse> {
    if payload.sensor_id.trim().is_empty() {
        return Err(StoreError::Validation("sensor_id must not be empty".into()));
    }

    let reading = NewReading::try_from(&payload)?;
    let sensor = NewSensor::with_id(payload.sensor_id.clone(), ms_since_epoch());
    let (aqi, aqi_category) = classify(payload.pm25);

    let (_, stored) = store
        .run(move |store| store.append(&sensor, &reading))
        .await?;
    info!(
        "ingested reading {} from {} (pm25={:?}, aqi={:?})",
        stored.id, stored.sensor_id, payload.pm25, aqi
    );

    Ok(IngestResponse {
        ok: true,
        timestamp: from_millis(stored.ts)?.to_rfc3339(),
        sensor_id: stored.sensor_id,
        aqi,
        aqi_category,
    })
}
