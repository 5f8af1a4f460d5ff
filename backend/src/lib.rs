//! AirIQ backend: stores air quality telemetry from field sensors and serves the
//! latest, fleet and history views derived from it.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod query;
pub mod schema;
pub mod utils;
