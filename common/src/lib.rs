//! Types shared between the backend and its clients.

pub mod aqi;
pub mod req;
