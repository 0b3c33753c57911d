//! Row types bridging SQLite columns and the shared data model.

use rusqlite::Row;
use serde::Serialize;
use time::OffsetDateTime;

use growsense_types::{DeviceMetadata, Priority, Reading};

use crate::error::{Error, Result};

/// Ownership and key of a registered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub user_id: String,
    pub api_key: String,
}

/// Result of [`Store::register_device`](crate::Store::register_device).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// New device row.
    Created,
    /// Same user re-registered the device; key and name were refreshed.
    Updated,
}

pub(crate) fn from_millis(ms: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|e| Error::InvalidTimestamp(format!("{ms}: {e}")))
}

/// A reading row as stored; timestamps are still raw milliseconds.
pub(crate) struct ReadingRow {
    id: i64,
    device_id: String,
    timestamp: Option<i64>,
    server_timestamp: i64,
    temperature: Option<f64>,
    humidity: Option<f64>,
    light: Option<f64>,
    soil_moisture: Option<f64>,
    uv_light: Option<f64>,
    raw_json: Option<String>,
}

impl ReadingRow {
    /// Map a row selected with [`READING_COLUMNS`](crate::queries::READING_COLUMNS).
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            device_id: row.get(1)?,
            timestamp: row.get(2)?,
            server_timestamp: row.get(3)?,
            temperature: row.get(4)?,
            humidity: row.get(5)?,
            light: row.get(6)?,
            soil_moisture: row.get(7)?,
            uv_light: row.get(8)?,
            raw_json: row.get(9)?,
        })
    }

    pub(crate) fn into_reading(self) -> Result<Reading> {
        let raw = match self.raw_json {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        };
        Ok(Reading {
            id: Some(self.id.to_string()),
            device_id: Some(self.device_id),
            timestamp: self.timestamp.map(from_millis).transpose()?,
            server_timestamp: from_millis(self.server_timestamp)?,
            temperature: self.temperature,
            humidity: self.humidity,
            light: self.light,
            soil_moisture: self.soil_moisture,
            uv_light: self.uv_light,
            raw,
        })
    }
}

pub(crate) const DEVICE_COLUMNS: &str = "id, name, description, last_seen, target_interval, \
     adaptive_sleep_enabled, plant_health_score, last_advice_priority, registered_at";

pub(crate) struct DeviceRow {
    id: String,
    name: String,
    description: Option<String>,
    last_seen: Option<i64>,
    target_interval: Option<i64>,
    adaptive_sleep_enabled: bool,
    plant_health_score: Option<f64>,
    last_advice_priority: Option<String>,
    registered_at: i64,
}

impl DeviceRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            last_seen: row.get(3)?,
            target_interval: row.get(4)?,
            adaptive_sleep_enabled: row.get(5)?,
            plant_health_score: row.get(6)?,
            last_advice_priority: row.get(7)?,
            registered_at: row.get(8)?,
        })
    }

    pub(crate) fn into_metadata(self) -> Result<DeviceMetadata> {
        Ok(DeviceMetadata {
            device_id: self.id,
            name: self.name,
            description: self.description,
            last_seen: self.last_seen.map(from_millis).transpose()?,
            target_interval: self.target_interval.and_then(|v| u32::try_from(v).ok()),
            adaptive_sleep_enabled: self.adaptive_sleep_enabled,
            plant_health_score: self.plant_health_score,
            last_advice_priority: self.last_advice_priority.as_deref().and_then(Priority::parse),
            registered_at: Some(from_millis(self.registered_at)?),
        })
    }
}

/// One CSV line of a readings export.
#[derive(Debug, Serialize)]
pub(crate) struct ExportRow<'a> {
    pub server_timestamp: String,
    pub device_timestamp: String,
    pub device_id: &'a str,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub light_lux: Option<f64>,
    pub soil_moisture_pct: Option<f64>,
    pub uv_index: Option<f64>,
}

impl<'a> ExportRow<'a> {
    pub(crate) fn from_reading(reading: &'a Reading) -> Self {
        use time::format_description::well_known::Rfc3339;

        Self {
            server_timestamp: reading.server_timestamp.format(&Rfc3339).unwrap_or_default(),
            device_timestamp: reading
                .timestamp
                .and_then(|ts| ts.format(&Rfc3339).ok())
                .unwrap_or_default(),
            device_id: reading.device_id.as_deref().unwrap_or_default(),
            temperature_c: reading.temperature,
            humidity_pct: reading.humidity,
            light_lux: reading.light,
            soil_moisture_pct: reading.soil_moisture,
            uv_index: reading.uv_index(),
        }
    }
}
