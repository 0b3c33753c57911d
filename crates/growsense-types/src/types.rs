//! Core types for sensor readings and device metadata.

use core::fmt;
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::advice::Priority;

/// A measurement a device may report.
///
/// Every field is optional on a [`Reading`]; a sensor that did not report
/// a value leaves it absent instead of zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorField {
    /// Air temperature in °C.
    Temperature,
    /// Relative humidity in %.
    Humidity,
    /// Illuminance in lux.
    Light,
    /// Soil moisture in %.
    SoilMoisture,
    /// UV index.
    Uv,
}

impl SensorField {
    /// All fields in reporting order.
    pub const ALL: [SensorField; 5] = [
        SensorField::Temperature,
        SensorField::Humidity,
        SensorField::Light,
        SensorField::SoilMoisture,
        SensorField::Uv,
    ];

    /// Wire name of the field, also used as the suffix of summary keys
    /// (`avg_temperature`, `min_soil_moisture`, ...).
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            SensorField::Temperature => "temperature",
            SensorField::Humidity => "humidity",
            SensorField::Light => "light",
            SensorField::SoilMoisture => "soil_moisture",
            SensorField::Uv => "uv_light",
        }
    }

    /// Unit label for prompts and exports.
    #[must_use]
    pub fn unit(self) -> &'static str {
        match self {
            SensorField::Temperature => "°C",
            SensorField::Humidity | SensorField::SoilMoisture => "%",
            SensorField::Light => "lux",
            SensorField::Uv => "index",
        }
    }
}

impl fmt::Display for SensorField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One sensor sample for a device.
///
/// `server_timestamp` is assigned on ingestion and is the authoritative
/// ordering key; `timestamp` is whatever the device reported, if anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Backing-store identifier, once written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Owning device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Device-reported capture time.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub timestamp: Option<OffsetDateTime>,
    /// Server-assigned ingestion time.
    #[serde(with = "time::serde::rfc3339")]
    pub server_timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soil_moisture: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uv_light: Option<f64>,
    /// Original upload payload, kept for debugging.
    #[serde(default, rename = "raw_json", skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl Reading {
    /// Create an empty reading ingested at `server_timestamp`.
    pub fn new(server_timestamp: OffsetDateTime) -> Self {
        Self {
            id: None,
            device_id: None,
            timestamp: None,
            server_timestamp,
            temperature: None,
            humidity: None,
            light: None,
            soil_moisture: None,
            uv_light: None,
            raw: None,
        }
    }

    /// Set the backing-store identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the owning device.
    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Set the device-reported timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set one measurement.
    #[must_use]
    pub fn with_field(mut self, field: SensorField, value: f64) -> Self {
        *self.slot_mut(field) = Some(value);
        self
    }

    /// Attach the raw upload payload.
    #[must_use]
    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }

    fn slot_mut(&mut self, field: SensorField) -> &mut Option<f64> {
        match field {
            SensorField::Temperature => &mut self.temperature,
            SensorField::Humidity => &mut self.humidity,
            SensorField::Light => &mut self.light,
            SensorField::SoilMoisture => &mut self.soil_moisture,
            SensorField::Uv => &mut self.uv_light,
        }
    }

    /// Value of a measurement, if the device reported it.
    ///
    /// For [`SensorField::Uv`] this falls back to the raw payload, see
    /// [`Reading::uv_index`].
    #[must_use]
    pub fn value(&self, field: SensorField) -> Option<f64> {
        match field {
            SensorField::Temperature => self.temperature,
            SensorField::Humidity => self.humidity,
            SensorField::Light => self.light,
            SensorField::SoilMoisture => self.soil_moisture,
            SensorField::Uv => self.uv_index(),
        }
    }

    /// UV index, preferring the top-level field over `raw_json.uv_light`.
    #[must_use]
    pub fn uv_index(&self) -> Option<f64> {
        self.uv_light.or_else(|| {
            self.raw
                .as_ref()
                .and_then(|raw| raw.get("uv_light"))
                .and_then(serde_json::Value::as_f64)
        })
    }

    /// Whether at least one measurement is present.
    #[must_use]
    pub fn has_measurements(&self) -> bool {
        SensorField::ALL.iter().any(|f| self.value(*f).is_some())
    }
}

/// Metadata for a registered device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub device_id: String,
    /// Display name (defaults to the device id).
    pub name: String,
    /// Free-text description, at most 1500 characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    /// Manual sleep interval in seconds.
    #[serde(default)]
    pub target_interval: Option<u32>,
    #[serde(default)]
    pub adaptive_sleep_enabled: bool,
    #[serde(default)]
    pub plant_health_score: Option<f64>,
    #[serde(default)]
    pub last_advice_priority: Option<Priority>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub registered_at: Option<OffsetDateTime>,
}

impl DeviceMetadata {
    /// Metadata with only an identifier; the name mirrors the id.
    pub fn new(device_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        Self {
            name: device_id.clone(),
            device_id,
            description: None,
            last_seen: None,
            target_interval: None,
            adaptive_sleep_enabled: false,
            plant_health_score: None,
            last_advice_priority: None,
            registered_at: None,
        }
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: &DeviceMetadataUpdate) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(description) = &update.description {
            self.description = description.clone();
        }
        if let Some(last_seen) = update.last_seen {
            self.last_seen = Some(last_seen);
        }
        if let Some(interval) = update.target_interval {
            self.target_interval = Some(interval);
        }
        if let Some(enabled) = update.adaptive_sleep_enabled {
            self.adaptive_sleep_enabled = enabled;
        }
        if let Some(score) = update.plant_health_score {
            self.plant_health_score = Some(score);
        }
        if let Some(priority) = update.last_advice_priority {
            self.last_advice_priority = Some(priority);
        }
    }
}

/// Partial update of [`DeviceMetadata`]; `None` leaves a field untouched.
///
/// `description` is doubly optional so it can be cleared with `Some(None)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMetadataUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub last_seen: Option<OffsetDateTime>,
    pub target_interval: Option<u32>,
    pub adaptive_sleep_enabled: Option<bool>,
    pub plant_health_score: Option<f64>,
    pub last_advice_priority: Option<Priority>,
}

impl DeviceMetadataUpdate {
    /// Update that only refreshes `last_seen`.
    pub fn last_seen(at: OffsetDateTime) -> Self {
        Self {
            last_seen: Some(at),
            ..Default::default()
        }
    }

    /// Whether applying this update would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Cached readings for one device.
///
/// `recent` is newest-first and capacity-bounded by the cache; `historic`
/// holds time-spaced samples filled once per cache population.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerDeviceBuffer {
    pub recent: VecDeque<Reading>,
    pub historic: Vec<Reading>,
}

impl PerDeviceBuffer {
    /// Create a buffer pair from newest-first recent readings and historic samples.
    pub fn new(recent: impl IntoIterator<Item = Reading>, historic: Vec<Reading>) -> Self {
        Self {
            recent: recent.into_iter().collect(),
            historic,
        }
    }

    /// Insert a reading at the front of `recent`, then cap it at `max`.
    ///
    /// A reading whose `id` is already buffered is skipped; returns whether
    /// it was inserted.
    pub fn push_recent(&mut self, reading: Reading, max: usize) -> bool {
        if let Some(id) = reading.id.as_deref()
            && self.recent.iter().any(|r| r.id.as_deref() == Some(id))
        {
            return false;
        }
        self.recent.push_front(reading);
        self.recent.truncate(max);
        true
    }

    /// Cap both views at `max` readings, keeping the leading ones.
    pub fn truncate(&mut self, max: usize) {
        self.recent.truncate(max);
        self.historic.truncate(max);
    }

    /// Total readings held across both views.
    #[must_use]
    pub fn len(&self) -> usize {
        self.recent.len() + self.historic.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recent.is_empty() && self.historic.is_empty()
    }
}
