//! Shared data model for GrowSense plant sensors.
//!
//! This crate holds the types exchanged between the backing store, the
//! readings cache, the advice pipeline, and the HTTP service:
//!
//! - [`Reading`]: one timestamped sensor sample with optional measurements
//! - [`DeviceMetadata`]: per-device identity, description, and sleep settings
//! - [`PerDeviceBuffer`]: the `recent` / `historic` reading pair kept per device
//! - [`AdviceResult`] and [`AdviceRecord`]: structured care advice
//! - [`ReadingSource`] and [`AdviceSink`]: the seams a backing store implements
//!
//! # Example
//!
//! ```
//! use growsense_types::{Reading, SensorField};
//! use time::macros::datetime;
//!
//! let reading = Reading::new(datetime!(2024-11-29 10:00 UTC))
//!     .with_field(SensorField::Temperature, 23.5)
//!     .with_field(SensorField::SoilMoisture, 41.0);
//!
//! assert_eq!(reading.value(SensorField::Temperature), Some(23.5));
//! assert_eq!(reading.value(SensorField::Humidity), None);
//! ```

pub mod advice;
pub mod error;
pub mod traits;
pub mod types;
pub mod validation;

pub use advice::{AdviceRecord, AdviceResult, AdviceSource, DeviceAdvice, Priority};
pub use error::{ValidationError, ValidationResult};
pub use traits::{AdviceSink, ReadingSource};
pub use types::{DeviceMetadata, DeviceMetadataUpdate, PerDeviceBuffer, Reading, SensorField};
