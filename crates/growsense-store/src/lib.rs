//! SQLite persistence for GrowSense plant sensors.
//!
//! Every operation is scoped to a `(user, device)` pair: a user can only
//! see readings, devices, and advice they own.
//!
//! # Features
//!
//! - Append readings with a server-assigned timestamp
//! - Register devices with an API key and per-device sleep settings
//! - Query readings by user, device, and time range, with pagination
//! - Hour-bucketed sparse history for trend charts
//! - Advice history persistence
//! - CSV export
//!
//! The [`Store`] implements [`growsense_types::ReadingSource`] and
//! [`growsense_types::AdviceSink`], which is how the readings cache and the
//! advice pipeline reach it.
//!
//! # Example
//!
//! ```
//! use growsense_store::{ReadingQuery, Store};
//! use growsense_types::{Reading, SensorField};
//! use time::OffsetDateTime;
//!
//! let store = Store::open_in_memory()?;
//! store.register_device("user-1", "esp32_001", "secret", Some("Basil"))?;
//!
//! let reading = Reading::new(OffsetDateTime::now_utc())
//!     .with_field(SensorField::SoilMoisture, 42.0);
//! store.write_reading("user-1", "esp32_001", &reading)?;
//!
//! let query = ReadingQuery::new("user-1").device("esp32_001").limit(10);
//! let readings = store.query_readings(&query)?;
//! assert_eq!(readings.len(), 1);
//! # Ok::<(), growsense_store::Error>(())
//! ```

mod error;
mod models;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{DeviceCredentials, RegisterOutcome};
pub use queries::ReadingQuery;
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/growsense/data.db`
/// - macOS: `~/Library/Application Support/growsense/data.db`
/// - Windows: `C:\Users\<user>\AppData\Local\growsense\data.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("growsense")
        .join("data.db")
}
