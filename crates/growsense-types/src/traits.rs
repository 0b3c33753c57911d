//! Seams between the cache/advice pipeline and a backing store.
//!
//! The core crate is generic over these traits so it can be driven by the
//! SQLite store in production and by in-memory fakes in tests.

use time::OffsetDateTime;

use crate::advice::AdviceRecord;
use crate::types::{DeviceMetadata, Reading};

/// Read access to devices and readings.
pub trait ReadingSource {
    type Error: std::error::Error + Send + Sync + 'static;

    /// All devices owned by a user.
    fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceMetadata>, Self::Error>;

    /// Up to `limit` readings for a device, newest first by server timestamp.
    fn recent_readings(
        &self,
        user_id: &str,
        device_id: &str,
        limit: u32,
    ) -> Result<Vec<Reading>, Self::Error>;

    /// Earliest and latest server timestamps for a device, if it has readings.
    fn reading_bounds(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<(OffsetDateTime, OffsetDateTime)>, Self::Error>;

    /// Latest reading at or before `at`.
    fn latest_reading_before(
        &self,
        user_id: &str,
        device_id: &str,
        at: OffsetDateTime,
    ) -> Result<Option<Reading>, Self::Error>;
}

/// Persistence for generated advice.
pub trait AdviceSink {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Persist one advice record for a user.
    fn save_advice(&mut self, user_id: &str, record: &AdviceRecord) -> Result<(), Self::Error>;

    /// Up to `limit` most recent records, newest first.
    fn recent_advice(&self, user_id: &str, limit: u32) -> Result<Vec<AdviceRecord>, Self::Error>;
}
