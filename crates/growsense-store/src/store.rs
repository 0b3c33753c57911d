//! Main store implementation.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::{debug, info};

use growsense_types::{
    AdviceRecord, AdviceSink, AdviceSource, DeviceMetadata, DeviceMetadataUpdate, Priority,
    Reading, ReadingSource,
};

use crate::error::{Error, Result};
use crate::models::{
    DEVICE_COLUMNS, DeviceCredentials, DeviceRow, ExportRow, ReadingRow, RegisterOutcome,
    from_millis,
};
use crate::queries::{READING_COLUMNS, ReadingQuery, to_millis};
use crate::schema;

const HOUR_MS: i64 = 3_600_000;

/// SQLite-based store for GrowSense data.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }
}

// Device operations
impl Store {
    /// Register a device for a user.
    ///
    /// Re-registering a device the user already owns refreshes its API key
    /// (and name, when given). A device owned by someone else is rejected.
    pub fn register_device(
        &self,
        user_id: &str,
        device_id: &str,
        api_key: &str,
        name: Option<&str>,
    ) -> Result<RegisterOutcome> {
        match self.device_credentials(device_id)? {
            Some(existing) if existing.user_id != user_id => {
                Err(Error::DeviceOwnedByOtherUser(device_id.to_string()))
            }
            Some(_) => {
                self.conn.execute(
                    "UPDATE devices SET api_key = ?2, name = COALESCE(?3, name) WHERE id = ?1",
                    rusqlite::params![device_id, api_key, name],
                )?;
                info!("Re-registered device {} for {}", device_id, user_id);
                Ok(RegisterOutcome::Updated)
            }
            None => {
                self.conn.execute(
                    "INSERT INTO devices (id, user_id, api_key, name, registered_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        device_id,
                        user_id,
                        api_key,
                        name.unwrap_or(device_id),
                        to_millis(OffsetDateTime::now_utc()),
                    ],
                )?;
                info!("Registered device {} for {}", device_id, user_id);
                Ok(RegisterOutcome::Created)
            }
        }
    }

    /// Owner and API key of a device, regardless of user.
    pub fn device_credentials(&self, device_id: &str) -> Result<Option<DeviceCredentials>> {
        let creds = self
            .conn
            .query_row(
                "SELECT user_id, api_key FROM devices WHERE id = ?",
                [device_id],
                |row| {
                    Ok(DeviceCredentials {
                        user_id: row.get(0)?,
                        api_key: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(creds)
    }

    /// Metadata for a device, if the user owns it.
    pub fn get_device_metadata(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceMetadata>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1 AND user_id = ?2");
        let row = self
            .conn
            .query_row(&sql, [device_id, user_id], DeviceRow::from_row)
            .optional()?;
        row.map(DeviceRow::into_metadata).transpose()
    }

    /// All devices owned by a user, in registration order.
    pub fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceMetadata>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE user_id = ? ORDER BY registered_at, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([user_id], DeviceRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(DeviceRow::into_metadata).collect()
    }

    /// Remove a device; returns `false` if the user does not own it.
    pub fn remove_device(&self, user_id: &str, device_id: &str) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM devices WHERE id = ?1 AND user_id = ?2",
            [device_id, user_id],
        )?;
        if removed > 0 {
            info!("Removed device {} for {}", device_id, user_id);
        }
        Ok(removed > 0)
    }

    /// Apply a partial update to a device the user owns.
    ///
    /// Returns the updated metadata, or [`Error::DeviceNotFound`].
    pub fn update_device(
        &self,
        user_id: &str,
        device_id: &str,
        update: &DeviceMetadataUpdate,
    ) -> Result<DeviceMetadata> {
        let mut meta = self
            .get_device_metadata(user_id, device_id)?
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        meta.apply(update);

        let health_updated_at = update
            .plant_health_score
            .map(|_| to_millis(OffsetDateTime::now_utc()));

        self.conn.execute(
            "UPDATE devices SET
                name = ?3,
                description = ?4,
                last_seen = ?5,
                target_interval = ?6,
                adaptive_sleep_enabled = ?7,
                plant_health_score = ?8,
                last_advice_priority = ?9,
                health_score_updated_at = COALESCE(?10, health_score_updated_at)
             WHERE id = ?1 AND user_id = ?2",
            rusqlite::params![
                device_id,
                user_id,
                meta.name,
                meta.description,
                meta.last_seen.map(to_millis),
                meta.target_interval,
                meta.adaptive_sleep_enabled,
                meta.plant_health_score,
                meta.last_advice_priority.map(Priority::as_str),
                health_updated_at,
            ],
        )?;

        debug!("Updated device {} for {}", device_id, user_id);
        Ok(meta)
    }

    /// Update the manual interval, adaptive flag, and name.
    pub fn update_device_config(
        &self,
        user_id: &str,
        device_id: &str,
        target_interval: Option<u32>,
        adaptive_sleep_enabled: Option<bool>,
        name: Option<&str>,
    ) -> Result<DeviceMetadata> {
        let update = DeviceMetadataUpdate {
            target_interval,
            adaptive_sleep_enabled,
            name: name.map(str::to_string),
            ..Default::default()
        };
        self.update_device(user_id, device_id, &update)
    }

    /// Record a plant health score and the advice priority it came from.
    pub fn set_health_score(
        &self,
        user_id: &str,
        device_id: &str,
        score: f64,
        priority: Option<Priority>,
    ) -> Result<DeviceMetadata> {
        let update = DeviceMetadataUpdate {
            plant_health_score: Some(score),
            last_advice_priority: priority,
            ..Default::default()
        };
        self.update_device(user_id, device_id, &update)
    }

    /// Set or clear the device description.
    pub fn set_description(
        &self,
        user_id: &str,
        device_id: &str,
        description: Option<&str>,
    ) -> Result<DeviceMetadata> {
        let update = DeviceMetadataUpdate {
            description: Some(description.map(str::to_string)),
            ..Default::default()
        };
        self.update_device(user_id, device_id, &update)
    }

    /// Refresh `last_seen`; returns `false` if the device is unknown.
    pub fn touch_last_seen(
        &self,
        user_id: &str,
        device_id: &str,
        at: OffsetDateTime,
    ) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE devices SET last_seen = ?3 WHERE id = ?1 AND user_id = ?2",
            rusqlite::params![device_id, user_id, to_millis(at)],
        )?;
        Ok(updated > 0)
    }
}

// Reading operations
impl Store {
    /// Append a reading; returns the new reading id.
    pub fn write_reading(&self, user_id: &str, device_id: &str, reading: &Reading) -> Result<String> {
        let raw_json = reading.raw.as_ref().map(serde_json::to_string).transpose()?;

        self.conn.execute(
            "INSERT INTO readings (user_id, device_id, timestamp, server_timestamp,
             temperature, humidity, light, soil_moisture, uv_light, raw_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                user_id,
                device_id,
                reading.timestamp.map(to_millis),
                to_millis(reading.server_timestamp),
                reading.temperature,
                reading.humidity,
                reading.light,
                reading.soil_moisture,
                reading.uv_light,
                raw_json,
            ],
        )?;

        let id = self.conn.last_insert_rowid();
        debug!("Stored reading {} for {}/{}", id, user_id, device_id);
        Ok(id.to_string())
    }

    /// Query readings with filters.
    pub fn query_readings(&self, query: &ReadingQuery) -> Result<Vec<Reading>> {
        let sql = query.build_sql();
        let (_, params) = query.build_where();

        debug!("Executing query: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), ReadingRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(ReadingRow::into_reading).collect()
    }

    /// Up to `limit` readings of a device, newest first.
    pub fn get_readings(&self, user_id: &str, device_id: &str, limit: u32) -> Result<Vec<Reading>> {
        self.query_readings(&ReadingQuery::new(user_id).device(device_id).limit(limit))
    }

    /// Readings of a device received within `[since, until]`, newest first.
    pub fn get_readings_range(
        &self,
        user_id: &str,
        device_id: &str,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<Vec<Reading>> {
        self.query_readings(
            &ReadingQuery::new(user_id)
                .device(device_id)
                .since(since)
                .until(until),
        )
    }

    /// Count readings of a user, optionally for one device.
    pub fn count_readings(&self, user_id: &str, device_id: Option<&str>) -> Result<u64> {
        let count: i64 = match device_id {
            Some(id) => self.conn.query_row(
                "SELECT COUNT(*) FROM readings WHERE user_id = ?1 AND device_id = ?2",
                [user_id, id],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM readings WHERE user_id = ?",
                [user_id],
                |row| row.get(0),
            )?,
        };

        Ok(count as u64)
    }

    /// Earliest and latest server timestamps of a device.
    pub fn reading_bounds(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<(OffsetDateTime, OffsetDateTime)>> {
        let (min, max): (Option<i64>, Option<i64>) = self.conn.query_row(
            "SELECT MIN(server_timestamp), MAX(server_timestamp)
             FROM readings WHERE user_id = ?1 AND device_id = ?2",
            [user_id, device_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        match (min, max) {
            (Some(min), Some(max)) => Ok(Some((from_millis(min)?, from_millis(max)?))),
            _ => Ok(None),
        }
    }

    /// Latest reading received at or before `at`.
    pub fn latest_reading_before(
        &self,
        user_id: &str,
        device_id: &str,
        at: OffsetDateTime,
    ) -> Result<Option<Reading>> {
        let sql = format!(
            "SELECT {READING_COLUMNS} FROM readings
             WHERE user_id = ?1 AND device_id = ?2 AND server_timestamp <= ?3
             ORDER BY server_timestamp DESC, id DESC LIMIT 1"
        );
        let row = self
            .conn
            .query_row(
                &sql,
                rusqlite::params![user_id, device_id, to_millis(at)],
                ReadingRow::from_row,
            )
            .optional()?;
        row.map(ReadingRow::into_reading).transpose()
    }

    /// First reading of each device in every hour since `since`, oldest first.
    pub fn sparse_history(&self, user_id: &str, since: OffsetDateTime) -> Result<Vec<Reading>> {
        let sql = format!(
            "SELECT {READING_COLUMNS} FROM (
                SELECT *, ROW_NUMBER() OVER (
                    PARTITION BY device_id, server_timestamp / {HOUR_MS}
                    ORDER BY server_timestamp ASC, id ASC
                ) AS rank_in_hour
                FROM readings WHERE user_id = ?1 AND server_timestamp >= ?2
             )
             WHERE rank_in_hour = 1
             ORDER BY server_timestamp ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params![user_id, to_millis(since)],
                ReadingRow::from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(ReadingRow::into_reading).collect()
    }

    /// Export the readings matching `query` as CSV with a header row.
    pub fn export_readings_csv(&self, query: &ReadingQuery) -> Result<String> {
        let readings = self.query_readings(query)?;

        let mut writer = csv::Writer::from_writer(Vec::new());
        for reading in &readings {
            writer.serialize(ExportRow::from_reading(reading))?;
        }
        if readings.is_empty() {
            writer.write_record([
                "server_timestamp",
                "device_timestamp",
                "device_id",
                "temperature_c",
                "humidity_pct",
                "light_lux",
                "soil_moisture_pct",
                "uv_index",
            ])?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        info!("Exported {} readings for {}", readings.len(), query.user_id);
        String::from_utf8(bytes)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }
}

// Advice history
impl Store {
    /// Persist an advice record; returns its row id.
    pub fn save_advice(&self, user_id: &str, record: &AdviceRecord) -> Result<i64> {
        let payload = serde_json::to_string(&record.advice)?;
        self.conn.execute(
            "INSERT INTO advice (user_id, generated_at, source, payload) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                user_id,
                to_millis(record.generated_at),
                record.source.as_str(),
                payload
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Up to `limit` advice records, newest first.
    pub fn recent_advice(&self, user_id: &str, limit: u32) -> Result<Vec<AdviceRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT generated_at, source, payload FROM advice
             WHERE user_id = ?1 ORDER BY generated_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![user_id, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(generated_at, source, payload)| {
                Ok(AdviceRecord {
                    generated_at: from_millis(generated_at)?,
                    // Unknown labels come from newer schema revisions; treat as generated
                    source: AdviceSource::parse(&source).unwrap_or(AdviceSource::Generated),
                    advice: serde_json::from_str(&payload)?,
                })
            })
            .collect()
    }
}

impl ReadingSource for Store {
    type Error = Error;

    fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceMetadata>> {
        Store::list_devices(self, user_id)
    }

    fn recent_readings(&self, user_id: &str, device_id: &str, limit: u32) -> Result<Vec<Reading>> {
        self.get_readings(user_id, device_id, limit)
    }

    fn reading_bounds(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<(OffsetDateTime, OffsetDateTime)>> {
        Store::reading_bounds(self, user_id, device_id)
    }

    fn latest_reading_before(
        &self,
        user_id: &str,
        device_id: &str,
        at: OffsetDateTime,
    ) -> Result<Option<Reading>> {
        Store::latest_reading_before(self, user_id, device_id, at)
    }
}

impl AdviceSink for Store {
    type Error = Error;

    fn save_advice(&mut self, user_id: &str, record: &AdviceRecord) -> Result<()> {
        Store::save_advice(self, user_id, record).map(|_| ())
    }

    fn recent_advice(&self, user_id: &str, limit: u32) -> Result<Vec<AdviceRecord>> {
        Store::recent_advice(self, user_id, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use growsense_types::{AdviceResult, DeviceAdvice, SensorField};
    use time::Duration;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-11-29 10:00 UTC);

    fn store_with_device() -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .register_device("u1", "d1", "key-1", Some("Kitchen"))
            .unwrap();
        store
    }

    fn reading_at(at: OffsetDateTime, temp: f64) -> Reading {
        Reading::new(at).with_field(SensorField::Temperature, temp)
    }

    fn advice_record(at: OffsetDateTime, text: &str) -> AdviceRecord {
        AdviceRecord {
            generated_at: at,
            source: AdviceSource::Generated,
            advice: AdviceResult {
                overall_advice: text.to_string(),
                device_advice: vec![DeviceAdvice {
                    device_id: "d1".to_string(),
                    device_name: "Kitchen".to_string(),
                    advice: "Water soon".to_string(),
                    priority: Priority::Medium,
                    recommendations: vec![],
                }],
                insights: vec![],
            },
        }
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.db");

        let store = Store::open(&path).unwrap();
        assert!(path.exists());
        assert!(store.list_devices("u1").unwrap().is_empty());
    }

    #[test]
    fn test_register_device_ownership() {
        let store = store_with_device();

        let again = store
            .register_device("u1", "d1", "key-2", None)
            .unwrap();
        assert_eq!(again, RegisterOutcome::Updated);
        let creds = store.device_credentials("d1").unwrap().unwrap();
        assert_eq!(creds.api_key, "key-2");
        // Name survives a re-registration without one
        let meta = store.get_device_metadata("u1", "d1").unwrap().unwrap();
        assert_eq!(meta.name, "Kitchen");

        let err = store
            .register_device("u2", "d1", "key-3", None)
            .unwrap_err();
        assert!(matches!(err, Error::DeviceOwnedByOtherUser(id) if id == "d1"));
    }

    #[test]
    fn test_device_name_defaults_to_id() {
        let store = Store::open_in_memory().unwrap();
        store.register_device("u1", "esp32_001", "k", None).unwrap();
        let meta = store.get_device_metadata("u1", "esp32_001").unwrap().unwrap();
        assert_eq!(meta.name, "esp32_001");
        assert!(meta.registered_at.is_some());
        assert!(!meta.adaptive_sleep_enabled);
    }

    #[test]
    fn test_metadata_scoped_to_owner() {
        let store = store_with_device();
        assert!(store.get_device_metadata("u2", "d1").unwrap().is_none());
        assert!(store.list_devices("u2").unwrap().is_empty());
        assert!(!store.remove_device("u2", "d1").unwrap());
        assert!(store.remove_device("u1", "d1").unwrap());
        assert!(store.list_devices("u1").unwrap().is_empty());
    }

    #[test]
    fn test_update_device_config_and_health() {
        let store = store_with_device();

        let meta = store
            .update_device_config("u1", "d1", Some(120), Some(true), None)
            .unwrap();
        assert_eq!(meta.target_interval, Some(120));
        assert!(meta.adaptive_sleep_enabled);

        store
            .set_health_score("u1", "d1", 4.0, Some(Priority::High))
            .unwrap();
        store.set_description("u1", "d1", Some("Basil")).unwrap();

        let meta = store.get_device_metadata("u1", "d1").unwrap().unwrap();
        assert_eq!(meta.plant_health_score, Some(4.0));
        assert_eq!(meta.last_advice_priority, Some(Priority::High));
        assert_eq!(meta.description.as_deref(), Some("Basil"));
        assert_eq!(meta.target_interval, Some(120));

        store.set_description("u1", "d1", None).unwrap();
        let meta = store.get_device_metadata("u1", "d1").unwrap().unwrap();
        assert_eq!(meta.description, None);

        let err = store
            .update_device_config("u2", "d1", Some(60), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
    }

    #[test]
    fn test_touch_last_seen() {
        let store = store_with_device();
        assert!(store.touch_last_seen("u1", "d1", T0).unwrap());
        assert!(!store.touch_last_seen("u1", "missing", T0).unwrap());
        let meta = store.get_device_metadata("u1", "d1").unwrap().unwrap();
        assert_eq!(meta.last_seen, Some(T0));
    }

    #[test]
    fn test_write_and_get_readings_newest_first() {
        let store = store_with_device();
        for i in 0..5 {
            store
                .write_reading("u1", "d1", &reading_at(T0 + Duration::minutes(i), i as f64))
                .unwrap();
        }

        let readings = store.get_readings("u1", "d1", 3).unwrap();
        let temps: Vec<_> = readings.iter().map(|r| r.temperature.unwrap()).collect();
        assert_eq!(temps, [4.0, 3.0, 2.0]);
        assert_eq!(readings[0].device_id.as_deref(), Some("d1"));
        assert!(readings[0].id.is_some());
        assert_eq!(readings[0].humidity, None);
    }

    #[test]
    fn test_equal_timestamps_break_ties_by_insertion() {
        let store = store_with_device();
        store.write_reading("u1", "d1", &reading_at(T0, 1.0)).unwrap();
        let second = store.write_reading("u1", "d1", &reading_at(T0, 2.0)).unwrap();

        let readings = store.get_readings("u1", "d1", 10).unwrap();
        assert_eq!(readings[0].id.as_deref(), Some(second.as_str()));
    }

    #[test]
    fn test_readings_scoped_per_user() {
        let store = store_with_device();
        store.write_reading("u1", "d1", &reading_at(T0, 1.0)).unwrap();
        assert!(store.get_readings("u2", "d1", 10).unwrap().is_empty());
        assert_eq!(store.count_readings("u1", None).unwrap(), 1);
        assert_eq!(store.count_readings("u1", Some("d1")).unwrap(), 1);
        assert_eq!(store.count_readings("u2", None).unwrap(), 0);
    }

    #[test]
    fn test_raw_payload_and_device_timestamp_roundtrip() {
        let store = store_with_device();
        let reading = Reading::new(T0)
            .with_timestamp(T0 - Duration::seconds(5))
            .with_raw(serde_json::json!({"uv_light": 2.5}));
        store.write_reading("u1", "d1", &reading).unwrap();

        let stored = &store.get_readings("u1", "d1", 1).unwrap()[0];
        assert_eq!(stored.timestamp, Some(T0 - Duration::seconds(5)));
        assert_eq!(stored.server_timestamp, T0);
        assert_eq!(stored.uv_index(), Some(2.5));
    }

    #[test]
    fn test_range_and_bounds() {
        let store = store_with_device();
        assert!(store.reading_bounds("u1", "d1").unwrap().is_none());

        for i in 0..10 {
            store
                .write_reading("u1", "d1", &reading_at(T0 + Duration::hours(i), i as f64))
                .unwrap();
        }

        let (earliest, latest) = store.reading_bounds("u1", "d1").unwrap().unwrap();
        assert_eq!(earliest, T0);
        assert_eq!(latest, T0 + Duration::hours(9));

        let range = store
            .get_readings_range("u1", "d1", T0 + Duration::hours(2), T0 + Duration::hours(4))
            .unwrap();
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn test_latest_reading_before() {
        let store = store_with_device();
        for i in 0..3 {
            store
                .write_reading("u1", "d1", &reading_at(T0 + Duration::hours(i), i as f64))
                .unwrap();
        }

        let hit = store
            .latest_reading_before("u1", "d1", T0 + Duration::minutes(90))
            .unwrap()
            .unwrap();
        assert_eq!(hit.temperature, Some(1.0));

        let exact = store
            .latest_reading_before("u1", "d1", T0 + Duration::hours(2))
            .unwrap()
            .unwrap();
        assert_eq!(exact.temperature, Some(2.0));

        assert!(
            store
                .latest_reading_before("u1", "d1", T0 - Duration::seconds(1))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_sparse_history_first_per_hour() {
        let store = store_with_device();
        store.register_device("u1", "d2", "k", None).unwrap();
        // Three readings in hour 0, one in hour 1, for d1; one for d2
        for (minutes, temp) in [(30, 2.0), (5, 1.0), (50, 3.0), (70, 4.0)] {
            store
                .write_reading("u1", "d1", &reading_at(T0 + Duration::minutes(minutes), temp))
                .unwrap();
        }
        store
            .write_reading("u1", "d2", &reading_at(T0 + Duration::minutes(10), 9.0))
            .unwrap();

        let sparse = store.sparse_history("u1", T0).unwrap();
        let temps: Vec<_> = sparse.iter().map(|r| r.temperature.unwrap()).collect();
        assert_eq!(temps, [1.0, 9.0, 4.0]);

        let later = store.sparse_history("u1", T0 + Duration::hours(1)).unwrap();
        assert_eq!(later.len(), 1);
    }

    #[test]
    fn test_export_csv() {
        let store = store_with_device();
        store
            .write_reading(
                "u1",
                "d1",
                &reading_at(T0, 21.5).with_field(SensorField::SoilMoisture, 40.0),
            )
            .unwrap();

        let csv = store
            .export_readings_csv(&ReadingQuery::new("u1").device("d1").oldest_first())
            .unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "server_timestamp,device_timestamp,device_id,temperature_c,humidity_pct,light_lux,soil_moisture_pct,uv_index"
        );
        assert_eq!(
            lines.next().unwrap(),
            "2024-11-29T10:00:00Z,,d1,21.5,,,40.0,"
        );
        assert!(lines.next().is_none());

        let empty = store
            .export_readings_csv(&ReadingQuery::new("u2"))
            .unwrap();
        assert!(empty.starts_with("server_timestamp,"));
    }

    #[test]
    fn test_advice_history_newest_first() {
        let mut store = store_with_device();
        for i in 0..4 {
            let record = advice_record(T0 + Duration::hours(i), &format!("advice {i}"));
            AdviceSink::save_advice(&mut store, "u1", &record).unwrap();
        }

        let recent = store.recent_advice("u1", 3).unwrap();
        let texts: Vec<_> = recent.iter().map(|r| r.advice.overall_advice.as_str()).collect();
        assert_eq!(texts, ["advice 3", "advice 2", "advice 1"]);
        assert_eq!(recent[0].source, AdviceSource::Generated);
        assert!(store.recent_advice("u2", 3).unwrap().is_empty());
    }

    #[test]
    fn test_reading_source_impl() {
        let store = store_with_device();
        store.write_reading("u1", "d1", &reading_at(T0, 1.0)).unwrap();

        let source: &dyn ReadingSource<Error = Error> = &store;
        assert_eq!(source.list_devices("u1").unwrap().len(), 1);
        assert_eq!(source.recent_readings("u1", "d1", 10).unwrap().len(), 1);
        assert!(source.reading_bounds("u1", "d1").unwrap().is_some());
    }
}
