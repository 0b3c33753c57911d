//! Query builder for stored readings.
//!
//! # Example
//!
//! ```
//! use growsense_store::{ReadingQuery, Store};
//! use time::{Duration, OffsetDateTime};
//!
//! let store = Store::open_in_memory()?;
//! let yesterday = OffsetDateTime::now_utc() - Duration::hours(24);
//!
//! let query = ReadingQuery::new("user-1")
//!     .device("esp32_001")
//!     .since(yesterday)
//!     .limit(50)
//!     .offset(0);
//!
//! let readings = store.query_readings(&query)?;
//! assert!(readings.is_empty());
//! # Ok::<(), growsense_store::Error>(())
//! ```

use time::OffsetDateTime;

pub(crate) const READING_COLUMNS: &str = "id, device_id, timestamp, server_timestamp, \
     temperature, humidity, light, soil_moisture, uv_light, raw_json";

/// Fluent query builder for readings.
///
/// A query is always scoped to one user. By default results are ordered by
/// `server_timestamp` descending (newest first), ties broken by insertion
/// order so the latest write comes first.
#[derive(Debug, Clone)]
pub struct ReadingQuery {
    /// Owning user.
    pub user_id: String,
    /// Filter by device ID.
    pub device_id: Option<String>,
    /// Include readings at or after this server time.
    pub since: Option<OffsetDateTime>,
    /// Include readings at or before this server time.
    pub until: Option<OffsetDateTime>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
    /// Order by server_timestamp descending.
    pub newest_first: bool,
}

impl ReadingQuery {
    /// All readings of a user, newest first, without limit.
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            device_id: None,
            since: None,
            until: None,
            limit: None,
            offset: None,
            newest_first: true,
        }
    }

    /// Only include readings from the specified device.
    pub fn device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }

    /// Filter to readings received at or after this time.
    pub fn since(mut self, time: OffsetDateTime) -> Self {
        self.since = Some(time);
        self
    }

    /// Filter to readings received at or before this time.
    pub fn until(mut self, time: OffsetDateTime) -> Self {
        self.until = Some(time);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Order results chronologically.
    pub fn oldest_first(mut self) -> Self {
        self.newest_first = false;
        self
    }

    /// Build the SQL WHERE clause and parameters.
    pub(crate) fn build_where(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = vec!["user_id = ?"];
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(self.user_id.clone())];

        if let Some(ref device_id) = self.device_id {
            conditions.push("device_id = ?");
            params.push(Box::new(device_id.clone()));
        }

        if let Some(since) = self.since {
            conditions.push("server_timestamp >= ?");
            params.push(Box::new(to_millis(since)));
        }

        if let Some(until) = self.until {
            conditions.push("server_timestamp <= ?");
            params.push(Box::new(to_millis(until)));
        }

        (format!("WHERE {}", conditions.join(" AND ")), params)
    }

    /// Build the full SQL query.
    pub(crate) fn build_sql(&self) -> String {
        let (where_clause, _) = self.build_where();
        let order = if self.newest_first { "DESC" } else { "ASC" };

        let mut sql = format!(
            "SELECT {READING_COLUMNS} FROM readings {where_clause} \
             ORDER BY server_timestamp {order}, id {order}"
        );

        // SQLite requires LIMIT when OFFSET is present
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }

        sql
    }
}

/// Unix milliseconds, the storage unit for every timestamp column.
pub(crate) fn to_millis(time: OffsetDateTime) -> i64 {
    (time.unix_timestamp_nanos() / 1_000_000) as i64
}
