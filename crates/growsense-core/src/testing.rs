//! In-memory backing store for unit tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use time::OffsetDateTime;

use growsense_types::{AdviceRecord, AdviceSink, DeviceMetadata, Reading, ReadingSource};

#[derive(Debug, thiserror::Error)]
#[error("memory source failure: {0}")]
pub struct MemoryError(pub String);

/// Readings kept in insertion order per `(user, device)`.
#[derive(Debug, Default)]
pub struct MemorySource {
    devices: BTreeMap<String, Vec<DeviceMetadata>>,
    readings: BTreeMap<(String, String), Vec<Reading>>,
    advice: BTreeMap<String, Vec<AdviceRecord>>,
    fail_all: bool,
    failing_devices: HashSet<String>,
    pub fail_advice: bool,
    calls: AtomicUsize,
}

impl MemorySource {
    /// A source whose every call fails.
    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Default::default()
        }
    }

    /// Make reading lookups for one device fail.
    pub fn fail_device(&mut self, device_id: &str) {
        self.failing_devices.insert(device_id.to_string());
    }

    pub fn add_device(&mut self, user_id: &str, meta: DeviceMetadata) {
        self.devices.entry(user_id.to_string()).or_default().push(meta);
    }

    /// Append a reading, registering the device on first use.
    pub fn push(&mut self, user_id: &str, device_id: &str, mut reading: Reading) {
        let devices = self.devices.entry(user_id.to_string()).or_default();
        if !devices.iter().any(|d| d.device_id == device_id) {
            devices.push(DeviceMetadata::new(device_id));
        }
        reading.device_id = Some(device_id.to_string());
        let list = self
            .readings
            .entry((user_id.to_string(), device_id.to_string()))
            .or_default();
        if reading.id.is_none() {
            reading.id = Some(format!("{device_id}-{}", list.len()));
        }
        list.push(reading);
    }

    /// Number of trait calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn saved_advice(&self, user_id: &str) -> &[AdviceRecord] {
        self.advice.get(user_id).map(Vec::as_slice).unwrap_or_default()
    }

    fn enter(&self, device_id: Option<&str>) -> Result<(), MemoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_all {
            return Err(MemoryError("unavailable".to_string()));
        }
        match device_id {
            Some(id) if self.failing_devices.contains(id) => {
                Err(MemoryError(format!("device {id} unreadable")))
            }
            _ => Ok(()),
        }
    }

    fn device_readings(&self, user_id: &str, device_id: &str) -> Vec<&Reading> {
        let mut list: Vec<&Reading> = self
            .readings
            .get(&(user_id.to_string(), device_id.to_string()))
            .map(|v| v.iter().collect())
            .unwrap_or_default();
        // Newest first; later inserts win ties
        list.reverse();
        list.sort_by(|a, b| b.server_timestamp.cmp(&a.server_timestamp));
        list
    }
}

impl ReadingSource for MemorySource {
    type Error = MemoryError;

    fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceMetadata>, MemoryError> {
        self.enter(None)?;
        Ok(self.devices.get(user_id).cloned().unwrap_or_default())
    }

    fn recent_readings(
        &self,
        user_id: &str,
        device_id: &str,
        limit: u32,
    ) -> Result<Vec<Reading>, MemoryError> {
        self.enter(Some(device_id))?;
        Ok(self
            .device_readings(user_id, device_id)
            .into_iter()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn reading_bounds(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<(OffsetDateTime, OffsetDateTime)>, MemoryError> {
        self.enter(Some(device_id))?;
        let list = self.device_readings(user_id, device_id);
        Ok(list
            .last()
            .zip(list.first())
            .map(|(earliest, latest)| (earliest.server_timestamp, latest.server_timestamp)))
    }

    fn latest_reading_before(
        &self,
        user_id: &str,
        device_id: &str,
        at: OffsetDateTime,
    ) -> Result<Option<Reading>, MemoryError> {
        self.enter(Some(device_id))?;
        Ok(self
            .device_readings(user_id, device_id)
            .into_iter()
            .find(|r| r.server_timestamp <= at)
            .cloned())
    }
}

impl AdviceSink for MemorySource {
    type Error = MemoryError;

    fn save_advice(&mut self, user_id: &str, record: &AdviceRecord) -> Result<(), MemoryError> {
        self.enter(None)?;
        if self.fail_advice {
            return Err(MemoryError("advice table locked".to_string()));
        }
        self.advice
            .entry(user_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn recent_advice(&self, user_id: &str, limit: u32) -> Result<Vec<AdviceRecord>, MemoryError> {
        self.enter(None)?;
        if self.fail_advice {
            return Err(MemoryError("advice table locked".to_string()));
        }
        Ok(self
            .advice
            .get(user_id)
            .map(|v| v.iter().rev().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }
}
