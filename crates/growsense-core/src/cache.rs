//! Process-wide read-through cache of per-user readings.
//!
//! Each user entry holds device metadata, a [`PerDeviceBuffer`] per device,
//! and the last few advice records. Entries expire a fixed TTL after their
//! last full [`ReadingsCache::set`]; incremental updates from device uploads
//! never extend that lifetime.
//!
//! One coarse mutex guards the whole map, so every operation is atomic with
//! respect to the others. A poisoned lock is recovered rather than
//! propagated: the map is never left half-updated by any operation.
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use growsense_core::{CacheSettings, ReadingsCache};
//! use growsense_types::{DeviceMetadata, PerDeviceBuffer, Reading};
//! use time::OffsetDateTime;
//!
//! let cache = ReadingsCache::new(CacheSettings::default());
//! assert!(cache.get("user-1").is_none());
//!
//! let devices = vec![DeviceMetadata::new("esp32_001")];
//! let mut buffers = HashMap::new();
//! buffers.insert("esp32_001".to_string(), PerDeviceBuffer::default());
//! cache.set("user-1", devices, buffers, None);
//!
//! cache.update_reading("user-1", "esp32_001", Reading::new(OffsetDateTime::now_utc()));
//! let view = cache.get("user-1").unwrap();
//! assert_eq!(view.buffers["esp32_001"].recent.len(), 1);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;

use growsense_types::{AdviceRecord, DeviceMetadata, DeviceMetadataUpdate, PerDeviceBuffer, Reading};

use crate::clock::{Clock, SystemClock};

/// Number of advice records kept per user.
pub const ADVICE_HISTORY_LEN: usize = 3;

/// Cache sizing and lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Lifetime of an entry after a full `set`.
    pub ttl: Duration,
    /// Cap for each device's `recent` and `historic` views.
    pub max_readings_per_device: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            max_readings_per_device: 200,
        }
    }
}

/// Snapshot of one user's cached data.
#[derive(Debug, Clone, PartialEq)]
pub struct UserView {
    pub devices: Vec<DeviceMetadata>,
    pub buffers: HashMap<String, PerDeviceBuffer>,
    /// Oldest to newest, at most [`ADVICE_HISTORY_LEN`].
    pub advice_history: Vec<AdviceRecord>,
    pub cached_at: OffsetDateTime,
    pub ttl_expires: OffsetDateTime,
}

impl UserView {
    /// Merge every device's `recent` readings, newest first, capped at `limit`.
    ///
    /// Readings with equal server timestamps keep their per-device order.
    pub fn flatten_recent(&self, limit: usize) -> Vec<Reading> {
        let mut all: Vec<Reading> = self
            .devices
            .iter()
            .filter_map(|d| self.buffers.get(&d.device_id))
            .flat_map(|b| b.recent.iter().cloned())
            .collect();
        all.sort_by(|a, b| b.server_timestamp.cmp(&a.server_timestamp));
        all.truncate(limit);
        all
    }

    /// Total readings across every device's `recent` view.
    pub fn recent_count(&self) -> usize {
        self.buffers.values().map(|b| b.recent.len()).sum()
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceMetadata> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub cached_users: usize,
    pub total_readings: usize,
    pub ttl_seconds: u64,
    pub max_readings_per_device: usize,
}

#[derive(Debug)]
struct UserCacheEntry {
    devices: Vec<DeviceMetadata>,
    buffers: HashMap<String, PerDeviceBuffer>,
    advice_history: Vec<AdviceRecord>,
    /// Set only by a full `set`; `None` means metadata-only.
    cached_at: Option<OffsetDateTime>,
    ttl_expires: OffsetDateTime,
}

impl UserCacheEntry {
    fn view(&self) -> Option<UserView> {
        let cached_at = self.cached_at?;
        Some(UserView {
            devices: self.devices.clone(),
            buffers: self.buffers.clone(),
            advice_history: self.advice_history.clone(),
            cached_at,
            ttl_expires: self.ttl_expires,
        })
    }

    fn readings(&self) -> usize {
        self.buffers.values().map(PerDeviceBuffer::len).sum()
    }

    /// Whether `get` would return this entry at `now`.
    fn is_live(&self, now: OffsetDateTime) -> bool {
        self.cached_at.is_some() && now <= self.ttl_expires
    }
}

fn keep_last(history: &mut Vec<AdviceRecord>, n: usize) {
    if history.len() > n {
        history.drain(..history.len() - n);
    }
}

/// Thread-safe in-memory cache of user readings.
#[derive(Debug)]
pub struct ReadingsCache {
    entries: Mutex<HashMap<String, UserCacheEntry>>,
    settings: CacheSettings,
    clock: Arc<dyn Clock>,
}

impl ReadingsCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Current time according to the cache's clock.
    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UserCacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached data for a user, or `None` on a miss.
    ///
    /// Expired entries are evicted here. Entries created only by metadata
    /// updates report a miss until the first full `set`.
    pub fn get(&self, user_id: &str) -> Option<UserView> {
        let now = self.clock.now();
        let mut entries = self.lock();

        let entry = entries.get(user_id)?;
        if now > entry.ttl_expires {
            entries.remove(user_id);
            debug!("Cache entry for {} expired", user_id);
            return None;
        }
        entry.view()
    }

    /// Replace a user's entry and restart its TTL.
    ///
    /// Both buffer views are truncated to the per-device cap. With
    /// `advice_history` of `None`, history already cached for the user is kept.
    /// Returns a snapshot of the stored entry.
    pub fn set(
        &self,
        user_id: &str,
        devices: Vec<DeviceMetadata>,
        mut buffers: HashMap<String, PerDeviceBuffer>,
        advice_history: Option<Vec<AdviceRecord>>,
    ) -> UserView {
        let now = self.clock.now();
        let max = self.settings.max_readings_per_device;
        for buffer in buffers.values_mut() {
            buffer.truncate(max);
        }

        let mut entries = self.lock();
        let mut history = match advice_history {
            Some(history) => history,
            None => entries
                .remove(user_id)
                .map(|e| e.advice_history)
                .unwrap_or_default(),
        };
        keep_last(&mut history, ADVICE_HISTORY_LEN);

        debug!(
            "Caching {} devices for {} (ttl {:?})",
            devices.len(),
            user_id,
            self.settings.ttl
        );
        let view = UserView {
            devices,
            buffers,
            advice_history: history,
            cached_at: now,
            ttl_expires: now + self.settings.ttl,
        };
        entries.insert(
            user_id.to_string(),
            UserCacheEntry {
                devices: view.devices.clone(),
                buffers: view.buffers.clone(),
                advice_history: view.advice_history.clone(),
                cached_at: Some(now),
                ttl_expires: view.ttl_expires,
            },
        );
        view
    }

    /// Push a freshly uploaded reading to the front of a device's `recent` view.
    ///
    /// Returns `false` (and does nothing) when the user has no entry or only a
    /// metadata entry: the next read will populate the cache from the store
    /// anyway. A reading whose id is already buffered is not added twice. The
    /// entry's TTL is left untouched.
    pub fn update_reading(&self, user_id: &str, device_id: &str, reading: Reading) -> bool {
        let max = self.settings.max_readings_per_device;
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(user_id).filter(|e| e.cached_at.is_some()) else {
            return false;
        };
        entry
            .buffers
            .entry(device_id.to_string())
            .or_default()
            .push_recent(reading, max);
        true
    }

    /// Upsert one device's metadata, creating the user entry if needed.
    pub fn update_device_metadata(
        &self,
        user_id: &str,
        device_id: &str,
        update: &DeviceMetadataUpdate,
    ) {
        let now = self.clock.now();
        let ttl = self.settings.ttl;
        let mut entries = self.lock();
        let entry = entries
            .entry(user_id.to_string())
            .or_insert_with(|| UserCacheEntry {
                devices: Vec::new(),
                buffers: HashMap::new(),
                advice_history: Vec::new(),
                cached_at: None,
                ttl_expires: now + ttl,
            });

        match entry.devices.iter_mut().find(|d| d.device_id == device_id) {
            Some(meta) => meta.apply(update),
            None => {
                let mut meta = DeviceMetadata::new(device_id);
                meta.apply(update);
                entry.devices.push(meta);
            }
        }
    }

    /// Replace the advice history, keeping the last three. No-op when absent.
    pub fn update_analysis_history(&self, user_id: &str, mut history: Vec<AdviceRecord>) {
        keep_last(&mut history, ADVICE_HISTORY_LEN);
        if let Some(entry) = self.lock().get_mut(user_id) {
            entry.advice_history = history;
        }
    }

    /// Append one advice record, keeping the last three. No-op when absent.
    pub fn append_advice(&self, user_id: &str, record: AdviceRecord) {
        if let Some(entry) = self.lock().get_mut(user_id) {
            entry.advice_history.push(record);
            keep_last(&mut entry.advice_history, ADVICE_HISTORY_LEN);
        }
    }

    /// Drop a user's entry.
    pub fn invalidate(&self, user_id: &str) {
        if self.lock().remove(user_id).is_some() {
            debug!("Invalidated cache for {}", user_id);
        }
    }

    /// Counts only entries `get` would return.
    pub fn get_stats(&self) -> CacheStats {
        let now = self.clock.now();
        let entries = self.lock();
        let live: Vec<&UserCacheEntry> = entries.values().filter(|e| e.is_live(now)).collect();
        CacheStats {
            cached_users: live.len(),
            total_readings: live.iter().map(|e| e.readings()).sum(),
            ttl_seconds: self.settings.ttl.as_secs(),
            max_readings_per_device: self.settings.max_readings_per_device,
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn reading(i: usize) -> Reading {
        Reading::new(OffsetDateTime::UNIX_EPOCH).with_id(i.to_string())
    }

    proptest! {
        #[test]
        fn recent_is_bounded_and_newest_first(max in 1usize..20, pushes in 0usize..60) {
            let cache = ReadingsCache::new(CacheSettings {
                ttl: Duration::from_secs(3600),
                max_readings_per_device: max,
            });
            cache.set("u", vec![DeviceMetadata::new("d")], HashMap::new(), None);
            for i in 0..pushes {
                cache.update_reading("u", "d", reading(i));
            }

            let view = cache.get("u").unwrap();
            let recent: Vec<usize> = view
                .buffers
                .get("d")
                .map(|b| b.recent.iter().map(|r| r.id.as_deref().unwrap().parse().unwrap()).collect())
                .unwrap_or_default();

            prop_assert!(recent.len() <= max);
            prop_assert_eq!(recent.len(), pushes.min(max));
            // Strictly decreasing insertion index means newest first
            prop_assert!(recent.windows(2).all(|w| w[0] > w[1]));
            if pushes > 0 {
                prop_assert_eq!(recent[0], pushes - 1);
            }
        }

        #[test]
        fn advice_history_never_exceeds_three(appends in 0usize..10, initial in 0usize..6) {
            let cache = ReadingsCache::new(CacheSettings::default());
            let record = |i: usize| AdviceRecord {
                generated_at: OffsetDateTime::UNIX_EPOCH,
                source: growsense_types::AdviceSource::Generated,
                advice: growsense_types::AdviceResult {
                    overall_advice: i.to_string(),
                    device_advice: vec![],
                    insights: vec![],
                },
            };
            cache.set("u", vec![], HashMap::new(), Some((0..initial).map(record).collect()));
            for i in 0..appends {
                cache.append_advice("u", record(initial + i));
                prop_assert!(cache.get("u").unwrap().advice_history.len() <= ADVICE_HISTORY_LEN);
            }

            let history = cache.get("u").unwrap().advice_history;
            let total = initial + appends;
            prop_assert_eq!(history.len(), total.min(ADVICE_HISTORY_LEN));
            if total > 0 {
                prop_assert_eq!(history.last().unwrap().advice.overall_advice.clone(), (total - 1).to_string());
            }
        }
    }
}
