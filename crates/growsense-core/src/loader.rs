//! Read-through population of the readings cache.

use std::collections::HashMap;

use tracing::{debug, warn};

use growsense_types::{AdviceRecord, AdviceSink, DeviceMetadata, PerDeviceBuffer, ReadingSource};

use crate::cache::{ADVICE_HISTORY_LEN, ReadingsCache, UserView};
use crate::error::{Error, Result};
use crate::sampler::HistoricSampler;

/// A device whose readings could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFailure {
    pub device_id: String,
    pub message: String,
}

/// Everything fetched for one user.
#[derive(Debug, Clone, Default)]
pub struct LoadedUser {
    /// Devices that loaded successfully.
    pub devices: Vec<DeviceMetadata>,
    pub buffers: HashMap<String, PerDeviceBuffer>,
    /// Oldest to newest.
    pub advice_history: Vec<AdviceRecord>,
    pub failures: Vec<DeviceFailure>,
}

/// Fetches a user's devices and readings from the backing store.
#[derive(Debug, Clone, Copy)]
pub struct CacheLoader {
    recent_limit: u32,
    sampler: HistoricSampler,
}

impl Default for CacheLoader {
    fn default() -> Self {
        Self::new(200, HistoricSampler::default())
    }
}

impl CacheLoader {
    pub fn new(recent_limit: u32, sampler: HistoricSampler) -> Self {
        Self {
            recent_limit,
            sampler,
        }
    }

    /// Load devices, readings, and prior advice for a user.
    ///
    /// Only the device listing is required. A device whose readings fail to
    /// load is reported in [`LoadedUser::failures`] and left out; prior advice
    /// is best-effort.
    pub fn load<S>(&self, source: &S, user_id: &str) -> Result<LoadedUser>
    where
        S: ReadingSource + AdviceSink + ?Sized,
    {
        let listed = ReadingSource::list_devices(source, user_id).map_err(Error::from_source)?;
        let mut loaded = LoadedUser::default();

        for device in listed {
            match self.load_device(source, user_id, &device.device_id) {
                Ok(buffer) => {
                    loaded.buffers.insert(device.device_id.clone(), buffer);
                    loaded.devices.push(device);
                }
                Err(e) => {
                    warn!(
                        "Skipping device {} for {}: {}",
                        device.device_id, user_id, e
                    );
                    loaded.failures.push(DeviceFailure {
                        device_id: device.device_id,
                        message: e.to_string(),
                    });
                }
            }
        }

        match AdviceSink::recent_advice(source, user_id, ADVICE_HISTORY_LEN as u32) {
            Ok(mut history) => {
                history.reverse();
                loaded.advice_history = history;
            }
            Err(e) => warn!("Could not load advice history for {}: {}", user_id, e),
        }

        debug!(
            "Loaded {} devices for {} ({} failed)",
            loaded.devices.len(),
            user_id,
            loaded.failures.len()
        );
        Ok(loaded)
    }

    fn load_device<S>(&self, source: &S, user_id: &str, device_id: &str) -> Result<PerDeviceBuffer>
    where
        S: ReadingSource + ?Sized,
    {
        let recent = source
            .recent_readings(user_id, device_id, self.recent_limit)
            .map_err(Error::from_source)?;
        let historic = self.sampler.sample(source, user_id, device_id)?;
        Ok(PerDeviceBuffer::new(recent, historic))
    }

    /// Load a user and install the result in the cache.
    pub fn populate<S>(
        &self,
        cache: &ReadingsCache,
        source: &S,
        user_id: &str,
    ) -> Result<(UserView, Vec<DeviceFailure>)>
    where
        S: ReadingSource + AdviceSink + ?Sized,
    {
        let loaded = self.load(source, user_id)?;
        let view = cache.set(
            user_id,
            loaded.devices,
            loaded.buffers,
            Some(loaded.advice_history),
        );
        Ok((view, loaded.failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use crate::testing::MemorySource;
    use growsense_types::{AdviceResult, AdviceSource, Reading};
    use time::Duration;
    use time::macros::datetime;

    fn source_with_two_devices() -> MemorySource {
        let mut source = MemorySource::default();
        let t0 = datetime!(2024-11-29 00:00 UTC);
        for i in 0..10 {
            source.push("u1", "d1", Reading::new(t0 + Duration::hours(i)));
            source.push("u1", "d2", Reading::new(t0 + Duration::hours(i)));
        }
        source
    }

    #[test]
    fn test_load_fills_recent_and_historic() {
        let source = source_with_two_devices();
        let loader = CacheLoader::new(4, HistoricSampler::new(5));

        let loaded = loader.load(&source, "u1").unwrap();
        assert_eq!(loaded.devices.len(), 2);
        assert!(loaded.failures.is_empty());

        let d1 = &loaded.buffers["d1"];
        assert_eq!(d1.recent.len(), 4);
        assert_eq!(
            d1.recent[0].server_timestamp,
            datetime!(2024-11-29 09:00 UTC)
        );
        assert_eq!(d1.historic.len(), 4);
    }

    #[test]
    fn test_partial_device_failure_is_isolated() {
        let mut source = source_with_two_devices();
        source.fail_device("d2");

        let loaded = CacheLoader::default().load(&source, "u1").unwrap();
        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(loaded.devices[0].device_id, "d1");
        assert!(!loaded.buffers.contains_key("d2"));
        assert_eq!(loaded.failures.len(), 1);
        assert_eq!(loaded.failures[0].device_id, "d2");
    }

    #[test]
    fn test_device_listing_failure_propagates() {
        let source = MemorySource::failing();
        let err = CacheLoader::default().load(&source, "u1").unwrap_err();
        assert!(matches!(err, Error::Source(_)));
    }

    #[test]
    fn test_advice_history_is_best_effort() {
        let mut source = source_with_two_devices();
        source.fail_advice = true;
        let loaded = CacheLoader::default().load(&source, "u1").unwrap();
        assert!(loaded.advice_history.is_empty());
        assert_eq!(loaded.devices.len(), 2);
    }

    #[test]
    fn test_advice_history_oldest_first() {
        let mut source = source_with_two_devices();
        for i in 0..5 {
            let record = AdviceRecord {
                generated_at: datetime!(2024-11-29 00:00 UTC) + Duration::hours(i),
                source: AdviceSource::Generated,
                advice: AdviceResult {
                    overall_advice: format!("a{i}"),
                    device_advice: vec![],
                    insights: vec![],
                },
            };
            AdviceSink::save_advice(&mut source, "u1", &record).unwrap();
        }

        let loaded = CacheLoader::default().load(&source, "u1").unwrap();
        let texts: Vec<_> = loaded
            .advice_history
            .iter()
            .map(|r| r.advice.overall_advice.as_str())
            .collect();
        assert_eq!(texts, ["a2", "a3", "a4"]);
    }

    #[test]
    fn test_populate_sets_cache() {
        let source = source_with_two_devices();
        let cache = ReadingsCache::new(CacheSettings::default());

        let (view, failures) = CacheLoader::default()
            .populate(&cache, &source, "u1")
            .unwrap();
        assert!(failures.is_empty());
        assert_eq!(view.devices.len(), 2);
        assert_eq!(cache.get("u1").unwrap(), view);
    }

    #[test]
    fn test_upload_racing_populate_is_cached_once() {
        let store = growsense_store::Store::open_in_memory().unwrap();
        store.register_device("u1", "d1", "k", None).unwrap();
        let mut reading = Reading::new(datetime!(2024-11-29 10:00 UTC)).with_device("d1");
        reading.id = Some(store.write_reading("u1", "d1", &reading).unwrap());

        // A dashboard load sees the row before the uploader updates the cache
        let cache = ReadingsCache::new(CacheSettings::default());
        CacheLoader::default().populate(&cache, &store, "u1").unwrap();
        assert!(cache.update_reading("u1", "d1", reading.clone()));

        let recent = &cache.get("u1").unwrap().buffers["d1"].recent;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, reading.id);
    }
}
