//! Advice assembly.
//!
//! Builds a compact payload from the readings cache, calls the configured
//! [`AdviceGenerator`] under the retry policy, validates the answer, and
//! records the result. The backing store is never consulted while
//! assembling: a user without a live cache entry gets
//! [`Error::CacheUnavailableForAdvice`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use serde::ser::{SerializeMap, Serializer};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use growsense_types::{
    AdviceRecord, AdviceResult, AdviceSink, AdviceSource, DeviceMetadata, PerDeviceBuffer,
    Reading, SensorField,
};

use crate::cache::{ADVICE_HISTORY_LEN, ReadingsCache};
use crate::error::{Error, Result};
use crate::generator::{AdviceGenerator, GeneratorError};
use crate::response::{default_advice, parse_advice_response, validate_advice};
use crate::retry::{RetryConfig, with_retry};

/// Readings per device sent to the generator.
pub const DEFAULT_SAMPLE_TARGET: usize = 30;

/// Evenly spaced subset of `items`, at most `target` long.
///
/// The first and last items are always kept when `target >= 2`.
pub fn stride_sample<T: Clone>(items: &[T], target: usize) -> Vec<T> {
    let len = items.len();
    if len <= target {
        return items.to_vec();
    }
    match target {
        0 => return Vec::new(),
        1 => return vec![items[0].clone()],
        _ => {}
    }

    let step = len / target;
    let last = len - 1;
    let mut indices: Vec<usize> = (0..len).step_by(step).filter(|&i| i != last).collect();
    indices.truncate(target - 1);
    indices.push(last);
    indices.into_iter().map(|i| items[i].clone()).collect()
}

/// Min, max, and mean of one sensor field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl FieldSummary {
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in values.into_iter().filter(|v| v.is_finite()) {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        (count > 0).then(|| FieldSummary {
            min,
            max,
            avg: sum / count as f64,
        })
    }
}

/// Statistics over a set of readings.
///
/// Serializes flat, e.g. `{"reading_count": 3, "avg_temperature": 21.5, ...}`;
/// fields without any values are left out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub reading_count: usize,
    pub fields: Vec<(SensorField, FieldSummary)>,
}

impl Summary {
    pub fn from_readings<'a>(readings: impl IntoIterator<Item = &'a Reading>) -> Self {
        let readings: Vec<&Reading> = readings.into_iter().collect();
        let fields = SensorField::ALL
            .iter()
            .filter_map(|&field| {
                FieldSummary::from_values(readings.iter().filter_map(|r| r.value(field)))
                    .map(|s| (field, s))
            })
            .collect();
        Summary {
            reading_count: readings.len(),
            fields,
        }
    }

    pub fn field(&self, field: SensorField) -> Option<&FieldSummary> {
        self.fields
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, s)| s)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl Serialize for Summary {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1 + self.fields.len() * 3))?;
        map.serialize_entry("reading_count", &self.reading_count)?;
        for (field, s) in &self.fields {
            let name = field.name();
            map.serialize_entry(&format!("avg_{name}"), &round2(s.avg))?;
            map.serialize_entry(&format!("min_{name}"), &round2(s.min))?;
            map.serialize_entry(&format!("max_{name}"), &round2(s.max))?;
        }
        map.end()
    }
}

/// A reading trimmed down to what the generator needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadReading {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soil_moisture: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uv_light: Option<f64>,
}

impl From<&Reading> for PayloadReading {
    fn from(r: &Reading) -> Self {
        PayloadReading {
            timestamp: r.server_timestamp,
            temperature: r.value(SensorField::Temperature),
            humidity: r.value(SensorField::Humidity),
            light: r.value(SensorField::Light),
            soil_moisture: r.value(SensorField::SoilMoisture),
            uv_light: r.value(SensorField::Uv),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DevicePayload {
    pub device_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    /// Newest reading, if any.
    pub latest: Option<PayloadReading>,
    /// Stride-sampled, newest first.
    pub recent_readings: Vec<PayloadReading>,
    pub summary: Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverallSummary {
    pub total_readings: usize,
    pub time_range: String,
    #[serde(flatten)]
    pub stats: Summary,
}

/// Everything sent to the generator for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdvicePayload {
    pub user_id: String,
    pub device_count: usize,
    pub devices: Vec<DevicePayload>,
    pub overall_summary: OverallSummary,
    /// Oldest first, at most three.
    pub previous_advice: Vec<AdviceRecord>,
}

fn describe_time_range(readings: &[&Reading]) -> String {
    let newest = readings.iter().map(|r| r.server_timestamp).max();
    let oldest = readings.iter().map(|r| r.server_timestamp).min();
    let (Some(newest), Some(oldest)) = (newest, oldest) else {
        return "no_data".to_string();
    };
    let secs = (newest - oldest).whole_seconds().max(0);
    let hours = ((secs + 3599) / 3600).max(1);
    if hours == 1 {
        "last_hour".to_string()
    } else {
        format!("last_{hours}_hours")
    }
}

impl AdvicePayload {
    /// Build a payload from cached devices and buffers.
    ///
    /// Only the `recent` buffers are sampled. Devices without a buffer are
    /// included with no readings.
    pub fn build(
        user_id: &str,
        devices: &[DeviceMetadata],
        buffers: &HashMap<String, PerDeviceBuffer>,
        history: &[AdviceRecord],
        sample_target: usize,
    ) -> Self {
        let mut sampled_all: Vec<Reading> = Vec::new();
        let device_payloads = devices
            .iter()
            .map(|device| {
                let recent: Vec<Reading> = buffers
                    .get(&device.device_id)
                    .map(|b| b.recent.iter().cloned().collect())
                    .unwrap_or_default();
                let sampled = stride_sample(&recent, sample_target);
                let payload = DevicePayload {
                    device_id: device.device_id.clone(),
                    name: device.name.clone(),
                    description: device.description.clone(),
                    last_seen: device.last_seen,
                    latest: recent.first().map(PayloadReading::from),
                    recent_readings: sampled.iter().map(PayloadReading::from).collect(),
                    summary: Summary::from_readings(&sampled),
                };
                sampled_all.extend(sampled);
                payload
            })
            .collect::<Vec<_>>();

        let refs: Vec<&Reading> = sampled_all.iter().collect();
        let skip = history.len().saturating_sub(ADVICE_HISTORY_LEN);

        AdvicePayload {
            user_id: user_id.to_string(),
            device_count: device_payloads.len(),
            devices: device_payloads,
            overall_summary: OverallSummary {
                total_readings: refs.len(),
                time_range: describe_time_range(&refs),
                stats: Summary::from_readings(refs.iter().copied()),
            },
            previous_advice: history[skip..].to_vec(),
        }
    }

    /// Prompt text for text-completion generators.
    pub fn prompt(&self) -> String {
        let data = serde_json::to_string_pretty(self).unwrap_or_default();
        format!(
            "You are a plant care expert. Analyze the sensor data from {count} plant \
monitoring devices below and give practical care advice.\n\n\
{data}\n\n\
Respond with only a JSON object of this shape:\n\
{{\"overall_advice\": string, \"device_advice\": [{{\"device_id\": string, \
\"device_name\": string, \"advice\": string, \"priority\": \"low\" | \"medium\" | \"high\" | \"urgent\", \
\"recommendations\": [string]}}], \"insights\": [string]}}\n\
Give exactly one device_advice entry per device, using the device_id values above. \
Take previous_advice into account so recommendations stay consistent.",
            count = self.device_count,
        )
    }

    pub fn data_summary(&self) -> DataSummary {
        DataSummary {
            device_count: self.device_count,
            readings_analyzed: self.overall_summary.total_readings,
            time_range: self.overall_summary.time_range.clone(),
        }
    }
}

/// What an advice request looked at, reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataSummary {
    pub device_count: usize,
    pub readings_analyzed: usize,
    pub time_range: String,
}

#[derive(Debug, Clone)]
pub struct AdviceSettings {
    pub sample_target: usize,
    pub retry: RetryConfig,
}

impl Default for AdviceSettings {
    fn default() -> Self {
        Self {
            sample_target: DEFAULT_SAMPLE_TARGET,
            retry: RetryConfig::for_generator(),
        }
    }
}

/// Validated advice and how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAdvice {
    pub result: AdviceResult,
    pub source: AdviceSource,
    /// Generator calls made.
    pub attempts: u32,
}

/// Result of a full advice request.
#[derive(Debug, Clone, PartialEq)]
pub struct AdviceOutcome {
    pub record: AdviceRecord,
    pub data_summary: DataSummary,
}

/// Turns cached readings into advice.
pub struct AdviceAssembler<G> {
    generator: G,
    settings: AdviceSettings,
}

impl<G: AdviceGenerator> AdviceAssembler<G> {
    pub fn new(generator: G, settings: AdviceSettings) -> Self {
        Self {
            generator,
            settings,
        }
    }

    pub fn settings(&self) -> &AdviceSettings {
        &self.settings
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    /// Build the generator payload from the cache alone.
    pub fn assemble(&self, cache: &ReadingsCache, user_id: &str) -> Result<AdvicePayload> {
        let view = cache
            .get(user_id)
            .ok_or_else(|| Error::CacheUnavailableForAdvice {
                user_id: user_id.to_string(),
            })?;
        Ok(AdvicePayload::build(
            user_id,
            &view.devices,
            &view.buffers,
            &view.advice_history,
            self.settings.sample_target,
        ))
    }

    /// Call the generator and turn its answer into validated advice.
    ///
    /// Never fails: every generator problem degrades to default advice with
    /// a matching [`AdviceSource`].
    pub async fn generate(&self, payload: &AdvicePayload) -> GeneratedAdvice {
        let attempts = AtomicU32::new(0);
        let generator = &self.generator;
        let attempts_ref = &attempts;

        debug!(user = %payload.user_id, "CALLING_GENERATOR");
        let outcome = with_retry(&self.settings.retry, "generate_advice", move || {
            if attempts_ref.fetch_add(1, Ordering::SeqCst) > 0 {
                debug!(user = %payload.user_id, "RETRYING");
            }
            generator.generate(payload)
        })
        .await;
        let attempts = attempts.load(Ordering::SeqCst);

        let (result, source) = match outcome {
            Ok(text) => {
                debug!(user = %payload.user_id, "PARSING");
                match parse_advice_response(&text) {
                    Some(value) => (validate_advice(&value, payload), AdviceSource::Generated),
                    None => {
                        warn!(
                            "{} returned malformed advice for {}",
                            generator.name(),
                            payload.user_id
                        );
                        debug!(user = %payload.user_id, "DEFAULTING");
                        (default_advice(payload), AdviceSource::DefaultMalformed)
                    }
                }
            }
            Err(GeneratorError::QuotaExhausted(msg)) => {
                warn!(
                    "{} quota exhausted after {} attempts: {}",
                    generator.name(),
                    attempts,
                    msg
                );
                debug!(user = %payload.user_id, "DEFAULTING");
                (default_advice(payload), AdviceSource::DefaultExhausted)
            }
            Err(GeneratorError::Failed(msg)) => {
                warn!("{} failed: {}", generator.name(), msg);
                debug!(user = %payload.user_id, "DEFAULTING");
                (default_advice(payload), AdviceSource::DefaultFailed)
            }
        };

        GeneratedAdvice {
            result,
            source,
            attempts,
        }
    }

    /// Persist advice and append it to the cached history.
    ///
    /// Persistence is best-effort; a store failure is logged and the record
    /// is still returned.
    pub fn record<S>(
        &self,
        cache: &ReadingsCache,
        sink: &mut S,
        user_id: &str,
        generated: GeneratedAdvice,
    ) -> AdviceRecord
    where
        S: AdviceSink + ?Sized,
    {
        let record = AdviceRecord {
            generated_at: cache.now(),
            source: generated.source,
            advice: generated.result,
        };
        if let Err(e) = sink.save_advice(user_id, &record) {
            warn!("Failed to persist advice for {}: {}", user_id, e);
        }
        cache.append_advice(user_id, record.clone());
        record
    }

    /// Full request: assemble, generate, persist.
    ///
    /// The store lock is only taken for the final write.
    pub async fn request_advice<S>(
        &self,
        cache: &ReadingsCache,
        store: &tokio::sync::Mutex<S>,
        user_id: &str,
    ) -> Result<AdviceOutcome>
    where
        S: AdviceSink + Send,
    {
        debug!(user = %user_id, "ASSEMBLING");
        let payload = self.assemble(cache, user_id)?;

        let generated = self.generate(&payload).await;

        debug!(user = %user_id, "PERSISTING");
        let record = {
            let mut store = store.lock().await;
            self.record(cache, &mut *store, user_id, generated)
        };

        info!(
            "Advice for {} ready ({}, {} devices)",
            user_id,
            record.source.as_str(),
            payload.device_count
        );
        debug!(user = %user_id, "DONE");
        Ok(AdviceOutcome {
            record,
            data_summary: payload.data_summary(),
        })
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn stride_sample_bounded_with_ends(len in 0usize..500, target in 2usize..60) {
            let items: Vec<usize> = (0..len).collect();
            let sampled = stride_sample(&items, target);

            prop_assert!(sampled.len() <= target);
            prop_assert_eq!(sampled.len(), len.min(target));
            if len > 0 {
                prop_assert_eq!(sampled.first(), Some(&0));
                prop_assert_eq!(sampled.last(), Some(&(len - 1)));
            }
            prop_assert!(sampled.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
