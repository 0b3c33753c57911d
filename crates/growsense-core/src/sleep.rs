//! Device sleep interval policy.
//!
//! A device asks the server how long to sleep after each upload. Healthy
//! plants are sampled rarely; struggling ones often.

use serde::Serialize;

use growsense_types::DeviceMetadata;
use growsense_types::validation::MAX_HEALTH_SCORE;

/// Interval used whenever no better information is available, in seconds.
pub const DEFAULT_SLEEP_SECS: u32 = 60;

/// Where a [`SleepDecision`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepSource {
    Default,
    Adaptive,
    AdaptiveNoScore,
    Manual,
}

impl SleepSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SleepSource::Default => "default",
            SleepSource::Adaptive => "adaptive",
            SleepSource::AdaptiveNoScore => "adaptive_no_score",
            SleepSource::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SleepDecision {
    /// Seconds until the next upload.
    pub duration: u32,
    pub source: SleepSource,
    pub health_score: Option<f64>,
}

/// Sleep interval for a plant health score (0 = critical, 10 = thriving).
///
/// Piecewise linear from 30 s at score 2 up to 1800 s at score 10. An
/// unknown score gets [`DEFAULT_SLEEP_SECS`].
///
/// ```
/// use growsense_core::sleep::adaptive_sleep_duration;
///
/// assert_eq!(adaptive_sleep_duration(Some(1.0)), 30);
/// assert_eq!(adaptive_sleep_duration(Some(5.0)), 120);
/// assert_eq!(adaptive_sleep_duration(None), 60);
/// ```
pub fn adaptive_sleep_duration(score: Option<f64>) -> u32 {
    let Some(score) = score.filter(|s| !s.is_nan()) else {
        return DEFAULT_SLEEP_SECS;
    };
    let s = score.clamp(0.0, MAX_HEALTH_SCORE);

    let secs = if s <= 2.0 {
        30.0
    } else if s <= 4.0 {
        45.0 + (s - 2.0) * 7.5
    } else if s <= 6.0 {
        60.0 + (s - 4.0) * 60.0
    } else if s <= 8.0 {
        180.0 + (s - 6.0) * 210.0
    } else {
        600.0 + (s - 8.0) * 600.0
    };
    secs as u32
}

/// Decide how long a device should sleep.
///
/// Adaptive mode wins over a manual interval when both are set.
pub fn resolve_sleep(meta: Option<&DeviceMetadata>) -> SleepDecision {
    let Some(meta) = meta else {
        return SleepDecision {
            duration: DEFAULT_SLEEP_SECS,
            source: SleepSource::Default,
            health_score: None,
        };
    };
    let health_score = meta.plant_health_score;

    let (duration, source) = match (meta.adaptive_sleep_enabled, health_score, meta.target_interval) {
        (true, Some(score), _) => (adaptive_sleep_duration(Some(score)), SleepSource::Adaptive),
        (true, None, _) => (DEFAULT_SLEEP_SECS, SleepSource::AdaptiveNoScore),
        (false, _, Some(interval)) => (interval, SleepSource::Manual),
        (false, _, None) => (DEFAULT_SLEEP_SECS, SleepSource::Default),
    };

    SleepDecision {
        duration,
        source,
        health_score,
    }
}
