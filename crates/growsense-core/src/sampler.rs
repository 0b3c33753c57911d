//! Time-spaced sampling of a device's full reading history.
//!
//! The sampler walks backward from the latest reading in equal steps and
//! picks the latest reading at or before each point, so recent periods are
//! covered first and gaps in the data are skipped rather than padded.

use time::OffsetDateTime;
use tracing::debug;

use growsense_types::{Reading, ReadingSource};

use crate::error::{Error, Result};

/// Hard upper bound on historic samples per device.
pub const MAX_HISTORIC_SAMPLES: u32 = 120;

/// Picks up to `target` readings spread across a device's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoricSampler {
    target: u32,
}

impl Default for HistoricSampler {
    fn default() -> Self {
        Self {
            target: MAX_HISTORIC_SAMPLES,
        }
    }
}

impl HistoricSampler {
    /// A sampler aiming for `target` points, capped at [`MAX_HISTORIC_SAMPLES`].
    pub fn new(target: u32) -> Self {
        Self {
            target: target.min(MAX_HISTORIC_SAMPLES),
        }
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Sample a device's history, newest first.
    ///
    /// Returns an empty list when the device has no readings or all of them
    /// share one timestamp. Consecutive query points that land on the same
    /// reading yield it once; readings without an id are matched by
    /// `server_timestamp`.
    pub fn sample<S>(&self, source: &S, user_id: &str, device_id: &str) -> Result<Vec<Reading>>
    where
        S: ReadingSource + ?Sized,
    {
        let Some((earliest, latest)) = source
            .reading_bounds(user_id, device_id)
            .map_err(Error::from_source)?
        else {
            return Ok(Vec::new());
        };
        if earliest >= latest || self.target == 0 {
            return Ok(Vec::new());
        }

        let step = (latest - earliest) / self.target;
        let mut samples: Vec<Reading> = Vec::with_capacity(self.target as usize);

        for i in 1..self.target {
            let query_time: OffsetDateTime = latest - step * i;
            let Some(reading) = source
                .latest_reading_before(user_id, device_id, query_time)
                .map_err(Error::from_source)?
            else {
                continue;
            };

            let duplicate = samples
                .last()
                .is_some_and(|prev| same_reading(prev, &reading));
            if !duplicate {
                samples.push(reading);
            }
        }

        debug!(
            "Sampled {} historic readings for {}/{} (target {})",
            samples.len(),
            user_id,
            device_id,
            self.target
        );
        Ok(samples)
    }
}

fn same_reading(a: &Reading, b: &Reading) -> bool {
    match (&a.id, &b.id) {
        (Some(x), Some(y)) => x == y,
        _ => a.server_timestamp == b.server_timestamp,
    }
}
