//! Core logic for the GrowSense plant-sensor server.
//!
//! This crate holds the in-memory parts of the server, independent of the
//! HTTP layer and of any particular backing store:
//!
//! - **Readings cache**: per-user, TTL-bounded snapshot of devices, recent
//!   readings, and prior advice ([`ReadingsCache`])
//! - **Historic sampling**: evenly spaced readings across a device's full
//!   history ([`HistoricSampler`])
//! - **Cache loading**: read-through population from a [`ReadingSource`]
//!   ([`CacheLoader`])
//! - **Advice assembly**: payload building, generator calls with retry,
//!   response validation, and default advice ([`AdviceAssembler`])
//! - **Sleep policy**: adaptive device sleep intervals ([`sleep`])
//!
//! The store is reached through the [`ReadingSource`] and [`AdviceSink`]
//! traits from `growsense-types`.
//!
//! # Quick Start
//!
//! ```
//! use growsense_core::{CacheSettings, ReadingsCache};
//! use std::collections::HashMap;
//!
//! let cache = ReadingsCache::new(CacheSettings::default());
//! assert!(cache.get("user-1").is_none());
//!
//! cache.set("user-1", Vec::new(), HashMap::new(), None);
//! assert!(cache.get("user-1").is_some());
//! ```
//!
//! [`ReadingSource`]: growsense_types::ReadingSource
//! [`AdviceSink`]: growsense_types::AdviceSink

pub mod advice;
pub mod cache;
pub mod clock;
pub mod error;
pub mod generator;
pub mod loader;
pub mod response;
pub mod retry;
pub mod sampler;
pub mod sleep;

#[cfg(test)]
mod testing;

pub use advice::{
    AdviceAssembler, AdviceOutcome, AdvicePayload, AdviceSettings, DataSummary, DevicePayload,
    FieldSummary, GeneratedAdvice, Summary, stride_sample,
};
pub use cache::{CacheSettings, CacheStats, ReadingsCache, UserView};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BoxError, Error, Result};
pub use generator::{AdviceGenerator, GeneratorError};
pub use loader::{CacheLoader, DeviceFailure, LoadedUser};
pub use response::{default_advice, parse_advice_response, validate_advice};
pub use retry::{RetryConfig, Retryable, with_retry};
pub use sampler::HistoricSampler;
pub use sleep::{SleepDecision, SleepSource, adaptive_sleep_duration, resolve_sleep};

// Re-export the shared data model
pub use growsense_types::{
    AdviceRecord, AdviceResult, AdviceSink, AdviceSource, DeviceAdvice, DeviceMetadata,
    DeviceMetadataUpdate, PerDeviceBuffer, Priority, Reading, ReadingSource, SensorField,
};
