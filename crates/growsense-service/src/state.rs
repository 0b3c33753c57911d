//! Application state shared across handlers.
//!
//! The store is a single SQLite connection behind a `tokio::sync::Mutex`;
//! the readings cache has its own internal lock. Handlers take the store lock
//! only for the duration of a query and never while awaiting the advice
//! generator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use growsense_core::{AdviceAssembler, AdviceGenerator, CacheLoader, ReadingsCache};
use growsense_store::{DeviceCredentials, Store};

use crate::config::Config;
use crate::generator::build_generator;

/// Shared application state.
pub struct AppState {
    /// The data store (wrapped in Mutex for thread-safe access).
    pub store: Mutex<Store>,
    pub config: Config,
    pub cache: ReadingsCache,
    pub loader: CacheLoader,
    pub advisor: AdviceAssembler<Box<dyn AdviceGenerator>>,
    pub device_keys: DeviceKeyCache,
    pub last_seen: LastSeenThrottle,
}

impl AppState {
    /// Create state with the generator selected by `config.advice`.
    pub fn new(store: Store, config: Config) -> Arc<Self> {
        let generator = build_generator(&config.advice);
        Self::with_generator(store, config, generator)
    }

    pub fn with_generator(
        store: Store,
        config: Config,
        generator: Box<dyn AdviceGenerator>,
    ) -> Arc<Self> {
        Self::with_parts(
            store,
            ReadingsCache::new(config.cache.settings()),
            config,
            generator,
        )
    }

    /// Create state around an existing cache (e.g. one driven by a manual clock).
    pub fn with_parts(
        store: Store,
        cache: ReadingsCache,
        config: Config,
        generator: Box<dyn AdviceGenerator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(store),
            loader: config.cache.loader(),
            advisor: AdviceAssembler::new(generator, config.advice.settings()),
            device_keys: DeviceKeyCache::new(Duration::from_secs(
                config.security.device_key_cache_secs,
            )),
            last_seen: LastSeenThrottle::new(Duration::from_secs(
                config.security.last_seen_throttle_secs,
            )),
            cache,
            config,
        })
    }

    /// User id for a bearer token, if it is known.
    pub fn user_for_token(&self, token: &str) -> Option<&str> {
        use subtle::ConstantTimeEq;

        // No early exit: every entry is compared.
        let mut found = None;
        for user in &self.config.security.users {
            if bool::from(user.token.as_bytes().ct_eq(token.as_bytes())) {
                found = Some(user.user_id.as_str());
            }
        }
        found
    }
}

/// Verified device credentials, kept for a short time to skip store lookups.
#[derive(Debug)]
pub struct DeviceKeyCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (DeviceCredentials, Instant)>>,
}

impl DeviceKeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceCredentials> {
        let entries = self.entries.read().await;
        entries
            .get(device_id)
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(creds, _)| creds.clone())
    }

    pub async fn insert(&self, device_id: &str, creds: DeviceCredentials) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, at)| at.elapsed() < self.ttl);
        entries.insert(device_id.to_string(), (creds, Instant::now()));
    }

    pub async fn remove(&self, device_id: &str) {
        self.entries.write().await.remove(device_id);
    }
}

/// Limits how often a device's `last_seen` is written.
#[derive(Debug)]
pub struct LastSeenThrottle {
    interval: Duration,
    last: RwLock<HashMap<String, Instant>>,
}

impl LastSeenThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: RwLock::new(HashMap::new()),
        }
    }

    /// Whether a refresh is due; marks the device as refreshed if so.
    pub async fn should_refresh(&self, device_id: &str) -> bool {
        self.should_refresh_at(device_id, Instant::now()).await
    }

    async fn should_refresh_at(&self, device_id: &str, now: Instant) -> bool {
        let mut last = self.last.write().await;
        match last.get(device_id) {
            Some(prev) if now.saturating_duration_since(*prev) < self.interval => false,
            _ => {
                last.insert(device_id.to_string(), now);
                true
            }
        }
    }
}
