//! Server configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use growsense_core::{
    AdviceSettings, CacheLoader, CacheSettings, HistoricSampler, RetryConfig,
    sampler::MAX_HISTORIC_SAMPLES,
};

/// Environment variable that overrides `advice.api_key`.
pub const GEMINI_API_KEY_ENV: &str = "GROWSENSE_GEMINI_API_KEY";

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub advice: AdviceConfig,
    pub security: SecurityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Apply overrides from the environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(GEMINI_API_KEY_ENV).filter(|k| !k.trim().is_empty()) {
            self.advice.api_key = Some(key);
        }
    }

    /// Validate the configuration and return every problem found.
    ///
    /// ```
    /// use growsense_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.cache.validate());
        errors.extend(self.advice.validate());
        errors.extend(self.security.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

fn error(field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError {
        field: field.to_string(),
        message: message.into(),
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.bind.is_empty() {
            errors.push(error("server.bind", "bind address cannot be empty"));
            return errors;
        }

        match self.bind.rsplit_once(':') {
            None => errors.push(error(
                "server.bind",
                format!(
                    "invalid bind address '{}': expected format 'host:port'",
                    self.bind
                ),
            )),
            Some((_, port)) => match port.parse::<u16>() {
                Ok(0) => errors.push(error("server.bind", "port cannot be 0")),
                Err(_) => errors.push(error(
                    "server.bind",
                    format!("invalid port '{}': must be a number 1-65535", port),
                )),
                Ok(_) => {}
            },
        }

        errors
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: growsense_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        if self.path.as_os_str().is_empty() {
            vec![error("storage.path", "database path cannot be empty")]
        } else {
            Vec::new()
        }
    }
}

/// Readings cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of a user's cache entry.
    pub ttl_secs: u64,
    /// Cap on each device's `recent` buffer.
    pub max_readings_per_device: usize,
    /// Readings sampled across a device's full history.
    pub historic_samples: u32,
    /// Newest readings loaded per device on a cache fill.
    pub recent_limit: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 86_400,
            max_readings_per_device: 200,
            historic_samples: MAX_HISTORIC_SAMPLES,
            recent_limit: 200,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.ttl_secs == 0 {
            errors.push(error("cache.ttl_secs", "must be greater than 0"));
        }
        if self.max_readings_per_device == 0 {
            errors.push(error("cache.max_readings_per_device", "must be greater than 0"));
        }
        if self.historic_samples == 0 {
            errors.push(error("cache.historic_samples", "must be greater than 0"));
        } else if self.historic_samples > MAX_HISTORIC_SAMPLES {
            errors.push(error(
                "cache.historic_samples",
                format!("cannot exceed {}", MAX_HISTORIC_SAMPLES),
            ));
        }
        if self.recent_limit == 0 {
            errors.push(error("cache.recent_limit", "must be greater than 0"));
        }
        errors
    }

    pub fn settings(&self) -> CacheSettings {
        CacheSettings {
            ttl: Duration::from_secs(self.ttl_secs),
            max_readings_per_device: self.max_readings_per_device,
        }
    }

    pub fn loader(&self) -> CacheLoader {
        CacheLoader::new(self.recent_limit, HistoricSampler::new(self.historic_samples))
    }
}

/// Which generator produces advice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdviceProvider {
    /// Offline, deterministic advice from sensor statistics.
    #[default]
    Builtin,
    /// Google Gemini `generateContent` API.
    Gemini,
}

/// Advice generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdviceConfig {
    pub provider: AdviceProvider,
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
    pub timeout_secs: u64,
    /// Total generator calls per request, first attempt included.
    pub max_attempts: u32,
    /// First backoff; doubles on each retry.
    pub initial_backoff_secs: u64,
    /// Readings per device sent to the generator.
    pub sample_target: usize,
}

impl Default for AdviceConfig {
    fn default() -> Self {
        Self {
            provider: AdviceProvider::Builtin,
            api_key: None,
            model: "gemini-1.5-flash".to_string(),
            endpoint: "https://generativelanguage.googleapis.com".to_string(),
            timeout_secs: 30,
            max_attempts: 3,
            initial_backoff_secs: 5,
            sample_target: growsense_core::advice::DEFAULT_SAMPLE_TARGET,
        }
    }
}

impl AdviceConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.provider == AdviceProvider::Gemini
            && self.api_key.as_deref().is_none_or(|k| k.trim().is_empty())
        {
            errors.push(error(
                "advice.api_key",
                format!(
                    "the gemini provider requires an API key (set it here or via {})",
                    GEMINI_API_KEY_ENV
                ),
            ));
        }
        if self.model.trim().is_empty() {
            errors.push(error("advice.model", "model cannot be empty"));
        }
        if self.timeout_secs == 0 {
            errors.push(error("advice.timeout_secs", "must be greater than 0"));
        }
        if self.max_attempts == 0 {
            errors.push(error("advice.max_attempts", "must be at least 1"));
        }
        if self.sample_target < 2 {
            errors.push(error("advice.sample_target", "must be at least 2"));
        }
        errors
    }

    pub fn settings(&self) -> AdviceSettings {
        AdviceSettings {
            sample_target: self.sample_target,
            retry: RetryConfig::from_attempts(
                self.max_attempts,
                Duration::from_secs(self.initial_backoff_secs),
            ),
        }
    }
}

/// A bearer token and the user it authenticates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserToken {
    pub token: String,
    pub user_id: String,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Static bearer-token table.
    pub users: Vec<UserToken>,
    /// How long verified device keys are trusted without a store lookup.
    pub device_key_cache_secs: u64,
    /// Minimum gap between `last_seen` writes for one device.
    pub last_seen_throttle_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            users: Vec::new(),
            device_key_cache_secs: 300,
            last_seen_throttle_secs: 60,
        }
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for (i, user) in self.users.iter().enumerate() {
            let prefix = format!("security.users[{}]", i);
            if user.token.trim().is_empty() {
                errors.push(error(&format!("{prefix}.token"), "token cannot be empty"));
            } else if !seen.insert(user.token.as_str()) {
                errors.push(error(&format!("{prefix}.token"), "duplicate token"));
            }
            if user.user_id.trim().is_empty() {
                errors.push(error(&format!("{prefix}.user_id"), "user id cannot be empty"));
            }
        }
        if self.device_key_cache_secs == 0 {
            errors.push(error("security.device_key_cache_secs", "must be greater than 0"));
        }
        if self.last_seen_throttle_secs == 0 {
            errors.push(error(
                "security.last_seen_throttle_secs",
                "must be greater than 0",
            ));
        }
        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `server.bind` or `security.users[0].token`).
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("growsense")
        .join("server.toml")
}
