//! HTTP REST API for GrowSense plant sensors.
//!
//! This crate provides a service that:
//! - Accepts sensor uploads authenticated with per-device API keys
//! - Stores readings in the local database
//! - Serves each user's readings from a TTL-bounded cache
//! - Generates plant care advice and feeds it back into device sleep intervals
//!
//! # REST API Endpoints
//!
//! - `GET /health` - Service health check (no auth required)
//! - `POST /upload_data` - Sensor upload (device API key in the body)
//! - `GET /auth/me` - The authenticated user
//! - `POST /devices/register` - Register a device or rotate its key
//! - `GET /devices`, `GET|DELETE /devices/{id}` - Device management
//! - `POST /devices/{id}/config` - Sleep interval, adaptive mode, and name
//! - `POST /devices/{id}/health_score` - Set a plant health score
//! - `PUT /devices/{id}/description` - Set or clear a description
//! - `GET /user_data` - Readings across devices (cache-first)
//! - `GET /user_data/historical` - One reading per device per hour
//! - `GET /user_data/{device_id}` - Readings of one device
//! - `GET /user_data/{device_id}/export` - CSV export
//! - `GET /user_advice` - Plant care advice
//! - `GET /cache/stats`, `DELETE /cache` - Cache control
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/growsense/server.toml`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [storage]
//! path = "~/.local/share/growsense/data.db"
//!
//! [cache]
//! ttl_secs = 86400
//! max_readings_per_device = 200
//!
//! [advice]
//! provider = "gemini"   # or "builtin"
//! model = "gemini-1.5-flash"
//!
//! [[security.users]]
//! token = "a-long-random-token"
//! user_id = "alice"
//! ```
//!
//! The Gemini key can also be supplied through `GROWSENSE_GEMINI_API_KEY`.

pub mod api;
pub mod config;
pub mod generator;
pub mod middleware;
pub mod state;

pub use config::{
    AdviceConfig, AdviceProvider, CacheConfig, Config, ConfigError, SecurityConfig, ServerConfig,
    StorageConfig, UserToken,
};
pub use generator::{BuiltinGenerator, GeminiGenerator, build_generator};
pub use middleware::AuthUser;
pub use state::AppState;
