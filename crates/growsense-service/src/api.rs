//! REST API endpoints for the GrowSense service.
//!
//! # Concurrency and Lock Acquisition
//!
//! - **`state.store`** (Mutex): held only for the duration of a query. It is
//!   never held across the advice generator call.
//! - **`state.cache`**: internally locked; safe to call with or without the
//!   store lock held.
//!
//! ## Error Handling
//!
//! All endpoints return structured JSON errors via [`AppError`]. Store errors
//! map to HTTP 500 except for unknown devices (404) and devices owned by
//! another user (409). Input validation happens before the cache or store is
//! touched.

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, info, warn};

use growsense_core::{
    AdviceResult, AdviceSource, CacheStats, DataSummary, DeviceMetadata, DeviceMetadataUpdate,
    Priority, Reading, SleepSource, adaptive_sleep_duration, resolve_sleep,
};
use growsense_store::{ReadingQuery, RegisterOutcome};
use growsense_types::ValidationError;
use growsense_types::validation::{
    validate_description, validate_health_score, validate_target_interval,
};

use crate::middleware::{AuthUser, require_user, verify_device_key};
use crate::state::AppState;

/// Default page size for reading queries.
pub const DEFAULT_LIMIT: u32 = 100;
/// Largest page size accepted for reading queries.
pub const MAX_LIMIT: u32 = 1000;
/// Default window for the sparse history view, in hours (one week).
pub const DEFAULT_HISTORY_HOURS: u32 = 168;
/// Longest window for the sparse history view, in hours (two weeks).
pub const MAX_HISTORY_HOURS: u32 = 336;

/// Create the API router.
///
/// Everything except `/health` and `/upload_data` requires a bearer token.
pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/auth/me", get(auth_me))
        // Device management
        .route("/devices/register", post(register_device))
        .route("/devices", get(list_devices))
        .route("/devices/{id}", get(get_device).delete(remove_device))
        .route("/devices/{id}/config", post(update_device_config))
        .route("/devices/{id}/health_score", post(update_health_score))
        .route("/devices/{id}/description", put(update_description))
        // Data endpoints
        .route("/user_data", get(get_user_data))
        .route("/user_data/historical", get(get_historical_data))
        .route("/user_data/{device_id}", get(get_device_data))
        .route("/user_data/{device_id}/export", get(export_device_data))
        .route("/user_advice", get(get_user_advice))
        // Cache control
        .route("/cache/stats", get(cache_stats))
        .route("/cache", delete(clear_cache))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_user));

    Router::new()
        .route("/health", get(health))
        .route("/upload_data", post(upload_data))
        .merge(protected)
        .with_state(state)
}

/// Parse a timestamp given as RFC 3339 or as Unix epoch seconds.
fn parse_timestamp(field: &str, raw: &str) -> Result<OffsetDateTime, AppError> {
    let raw = raw.trim();
    if let Ok(dt) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Ok(dt);
    }
    raw.parse::<f64>()
        .ok()
        .and_then(epoch_seconds)
        .ok_or_else(|| {
            AppError::BadRequest(format!(
                "Invalid {field} '{raw}': expected RFC 3339 or epoch seconds"
            ))
        })
}

/// Drop sub-millisecond precision, which the store does not keep.
fn truncate_to_millis(at: OffsetDateTime) -> OffsetDateTime {
    at - Duration::nanoseconds(i64::from(at.nanosecond() % 1_000_000))
}

fn epoch_seconds(secs: f64) -> Option<OffsetDateTime> {
    if !secs.is_finite() {
        return None;
    }
    OffsetDateTime::from_unix_timestamp_nanos((secs * 1e9) as i128).ok()
}

/// Device-reported timestamp from an upload body; `None` means "use server time".
fn parse_device_timestamp(value: &Value) -> Result<Option<OffsetDateTime>, AppError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => parse_timestamp("timestamp", s).map(Some),
        Value::Number(n) => n
            .as_f64()
            .and_then(epoch_seconds)
            .map(Some)
            .ok_or_else(|| AppError::BadRequest(format!("Invalid timestamp {n}"))),
        other => Err(AppError::BadRequest(format!("Invalid timestamp {other}"))),
    }
}

// ==========================================================================
// Health
// ==========================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "GrowSense API",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: state.cache.now(),
    })
}

// ==========================================================================
// Sensor uploads
// ==========================================================================

#[derive(Debug, Deserialize)]
struct UploadRequest {
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    timestamp: Option<Value>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    light: Option<f64>,
    soil_moisture: Option<f64>,
    uv_light: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
    pub device_id: String,
    pub reading_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub sleep_duration: u32,
    pub sleep_source: SleepSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plant_health_score: Option<f64>,
}

/// Accept one reading from a sensor.
///
/// Writing the reading is the only step that can fail the request; cache
/// updates, the `last_seen` refresh, and the metadata lookup for the sleep
/// decision are best-effort.
async fn upload_data(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let request: UploadRequest = serde_json::from_value(body.clone())
        .map_err(|e| AppError::BadRequest(format!("Invalid upload body: {e}")))?;
    if request.device_id.trim().is_empty() {
        return Err(ValidationError::MissingField("device_id").into());
    }
    if request.api_key.is_empty() {
        return Err(ValidationError::MissingField("api_key").into());
    }
    let device_timestamp = match &request.timestamp {
        Some(value) => parse_device_timestamp(value)?,
        None => None,
    };
    let device_id = request.device_id.as_str();

    let user_id = verify_device_key(&state, device_id, &request.api_key).await?;

    let now = truncate_to_millis(state.cache.now());
    let mut raw = body;
    if let Value::Object(map) = &mut raw {
        map.remove("api_key");
    }
    let mut reading = Reading::new(now).with_device(device_id).with_raw(raw);
    reading.timestamp = device_timestamp.map(truncate_to_millis);
    reading.temperature = request.temperature;
    reading.humidity = request.humidity;
    reading.light = request.light;
    reading.soil_moisture = request.soil_moisture;
    reading.uv_light = request.uv_light;

    // The cache update happens under the store lock so a concurrent
    // populate cannot load this row and then see it pushed again.
    let reading_id = {
        let store = state.store.lock().await;
        let reading_id = store.write_reading(&user_id, device_id, &reading)?;
        reading.id = Some(reading_id.clone());
        if !state.cache.update_reading(&user_id, device_id, reading) {
            debug!("No cache entry for {}; skipped cache update", user_id);
        }
        reading_id
    };

    if state.last_seen.should_refresh(device_id).await {
        let touched = {
            let store = state.store.lock().await;
            store.touch_last_seen(&user_id, device_id, now)
        };
        if let Err(e) = touched {
            warn!("Failed to update last_seen for {}: {}", device_id, e);
        }
        state
            .cache
            .update_device_metadata(&user_id, device_id, &DeviceMetadataUpdate::last_seen(now));
    }

    let meta = {
        let store = state.store.lock().await;
        store.get_device_metadata(&user_id, device_id)
    }
    .unwrap_or_else(|e| {
        warn!("Failed to load metadata for {}: {}", device_id, e);
        None
    });
    let sleep = resolve_sleep(meta.as_ref());

    info!(
        "Stored reading {} from {} (sleep {}s, {})",
        reading_id,
        device_id,
        sleep.duration,
        sleep.source.as_str()
    );

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            success: true,
            message: "Data uploaded successfully".to_string(),
            device_id: device_id.to_string(),
            reading_id,
            timestamp: now,
            sleep_duration: sleep.duration,
            sleep_source: sleep.source,
            plant_health_score: sleep.health_score,
        }),
    ))
}

// ==========================================================================
// Account
// ==========================================================================

async fn auth_me(Extension(user): Extension<AuthUser>) -> Json<Value> {
    Json(serde_json::json!({
        "success": true,
        "user": { "uid": user.id() },
    }))
}

// ==========================================================================
// Devices
// ==========================================================================

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    api_key: String,
    name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    pub success: bool,
    pub device: DeviceMetadata,
}

#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    pub success: bool,
    pub count: usize,
    pub devices: Vec<DeviceMetadata>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

impl MessageResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

/// Register a device (or refresh its key) for the caller.
///
/// Returns 201 for a new device, 200 for a re-registration, and 409 if the
/// device belongs to someone else.
async fn register_device(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<DeviceResponse>), AppError> {
    let device_id = request.device_id.trim();
    if device_id.is_empty() {
        return Err(ValidationError::MissingField("device_id").into());
    }
    if request.api_key.is_empty() {
        return Err(ValidationError::MissingField("api_key").into());
    }
    let name = request
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());

    let (outcome, device) = {
        let store = state.store.lock().await;
        let outcome = store.register_device(user.id(), device_id, &request.api_key, name)?;
        let device = store
            .get_device_metadata(user.id(), device_id)?
            .ok_or_else(|| AppError::Internal(format!("Device {} vanished", device_id)))?;
        (outcome, device)
    };

    state.cache.invalidate(user.id());
    state.device_keys.remove(device_id).await;

    let status = match outcome {
        RegisterOutcome::Created => StatusCode::CREATED,
        RegisterOutcome::Updated => StatusCode::OK,
    };
    Ok((
        status,
        Json(DeviceResponse {
            success: true,
            device,
        }),
    ))
}

async fn list_devices(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<DeviceListResponse>, AppError> {
    let devices = state.store.lock().await.list_devices(user.id())?;
    Ok(Json(DeviceListResponse {
        success: true,
        count: devices.len(),
        devices,
    }))
}

async fn get_device(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<DeviceResponse>, AppError> {
    let device = state
        .store
        .lock()
        .await
        .get_device_metadata(user.id(), &id)?
        .ok_or_else(|| AppError::NotFound(format!("Device not found: {}", id)))?;
    Ok(Json(DeviceResponse {
        success: true,
        device,
    }))
}

/// Remove a device. Its readings stay in the store.
async fn remove_device(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    let removed = state.store.lock().await.remove_device(user.id(), &id)?;
    if !removed {
        return Err(AppError::NotFound(format!("Device not found: {}", id)));
    }
    state.cache.invalidate(user.id());
    state.device_keys.remove(&id).await;
    Ok(MessageResponse::ok(format!("Device {} removed", id)))
}

#[derive(Debug, Deserialize)]
struct DeviceConfigRequest {
    target_interval: Option<i64>,
    adaptive_sleep_enabled: Option<bool>,
    name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeviceConfigResponse {
    pub success: bool,
    pub device: DeviceMetadata,
    /// Sleep the device will get under adaptive mode, when a score is known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculated_adaptive_sleep: Option<u32>,
}

async fn update_device_config(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(request): Json<DeviceConfigRequest>,
) -> Result<Json<DeviceConfigResponse>, AppError> {
    let target_interval = request
        .target_interval
        .map(validate_target_interval)
        .transpose()?;
    let name = request
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());
    if target_interval.is_none() && request.adaptive_sleep_enabled.is_none() && name.is_none() {
        return Err(AppError::BadRequest(
            "No configuration fields provided".to_string(),
        ));
    }

    let device = state.store.lock().await.update_device_config(
        user.id(),
        &id,
        target_interval,
        request.adaptive_sleep_enabled,
        name,
    )?;

    let update = DeviceMetadataUpdate {
        target_interval,
        adaptive_sleep_enabled: request.adaptive_sleep_enabled,
        name: name.map(str::to_string),
        ..Default::default()
    };
    state.cache.update_device_metadata(user.id(), &id, &update);
    state.device_keys.remove(&id).await;

    let calculated_adaptive_sleep = device
        .plant_health_score
        .filter(|_| device.adaptive_sleep_enabled)
        .map(|score| adaptive_sleep_duration(Some(score)));

    Ok(Json(DeviceConfigResponse {
        success: true,
        device,
        calculated_adaptive_sleep,
    }))
}

#[derive(Debug, Deserialize)]
struct HealthScoreRequest {
    #[serde(alias = "score")]
    health_score: f64,
}

#[derive(Debug, Serialize)]
pub struct HealthScoreResponse {
    pub success: bool,
    pub device_id: String,
    pub health_score: f64,
    pub calculated_sleep_duration: u32,
}

async fn update_health_score(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(request): Json<HealthScoreRequest>,
) -> Result<Json<HealthScoreResponse>, AppError> {
    let score = validate_health_score(request.health_score)?;

    state
        .store
        .lock()
        .await
        .set_health_score(user.id(), &id, score, None)?;

    let update = DeviceMetadataUpdate {
        plant_health_score: Some(score),
        ..Default::default()
    };
    state.cache.update_device_metadata(user.id(), &id, &update);

    Ok(Json(HealthScoreResponse {
        success: true,
        device_id: id,
        health_score: score,
        calculated_sleep_duration: adaptive_sleep_duration(Some(score)),
    }))
}

#[derive(Debug, Deserialize)]
struct DescriptionRequest {
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DescriptionResponse {
    pub success: bool,
    pub device_id: String,
    pub description: Option<String>,
}

/// Set or clear a device's free-text description.
async fn update_description(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(request): Json<DescriptionRequest>,
) -> Result<Json<DescriptionResponse>, AppError> {
    if let Some(description) = &request.description {
        validate_description(description)?;
    }
    let description = request
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());

    state
        .store
        .lock()
        .await
        .set_description(user.id(), &id, description.as_deref())?;

    let update = DeviceMetadataUpdate {
        description: Some(description.clone()),
        ..Default::default()
    };
    state.cache.update_device_metadata(user.id(), &id, &update);

    Ok(Json(DescriptionResponse {
        success: true,
        device_id: id,
        description,
    }))
}

// ==========================================================================
// Readings
// ==========================================================================

/// Query parameters for `/user_data`.
#[derive(Debug, Default, Deserialize)]
pub struct UserDataQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    /// Only readings at or after this time; bypasses the cache.
    pub since: Option<String>,
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub success: bool,
    pub user_id: String,
    pub count: usize,
    /// Whether the data came from the readings cache.
    pub cached: bool,
    pub data: Vec<Reading>,
}

fn effective_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// Readings across the caller's devices, newest first.
///
/// A plain request is served from the cache when possible; on a miss the
/// cache is populated (best-effort) and the page is read from the store.
/// Filtered or paged requests always go to the store.
async fn get_user_data(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<UserDataQuery>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let limit = effective_limit(params.limit);
    let since = params
        .since
        .as_deref()
        .map(|s| parse_timestamp("since", s))
        .transpose()?;
    let offset = params.offset.unwrap_or(0);
    let full_fetch = since.is_none() && params.device_id.is_none() && offset == 0;

    if full_fetch && let Some(view) = state.cache.get(user.id()) {
        let data = view.flatten_recent(limit as usize);
        return Ok(Json(ReadingsResponse {
            success: true,
            user_id: user.id().to_string(),
            count: data.len(),
            cached: true,
            data,
        }));
    }

    let store = state.store.lock().await;
    if full_fetch {
        match state.loader.populate(&state.cache, &*store, user.id()) {
            Ok((view, failures)) => debug!(
                "Cached {} devices for {} ({} failed)",
                view.devices.len(),
                user.id(),
                failures.len()
            ),
            Err(e) => warn!("Failed to populate cache for {}: {}", user.id(), e),
        }
    }

    let mut query = ReadingQuery::new(user.id()).limit(limit);
    if let Some(since) = since {
        query = query.since(since);
    }
    if let Some(device_id) = &params.device_id {
        query = query.device(device_id);
    }
    if offset > 0 {
        query = query.offset(offset);
    }
    let data = store.query_readings(&query)?;

    Ok(Json(ReadingsResponse {
        success: true,
        user_id: user.id().to_string(),
        count: data.len(),
        cached: false,
        data,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoricalQuery {
    pub hours: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct HistoricalResponse {
    pub success: bool,
    pub user_id: String,
    pub hours: u32,
    pub count: usize,
    pub data: Vec<Reading>,
}

/// The first reading of each device in every hour of the window, oldest first.
async fn get_historical_data(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<HistoricalQuery>,
) -> Result<Json<HistoricalResponse>, AppError> {
    let hours = params
        .hours
        .unwrap_or(DEFAULT_HISTORY_HOURS)
        .clamp(1, MAX_HISTORY_HOURS);
    let since = state.cache.now() - Duration::hours(i64::from(hours));

    let data = state.store.lock().await.sparse_history(user.id(), since)?;
    Ok(Json(HistoricalResponse {
        success: true,
        user_id: user.id().to_string(),
        hours,
        count: data.len(),
        data,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeviceDataQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct DeviceReadingsResponse {
    pub success: bool,
    pub device_id: String,
    pub count: usize,
    pub data: Vec<Reading>,
}

async fn get_device_data(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(device_id): Path<String>,
    Query(params): Query<DeviceDataQuery>,
) -> Result<Json<DeviceReadingsResponse>, AppError> {
    let limit = effective_limit(params.limit);
    let store = state.store.lock().await;
    if store.get_device_metadata(user.id(), &device_id)?.is_none() {
        return Err(AppError::NotFound(format!("Device not found: {}", device_id)));
    }
    let data = store.get_readings(user.id(), &device_id, limit)?;

    Ok(Json(DeviceReadingsResponse {
        success: true,
        count: data.len(),
        device_id,
        data,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub since: Option<String>,
    pub until: Option<String>,
}

/// CSV export of one device's readings, oldest first.
async fn export_device_data(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(device_id): Path<String>,
    Query(params): Query<ExportQuery>,
) -> Result<impl IntoResponse, AppError> {
    let mut query = ReadingQuery::new(user.id())
        .device(&device_id)
        .oldest_first();
    if let Some(since) = params.since.as_deref() {
        query = query.since(parse_timestamp("since", since)?);
    }
    if let Some(until) = params.until.as_deref() {
        query = query.until(parse_timestamp("until", until)?);
    }

    let csv = {
        let store = state.store.lock().await;
        if store.get_device_metadata(user.id(), &device_id)?.is_none() {
            return Err(AppError::NotFound(format!("Device not found: {}", device_id)));
        }
        store.export_readings_csv(&query)?
    };

    let file_stem: String = device_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}_readings.csv\"", file_stem),
            ),
        ],
        csv,
    ))
}

// ==========================================================================
// Advice
// ==========================================================================

#[derive(Debug, Clone, Serialize)]
pub struct HealthScoreUpdate {
    pub device_id: String,
    pub priority: Priority,
    pub health_score: f64,
}

#[derive(Debug, Serialize)]
pub struct AdviceResponse {
    pub success: bool,
    pub user_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub data_summary: DataSummary,
    pub advice: AdviceResult,
    pub advice_source: AdviceSource,
    pub health_scores_updated: Vec<HealthScoreUpdate>,
}

/// Generate plant care advice from the caller's cached data.
///
/// Returns 409 when the cache holds nothing for the caller. Each device's
/// advice priority is then written back as its health score (best-effort).
async fn get_user_advice(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<AdviceResponse>, AppError> {
    let outcome = state
        .advisor
        .request_advice(&state.cache, &state.store, user.id())
        .await?;

    let mut health_scores_updated = Vec::new();
    for device in &outcome.record.advice.device_advice {
        let score = device.priority.health_score();
        let result = state.store.lock().await.set_health_score(
            user.id(),
            &device.device_id,
            score,
            Some(device.priority),
        );
        match result {
            Ok(_) => {
                let update = DeviceMetadataUpdate {
                    plant_health_score: Some(score),
                    last_advice_priority: Some(device.priority),
                    ..Default::default()
                };
                state
                    .cache
                    .update_device_metadata(user.id(), &device.device_id, &update);
                health_scores_updated.push(HealthScoreUpdate {
                    device_id: device.device_id.clone(),
                    priority: device.priority,
                    health_score: score,
                });
            }
            Err(e) => warn!(
                "Failed to update health score for {}: {}",
                device.device_id, e
            ),
        }
    }

    let record = outcome.record;
    Ok(Json(AdviceResponse {
        success: true,
        user_id: user.id().to_string(),
        timestamp: record.generated_at,
        data_summary: outcome.data_summary,
        advice: record.advice,
        advice_source: record.source,
        health_scores_updated,
    }))
}

// ==========================================================================
// Cache control
// ==========================================================================

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(state.cache.get_stats())
}

/// Drop the caller's cache entry so the next read reloads from the store.
async fn clear_cache(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Json<MessageResponse> {
    state.cache.invalidate(user.id());
    MessageResponse::ok("Cache cleared")
}

// ==========================================================================
// Errors
// ==========================================================================

/// API error type.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    Store(growsense_store::Error),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Store(e) => {
                warn!("Store error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}

impl From<growsense_store::Error> for AppError {
    fn from(e: growsense_store::Error) -> Self {
        match e {
            growsense_store::Error::DeviceNotFound(id) => {
                AppError::NotFound(format!("Device not found: {}", id))
            }
            e @ growsense_store::Error::DeviceOwnedByOtherUser(_) => {
                AppError::Conflict(e.to_string())
            }
            e => AppError::Store(e),
        }
    }
}

impl From<growsense_core::Error> for AppError {
    fn from(e: growsense_core::Error) -> Self {
        match e {
            growsense_core::Error::CacheUnavailableForAdvice { .. } => {
                AppError::Conflict(e.to_string())
            }
            growsense_core::Error::Validation(v) => AppError::BadRequest(v.to_string()),
            e => AppError::Internal(e.to_string()),
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        AppError::BadRequest(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::config::{Config, UserToken};
    use growsense_store::Store;

    fn create_test_state() -> Arc<AppState> {
        let mut config = Config::default();
        config.security.users = vec![
            UserToken {
                token: "token-1".to_string(),
                user_id: "u1".to_string(),
            },
            UserToken {
                token: "token-2".to_string(),
                user_id: "u2".to_string(),
            },
        ];
        AppState::new(Store::open_in_memory().unwrap(), config)
    }

    async fn send_raw(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, String) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let (status, body) = send_raw(app, method, uri, token, body).await;
        let json = serde_json::from_str(&body).unwrap_or(Value::Null);
        (status, json)
    }

    async fn register(app: &Router, token: &str, device_id: &str, key: &str) -> StatusCode {
        let body = json!({"device_id": device_id, "api_key": key, "name": "Basil"});
        send(app, "POST", "/devices/register", Some(token), Some(body))
            .await
            .0
    }

    async fn upload(app: &Router, device_id: &str, key: &str, soil: f64) -> (StatusCode, Value) {
        let body = json!({
            "device_id": device_id,
            "api_key": key,
            "temperature": 21.5,
            "soil_moisture": soil,
        });
        send(app, "POST", "/upload_data", None, Some(body)).await
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(create_test_state());
        let (status, json) = send(&app, "GET", "/health", None, None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "GrowSense API");
        assert!(json["version"].is_string());
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_protected_routes_require_token() {
        let app = router(create_test_state());

        let (status, _) = send(&app, "GET", "/devices", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, json) = send(&app, "GET", "/devices", Some("bogus"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(json["error"].is_string());

        let (status, json) = send(&app, "GET", "/auth/me", Some("token-1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["user"]["uid"], "u1");
    }

    #[tokio::test]
    async fn test_register_and_ownership() {
        let app = router(create_test_state());

        assert_eq!(register(&app, "token-1", "d1", "k1").await, StatusCode::CREATED);
        assert_eq!(register(&app, "token-1", "d1", "k2").await, StatusCode::OK);
        assert_eq!(register(&app, "token-2", "d1", "k3").await, StatusCode::CONFLICT);

        let (status, json) = send(&app, "GET", "/devices", Some("token-1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 1);
        assert_eq!(json["devices"][0]["name"], "Basil");

        let (status, _) = send(&app, "GET", "/devices/d1", Some("token-2"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_data() {
        let app = router(create_test_state());
        register(&app, "token-1", "d1", "k1").await;

        let (status, json) = upload(&app, "d1", "k1", 45.0).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["success"], true);
        assert_eq!(json["device_id"], "d1");
        assert!(json["reading_id"].is_string());
        assert_eq!(json["sleep_duration"], 60);
        assert_eq!(json["sleep_source"], "default");
        assert!(json.get("plant_health_score").is_none());

        let (status, _) = upload(&app, "d1", "wrong", 45.0).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = upload(&app, "unknown", "k1", 45.0).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "POST", "/upload_data", None, Some(json!({"api_key": "k1"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_timestamp_formats() {
        let app = router(create_test_state());
        register(&app, "token-1", "d1", "k1").await;

        for ts in [json!("2024-11-29T10:00:00Z"), json!(1732874400), json!(null)] {
            let body = json!({"device_id": "d1", "api_key": "k1", "timestamp": ts, "light": 1200.0});
            let (status, _) = send(&app, "POST", "/upload_data", None, Some(body)).await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let body = json!({"device_id": "d1", "api_key": "k1", "timestamp": "yesterday"});
        let (status, _) = send(&app, "POST", "/upload_data", None, Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, json) = send(&app, "GET", "/user_data/d1", Some("token-1"), None).await;
        assert_eq!(json["count"], 3);
        assert!(json["data"][0].get("raw_json").is_some());
        assert!(json["data"][0]["raw_json"].get("api_key").is_none());
    }

    #[tokio::test]
    async fn test_user_data_cache_first() {
        let state = create_test_state();
        let app = router(state.clone());
        register(&app, "token-1", "d1", "k1").await;
        upload(&app, "d1", "k1", 45.0).await;

        let (status, json) = send(&app, "GET", "/user_data", Some("token-1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["cached"], false);
        assert_eq!(json["count"], 1);

        let (_, json) = send(&app, "GET", "/user_data", Some("token-1"), None).await;
        assert_eq!(json["cached"], true);
        assert_eq!(json["count"], 1);

        // New uploads land in the cached view
        upload(&app, "d1", "k1", 40.0).await;
        let (_, json) = send(&app, "GET", "/user_data", Some("token-1"), None).await;
        assert_eq!(json["cached"], true);
        assert_eq!(json["count"], 2);
        assert_eq!(json["data"][0]["soil_moisture"], 40.0);

        // Filtered queries always hit the store
        let (_, json) = send(
            &app,
            "GET",
            "/user_data?since=2000-01-01T00:00:00Z&limit=1",
            Some("token-1"),
            None,
        )
        .await;
        assert_eq!(json["cached"], false);
        assert_eq!(json["count"], 1);

        let (status, _) = send(&app, "GET", "/user_data?since=garbage", Some("token-1"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Other users see nothing
        let (_, json) = send(&app, "GET", "/user_data", Some("token-2"), None).await;
        assert_eq!(json["count"], 0);
    }

    #[tokio::test]
    async fn test_cached_and_stored_readings_agree() {
        let app = router(create_test_state());
        register(&app, "token-1", "d1", "k1").await;
        send(&app, "GET", "/user_data", Some("token-1"), None).await;

        let body = json!({
            "device_id": "d1",
            "api_key": "k1",
            "timestamp": 1732874400.123456,
            "light": 900.0,
        });
        send(&app, "POST", "/upload_data", None, Some(body)).await;

        let (_, cached) = send(&app, "GET", "/user_data", Some("token-1"), None).await;
        let (_, stored) = send(&app, "GET", "/user_data/d1", Some("token-1"), None).await;
        assert_eq!(cached["cached"], true);
        assert_eq!(cached["count"], 1);
        assert_eq!(cached["data"][0]["id"], stored["data"][0]["id"]);
        assert_eq!(
            cached["data"][0]["server_timestamp"],
            stored["data"][0]["server_timestamp"]
        );
        assert_eq!(cached["data"][0]["timestamp"], stored["data"][0]["timestamp"]);
    }

    #[tokio::test]
    async fn test_user_advice_requires_cache() {
        let app = router(create_test_state());
        register(&app, "token-1", "d1", "k1").await;
        upload(&app, "d1", "k1", 45.0).await;

        let (status, json) = send(&app, "GET", "/user_advice", Some("token-1"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("refresh data first"));

        send(&app, "GET", "/user_data", Some("token-1"), None).await;

        let (status, json) = send(&app, "GET", "/user_advice", Some("token-1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["advice_source"], "generated");
        assert_eq!(json["data_summary"]["device_count"], 1);
        assert_eq!(json["data_summary"]["readings_analyzed"], 1);
        assert_eq!(json["advice"]["device_advice"][0]["device_id"], "d1");
        assert_eq!(json["health_scores_updated"][0]["health_score"], 8.0);

        let (_, json) = send(&app, "GET", "/devices/d1", Some("token-1"), None).await;
        assert_eq!(json["device"]["plant_health_score"], 8.0);
        assert_eq!(json["device"]["last_advice_priority"], "low");
    }

    #[tokio::test]
    async fn test_adaptive_sleep_after_config() {
        let app = router(create_test_state());
        register(&app, "token-1", "d1", "k1").await;

        let (status, json) = send(
            &app,
            "POST",
            "/devices/d1/health_score",
            Some("token-1"),
            Some(json!({"health_score": 8.0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["calculated_sleep_duration"], 600);

        let (status, json) = send(
            &app,
            "POST",
            "/devices/d1/config",
            Some("token-1"),
            Some(json!({"adaptive_sleep_enabled": true, "target_interval": 900})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["calculated_adaptive_sleep"], 600);
        assert_eq!(json["device"]["target_interval"], 900);

        let (_, json) = upload(&app, "d1", "k1", 45.0).await;
        assert_eq!(json["sleep_duration"], 600);
        assert_eq!(json["sleep_source"], "adaptive");
        assert_eq!(json["plant_health_score"], 8.0);
    }

    #[tokio::test]
    async fn test_device_input_validation() {
        let app = router(create_test_state());
        register(&app, "token-1", "d1", "k1").await;

        let bad_config = [
            json!({"target_interval": 5}),
            json!({"target_interval": 7200}),
            json!({}),
        ];
        for body in bad_config {
            let (status, _) =
                send(&app, "POST", "/devices/d1/config", Some("token-1"), Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }

        let (status, _) = send(
            &app,
            "POST",
            "/devices/d1/health_score",
            Some("token-1"),
            Some(json!({"score": 11.0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let long = "x".repeat(1501);
        let (status, _) = send(
            &app,
            "PUT",
            "/devices/d1/description",
            Some("token-1"),
            Some(json!({"description": long})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/devices/missing/config",
            Some("token-1"),
            Some(json!({"target_interval": 60})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_description_set_and_clear() {
        let app = router(create_test_state());
        register(&app, "token-1", "d1", "k1").await;

        let (status, json) = send(
            &app,
            "PUT",
            "/devices/d1/description",
            Some("token-1"),
            Some(json!({"description": "  South window, repotted in May  "})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["description"], "South window, repotted in May");

        let (_, json) = send(
            &app,
            "PUT",
            "/devices/d1/description",
            Some("token-1"),
            Some(json!({"description": null})),
        )
        .await;
        assert!(json["description"].is_null());

        let (_, json) = send(&app, "GET", "/devices/d1", Some("token-1"), None).await;
        assert!(json["device"].get("description").is_none());
    }

    #[tokio::test]
    async fn test_remove_device() {
        let app = router(create_test_state());
        register(&app, "token-1", "d1", "k1").await;

        let (status, _) = send(&app, "DELETE", "/devices/d1", Some("token-2"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "DELETE", "/devices/d1", Some("token-1"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, "GET", "/devices/d1", Some("token-1"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_export_and_history() {
        let app = router(create_test_state());
        register(&app, "token-1", "d1", "k1").await;
        upload(&app, "d1", "k1", 45.0).await;
        upload(&app, "d1", "k1", 44.0).await;

        let (status, csv) =
            send_raw(&app, "GET", "/user_data/d1/export", Some("token-1"), None).await;
        assert_eq!(status, StatusCode::OK);
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("server_timestamp"));
        assert_eq!(lines.count(), 2);

        let (status, _) =
            send_raw(&app, "GET", "/user_data/d1/export", Some("token-2"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Both uploads fall in the same hour
        let (status, json) = send(
            &app,
            "GET",
            "/user_data/historical?hours=9999",
            Some("token-1"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["hours"], 336);
        assert_eq!(json["count"], 1);
    }

    #[tokio::test]
    async fn test_cache_stats_and_clear() {
        let app = router(create_test_state());
        register(&app, "token-1", "d1", "k1").await;
        upload(&app, "d1", "k1", 45.0).await;
        send(&app, "GET", "/user_data", Some("token-1"), None).await;

        let (status, json) = send(&app, "GET", "/cache/stats", Some("token-1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["cached_users"], 1);
        assert_eq!(json["ttl_seconds"], 86_400);

        let (status, _) = send(&app, "DELETE", "/cache", Some("token-1"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, json) = send(&app, "GET", "/cache/stats", Some("token-1"), None).await;
        assert_eq!(json["cached_users"], 0);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let rfc = parse_timestamp("since", "2024-11-29T10:00:00Z").unwrap();
        let epoch = parse_timestamp("since", "1732874400").unwrap();
        assert_eq!(rfc, epoch);
        assert!(parse_timestamp("since", "tomorrow").is_err());
        assert!(parse_device_timestamp(&json!(true)).is_err());
        assert_eq!(parse_device_timestamp(&json!("")).unwrap(), None);
    }

    #[test]
    fn test_truncate_to_millis() {
        let at = OffsetDateTime::from_unix_timestamp_nanos(1_732_874_400_123_456_789).unwrap();
        assert_eq!(
            truncate_to_millis(at).unix_timestamp_nanos(),
            1_732_874_400_123_000_000
        );
        let whole = truncate_to_millis(at);
        assert_eq!(truncate_to_millis(whole), whole);
    }

    #[test]
    fn test_effective_limit() {
        assert_eq!(effective_limit(None), 100);
        assert_eq!(effective_limit(Some(5000)), 1000);
        assert_eq!(effective_limit(Some(0)), 1);
    }

    #[test]
    fn test_app_error_mapping() {
        let err: AppError = growsense_store::Error::DeviceNotFound("d1".into()).into();
        assert!(matches!(err, AppError::NotFound(_)));

        let err: AppError = growsense_core::Error::CacheUnavailableForAdvice {
            user_id: "u1".into(),
        }
        .into();
        assert!(matches!(err, AppError::Conflict(_)));

        let err: AppError = ValidationError::MissingField("device_id").into();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
