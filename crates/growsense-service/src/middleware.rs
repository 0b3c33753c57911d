//! Authentication for the GrowSense API.
//!
//! User routes carry `Authorization: Bearer <token>`, resolved against the
//! static token table in `[security]`. Sensor uploads authenticate with the
//! per-device API key issued at registration.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::api::AppError;
use crate::state::AppState;

/// The authenticated user, inserted into request extensions by [`require_user`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

impl AuthUser {
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// Extract the token from an `Authorization: Bearer` header.
///
/// The scheme is matched case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Bearer-token authentication middleware.
///
/// Returns 401 Unauthorized if the header is missing, uses another scheme,
/// or carries an unknown token.
pub async fn require_user(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(request.headers()) else {
        debug!("Missing bearer token for {}", request.uri().path());
        return unauthorized("Missing or malformed Authorization header");
    };

    match state.user_for_token(token) {
        Some(user_id) => {
            let user = AuthUser(user_id.to_string());
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => {
            warn!("Bearer authentication failed for {}", request.uri().path());
            unauthorized("Invalid token")
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": message,
            "hint": "Provide a valid token in the Authorization header as 'Bearer <token>'"
        })),
    )
        .into_response()
}

/// Check a device's upload key and return the owning user id.
///
/// Verified credentials are cached for `security.device_key_cache_secs`.
/// An unregistered device is a bad request; a wrong key is unauthorized.
pub async fn verify_device_key(
    state: &AppState,
    device_id: &str,
    api_key: &str,
) -> Result<String, AppError> {
    let creds = match state.device_keys.get(device_id).await {
        Some(creds) => creds,
        None => {
            let creds = {
                let store = state.store.lock().await;
                store.device_credentials(device_id)?
            };
            let creds = creds.ok_or_else(|| {
                AppError::BadRequest(format!("Device {} is not registered", device_id))
            })?;
            if keys_match(&creds.api_key, api_key) {
                state.device_keys.insert(device_id, creds.clone()).await;
            }
            creds
        }
    };

    if keys_match(&creds.api_key, api_key) {
        Ok(creds.user_id)
    } else {
        warn!("Invalid API key for device {}", device_id);
        Err(AppError::Unauthorized("Invalid device API key".to_string()))
    }
}

fn keys_match(expected: &str, provided: &str) -> bool {
    bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
}
