//! Advice generator implementations.
//!
//! [`GeminiGenerator`] calls Google's `generateContent` API; [`BuiltinGenerator`]
//! answers offline from payload statistics. [`build_generator`] picks one from
//! the configuration.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use growsense_core::{AdviceGenerator, AdvicePayload, GeneratorError, default_advice};

use crate::config::{AdviceConfig, AdviceProvider};

/// Marker Google uses for quota and rate-limit failures.
const RESOURCE_EXHAUSTED: &str = "RESOURCE_EXHAUSTED";

/// Client for the Gemini `generateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GeminiGenerator {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            endpoint: endpoint.into(),
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint.trim_end_matches('/'),
            self.model
        )
    }
}

/// Classify a non-success response.
fn classify_failure(status: StatusCode, body: &str) -> GeneratorError {
    let message = format!("API returned {status}: {}", body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || body.contains(RESOURCE_EXHAUSTED) {
        GeneratorError::QuotaExhausted(message)
    } else {
        GeneratorError::Failed(message)
    }
}

fn extract_text(body: &str) -> Result<String, GeneratorError> {
    let response: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| GeneratorError::Failed(format!("failed to parse API response: {e}")))?;
    response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .and_then(|c| c.parts.into_iter().next())
        .and_then(|p| p.text)
        .ok_or_else(|| GeneratorError::Failed("response contained no text".to_string()))
}

#[async_trait]
impl AdviceGenerator for GeminiGenerator {
    async fn generate(&self, payload: &AdvicePayload) -> Result<String, GeneratorError> {
        let request = serde_json::json!({
            "contents": [{ "parts": [{ "text": payload.prompt() }] }]
        });

        let response = self
            .client
            .post(self.url())
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| GeneratorError::Failed(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        debug!(status = %status, model = %self.model, "generateContent response received");

        let body = response
            .text()
            .await
            .map_err(|e| GeneratorError::Failed(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }
        extract_text(&body)
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

/// Offline generator that answers with statistics-based advice.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinGenerator;

#[async_trait]
impl AdviceGenerator for BuiltinGenerator {
    async fn generate(&self, payload: &AdvicePayload) -> Result<String, GeneratorError> {
        serde_json::to_string(&default_advice(payload))
            .map_err(|e| GeneratorError::Failed(e.to_string()))
    }

    fn name(&self) -> &str {
        "builtin"
    }
}

/// Build the configured generator.
///
/// Falls back to [`BuiltinGenerator`] when Gemini is selected without a key
/// or its client cannot be built.
pub fn build_generator(config: &AdviceConfig) -> Box<dyn AdviceGenerator> {
    match (config.provider, config.api_key.as_deref()) {
        (AdviceProvider::Gemini, Some(key)) if !key.trim().is_empty() => {
            match GeminiGenerator::new(
                key,
                config.model.as_str(),
                config.endpoint.as_str(),
                Duration::from_secs(config.timeout_secs),
            ) {
                Ok(generator) => Box::new(generator),
                Err(e) => {
                    warn!("Failed to build Gemini client, using builtin advice: {}", e);
                    Box::new(BuiltinGenerator)
                }
            }
        }
        (AdviceProvider::Gemini, _) => {
            warn!("Gemini selected without an API key, using builtin advice");
            Box::new(BuiltinGenerator)
        }
        (AdviceProvider::Builtin, _) => Box::new(BuiltinGenerator),
    }
}
