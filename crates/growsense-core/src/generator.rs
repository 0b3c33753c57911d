//! The external advice generator seam.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::advice::AdvicePayload;
use crate::retry::Retryable;

/// Failure reported by an [`AdviceGenerator`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeneratorError {
    /// Rate limit or quota hit; worth retrying after a pause.
    #[error("generator quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Any other failure; retrying will not help.
    #[error("generator failed: {0}")]
    Failed(String),
}

impl Retryable for GeneratorError {
    fn is_retryable(&self) -> bool {
        matches!(self, GeneratorError::QuotaExhausted(_))
    }
}

/// Produces raw advice text for a payload.
///
/// The text is expected to contain a JSON advice object, possibly wrapped in
/// markdown fences or prose; the assembler extracts and validates it.
#[async_trait]
pub trait AdviceGenerator: Send + Sync {
    async fn generate(&self, payload: &AdvicePayload) -> Result<String, GeneratorError>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "generator"
    }
}

#[async_trait]
impl<G: AdviceGenerator + ?Sized> AdviceGenerator for Box<G> {
    async fn generate(&self, payload: &AdvicePayload) -> Result<String, GeneratorError> {
        (**self).generate(payload).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[async_trait]
impl<G: AdviceGenerator + ?Sized> AdviceGenerator for Arc<G> {
    async fn generate(&self, payload: &AdvicePayload) -> Result<String, GeneratorError> {
        (**self).generate(payload).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_quota_is_retryable() {
        assert!(GeneratorError::QuotaExhausted("429".into()).is_retryable());
        assert!(!GeneratorError::Failed("500".into()).is_retryable());
    }
}
