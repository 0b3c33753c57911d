//! Error types for growsense-core.
//!
//! | Condition | Representation |
//! |-----------|----------------|
//! | Cache miss | `Option::None` from [`ReadingsCache::get`](crate::ReadingsCache::get) |
//! | Advice requested without cached data | [`Error::CacheUnavailableForAdvice`] |
//! | Backing store failure | [`Error::Source`] |
//! | Rejected input | [`Error::Validation`] |
//!
//! Generator failures never surface here: they are retried or degraded to
//! default advice inside the assembler (see [`GeneratorError`](crate::GeneratorError)).

use thiserror::Error;

use growsense_types::ValidationError;

/// Boxed error from a backing store implementation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the cache, loader, and advice pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Advice needs a populated cache entry; the caller must load data first.
    #[error("no cached data for user {user_id}; please refresh data first")]
    CacheUnavailableForAdvice { user_id: String },

    /// The backing store failed.
    #[error("backing store error: {0}")]
    Source(#[source] BoxError),

    /// Input rejected before any cache or store access.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl Error {
    /// Wrap a backing store error.
    pub fn from_source<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Source(Box::new(err))
    }
}

/// Result type alias using growsense-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_unavailable_message() {
        let err = Error::CacheUnavailableForAdvice {
            user_id: "u1".to_string(),
        };
        assert!(err.to_string().contains("please refresh data first"));
    }

    #[test]
    fn test_source_wraps_store_error() {
        let io = std::io::Error::other("disk gone");
        let err = Error::from_source(io);
        assert!(matches!(err, Error::Source(_)));
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn test_validation_is_transparent() {
        let err: Error = ValidationError::MissingField("device_id").into();
        assert_eq!(err.to_string(), "missing required field: device_id");
    }
}
