//! Input validation errors shared by the store, core, and service crates.

use thiserror::Error;

/// Rejected user or device input.
///
/// Raised synchronously, before any cache or store access.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// Device description exceeds the character limit.
    #[error("description must be at most {max} characters (got {actual})")]
    DescriptionTooLong { actual: usize, max: usize },

    /// Manual sleep interval outside the accepted range.
    #[error("target_interval must be between {min} and {max} seconds (got {value})")]
    TargetIntervalOutOfRange { value: i64, min: u32, max: u32 },

    /// Health score outside 0-10 or not a finite number.
    #[error("health_score must be between 0 and 10 (got {0})")]
    HealthScoreOutOfRange(f64),

    /// A required field was missing or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Result type alias for validation.
pub type ValidationResult<T> = std::result::Result<T, ValidationError>;
