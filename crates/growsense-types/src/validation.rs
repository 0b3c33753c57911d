//! Bounds checks for user-editable device settings.

use crate::error::{ValidationError, ValidationResult};

/// Maximum length of a device description, in characters.
pub const MAX_DESCRIPTION_LEN: usize = 1500;
/// Minimum manual sleep interval in seconds.
pub const MIN_TARGET_INTERVAL: u32 = 15;
/// Maximum manual sleep interval in seconds (1 hour).
pub const MAX_TARGET_INTERVAL: u32 = 3600;
/// Upper bound of the plant health score scale.
pub const MAX_HEALTH_SCORE: f64 = 10.0;

/// Check a device description against [`MAX_DESCRIPTION_LEN`].
///
/// Length is counted in characters, not bytes.
///
/// ```
/// use growsense_types::validation::validate_description;
///
/// assert!(validate_description("Basil, south window").is_ok());
/// assert!(validate_description(&"x".repeat(1501)).is_err());
/// ```
pub fn validate_description(description: &str) -> ValidationResult<()> {
    let actual = description.chars().count();
    if actual > MAX_DESCRIPTION_LEN {
        return Err(ValidationError::DescriptionTooLong {
            actual,
            max: MAX_DESCRIPTION_LEN,
        });
    }
    Ok(())
}

/// Check a manual sleep interval and narrow it to `u32`.
pub fn validate_target_interval(value: i64) -> ValidationResult<u32> {
    if value < i64::from(MIN_TARGET_INTERVAL) || value > i64::from(MAX_TARGET_INTERVAL) {
        return Err(ValidationError::TargetIntervalOutOfRange {
            value,
            min: MIN_TARGET_INTERVAL,
            max: MAX_TARGET_INTERVAL,
        });
    }
    Ok(value as u32)
}

/// Check a plant health score (0-10 inclusive).
pub fn validate_health_score(score: f64) -> ValidationResult<f64> {
    if !score.is_finite() || !(0.0..=MAX_HEALTH_SCORE).contains(&score) {
        return Err(ValidationError::HealthScoreOutOfRange(score));
    }
    Ok(score)
}
