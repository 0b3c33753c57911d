//! Structured plant-care advice.

use core::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Urgency of a piece of device advice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Parse a priority label, ignoring case and surrounding whitespace.
    ///
    /// ```
    /// use growsense_types::Priority;
    ///
    /// assert_eq!(Priority::parse(" HIGH "), Some(Priority::High));
    /// assert_eq!(Priority::parse("critical"), None);
    /// ```
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }

    /// Plant health score implied by this priority.
    #[must_use]
    pub fn health_score(self) -> f64 {
        match self {
            Priority::Urgent => 2.0,
            Priority::High => 4.0,
            Priority::Medium => 6.0,
            Priority::Low => 8.0,
        }
    }

    /// Health score for an optional priority; unknown maps to 7.
    #[must_use]
    pub fn health_score_or_default(priority: Option<Self>) -> f64 {
        priority.map_or(7.0, Self::health_score)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an [`AdviceRecord`] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceSource {
    /// Parsed from a generator response.
    Generated,
    /// Generator answered but the response could not be parsed.
    DefaultMalformed,
    /// Generator kept reporting quota exhaustion.
    DefaultExhausted,
    /// Generator failed with a non-retryable error.
    DefaultFailed,
}

impl AdviceSource {
    /// Whether the advice is the deterministic fallback.
    #[must_use]
    pub fn is_default(self) -> bool {
        !matches!(self, AdviceSource::Generated)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AdviceSource::Generated => "generated",
            AdviceSource::DefaultMalformed => "default_malformed",
            AdviceSource::DefaultExhausted => "default_exhausted",
            AdviceSource::DefaultFailed => "default_failed",
        }
    }

    /// Inverse of [`AdviceSource::as_str`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generated" => Some(AdviceSource::Generated),
            "default_malformed" => Some(AdviceSource::DefaultMalformed),
            "default_exhausted" => Some(AdviceSource::DefaultExhausted),
            "default_failed" => Some(AdviceSource::DefaultFailed),
            _ => None,
        }
    }
}

/// Advice for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAdvice {
    pub device_id: String,
    pub device_name: String,
    pub advice: String,
    pub priority: Priority,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// Advice covering all of a user's devices.
///
/// After validation `device_advice` holds exactly one entry per device in
/// the payload, in payload order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviceResult {
    pub overall_advice: String,
    pub device_advice: Vec<DeviceAdvice>,
    #[serde(default)]
    pub insights: Vec<String>,
}

impl AdviceResult {
    /// Find advice for a device.
    #[must_use]
    pub fn for_device(&self, device_id: &str) -> Option<&DeviceAdvice> {
        self.device_advice.iter().find(|d| d.device_id == device_id)
    }
}

/// A persisted advice result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviceRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub source: AdviceSource,
    pub advice: AdviceResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_health_scores() {
        assert_eq!(Priority::Urgent.health_score(), 2.0);
        assert_eq!(Priority::High.health_score(), 4.0);
        assert_eq!(Priority::Medium.health_score(), 6.0);
        assert_eq!(Priority::Low.health_score(), 8.0);
        assert_eq!(Priority::health_score_or_default(None), 7.0);
    }

    #[test]
    fn test_priority_parse_is_case_insensitive() {
        assert_eq!(Priority::parse("Urgent"), Some(Priority::Urgent));
        assert_eq!(Priority::parse("medium"), Some(Priority::Medium));
        assert_eq!(Priority::parse(""), None);
    }

    #[test]
    fn test_source_labels_roundtrip() {
        for source in [
            AdviceSource::Generated,
            AdviceSource::DefaultMalformed,
            AdviceSource::DefaultExhausted,
            AdviceSource::DefaultFailed,
        ] {
            assert_eq!(AdviceSource::parse(source.as_str()), Some(source));
            let json = serde_json::to_value(source).unwrap();
            assert_eq!(json, source.as_str());
        }
        assert!(!AdviceSource::Generated.is_default());
        assert!(AdviceSource::DefaultExhausted.is_default());
    }

    #[test]
    fn test_result_missing_lists_default_to_empty() {
        let json = r#"{
            "overall_advice": "ok",
            "device_advice": [
                {"device_id": "d1", "device_name": "A", "advice": "fine", "priority": "low"}
            ]
        }"#;
        let result: AdviceResult = serde_json::from_str(json).unwrap();
        assert!(result.insights.is_empty());
        assert!(result.for_device("d1").unwrap().recommendations.is_empty());
        assert!(result.for_device("d2").is_none());
    }
}
