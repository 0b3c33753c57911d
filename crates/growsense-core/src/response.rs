//! Lenient parsing and validation of generator output, plus default advice.
//!
//! Generators are not trusted: their output may be wrapped in markdown,
//! miss fields, or reference devices that do not exist. Everything that
//! leaves this module is an [`AdviceResult`] with exactly one entry per
//! known device, in payload order.

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use growsense_types::{AdviceResult, DeviceAdvice, Priority, SensorField};

use crate::advice::{AdvicePayload, DevicePayload};

/// Soil moisture (%) below which a plant is flagged for watering.
pub const DRY_SOIL_THRESHOLD: f64 = 30.0;

const NO_DEVICES_ADVICE: &str =
    "No devices found. Please register a device to receive plant care advice.";

/// Locate the JSON object inside generator output.
///
/// Markdown code fences are stripped, then the text between the first `{`
/// and the last `}` is returned.
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed);

    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    (start < end).then(|| &unfenced[start..=end])
}

/// Parse generator output into a JSON object, or `None` if it is malformed.
pub fn parse_advice_response(text: &str) -> Option<Value> {
    let json = extract_json(text)?;
    match serde_json::from_str::<Value>(json) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => None,
        Err(e) => {
            debug!("Advice response is not valid JSON: {}", e);
            None
        }
    }
}

fn string_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Index of the payload device an advice entry refers to.
///
/// Matches by id first, then by display name ignoring case.
fn resolve_device(entry: &Value, devices: &[DevicePayload]) -> Option<usize> {
    if let Some(id) = string_field(entry, "device_id")
        && let Some(index) = devices.iter().position(|d| d.device_id == id)
    {
        return Some(index);
    }
    let name = string_field(entry, "device_name").or_else(|| string_field(entry, "name"))?;
    devices
        .iter()
        .position(|d| d.name.eq_ignore_ascii_case(name))
}

/// Turn a parsed generator response into a complete [`AdviceResult`].
///
/// Entries for unknown devices are dropped, duplicates keep the first, and
/// known devices without an entry get one synthesized from statistics.
pub fn validate_advice(value: &Value, payload: &AdvicePayload) -> AdviceResult {
    let devices = &payload.devices;
    let mut slots: Vec<Option<DeviceAdvice>> = vec![None; devices.len()];

    let entries = value
        .get("device_advice")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for entry in entries {
        let Some(index) = resolve_device(entry, devices) else {
            debug!("Dropping advice for unknown device: {}", entry);
            continue;
        };
        if slots[index].is_some() {
            continue;
        }

        let device = &devices[index];
        let fallback = default_device_advice(device);
        slots[index] = Some(DeviceAdvice {
            device_id: device.device_id.clone(),
            device_name: device.name.clone(),
            advice: string_field(entry, "advice")
                .map(str::to_string)
                .unwrap_or(fallback.advice),
            priority: string_field(entry, "priority")
                .and_then(Priority::parse)
                .unwrap_or(fallback.priority),
            recommendations: string_list(entry, "recommendations"),
        });
    }

    let device_advice = slots
        .into_iter()
        .zip(devices)
        .map(|(slot, device)| slot.unwrap_or_else(|| default_device_advice(device)))
        .collect::<Vec<_>>();

    AdviceResult {
        overall_advice: string_field(value, "overall_advice")
            .map(str::to_string)
            .unwrap_or_else(|| default_overall(&device_advice)),
        insights: string_list(value, "insights"),
        device_advice,
    }
}

/// Deterministic advice for one device, derived from its statistics.
pub fn default_device_advice(device: &DevicePayload) -> DeviceAdvice {
    let mut recommendations = Vec::new();
    let (advice, priority) = if device.summary.reading_count == 0 {
        recommendations.push("Check that the sensor is powered and connected".to_string());
        (
            format!("No recent readings from {}.", device.name),
            Priority::Low,
        )
    } else {
        match device.summary.field(SensorField::SoilMoisture) {
            Some(soil) if soil.avg < DRY_SOIL_THRESHOLD => {
                recommendations.push("Water the plant soon".to_string());
                recommendations.push(format!(
                    "Keep soil moisture above {DRY_SOIL_THRESHOLD:.0}%"
                ));
                (
                    format!(
                        "Soil moisture for {} is low (average {:.1}%).",
                        device.name, soil.avg
                    ),
                    Priority::Medium,
                )
            }
            _ => {
                recommendations.push("Continue monitoring sensor readings".to_string());
                recommendations.push(format!(
                    "Check soil moisture if readings drop below {DRY_SOIL_THRESHOLD:.0}%"
                ));
                (
                    format!(
                        "{} is functioning normally. Conditions are within acceptable ranges.",
                        device.name
                    ),
                    Priority::Low,
                )
            }
        }
    };

    DeviceAdvice {
        device_id: device.device_id.clone(),
        device_name: device.name.clone(),
        advice,
        priority,
        recommendations,
    }
}

fn default_overall(device_advice: &[DeviceAdvice]) -> String {
    if device_advice.is_empty() {
        return NO_DEVICES_ADVICE.to_string();
    }
    let needs_attention: Vec<&str> = device_advice
        .iter()
        .filter(|d| d.priority > Priority::Low)
        .map(|d| d.device_name.as_str())
        .collect();
    if needs_attention.is_empty() {
        "Your plants are generally healthy. Keep monitoring soil moisture.".to_string()
    } else {
        format!("Some plants need attention: {}.", needs_attention.join(", "))
    }
}

/// Deterministic advice used when the generator cannot be used.
pub fn default_advice(payload: &AdvicePayload) -> AdviceResult {
    let device_advice: Vec<DeviceAdvice> =
        payload.devices.iter().map(default_device_advice).collect();

    let mut insights = Vec::new();
    if !payload.devices.is_empty() {
        insights.push(format!(
            "Analyzed {} readings across {} devices",
            payload.overall_summary.total_readings, payload.device_count
        ));
        let silent: HashSet<&str> = payload
            .devices
            .iter()
            .filter(|d| d.summary.reading_count == 0)
            .map(|d| d.name.as_str())
            .collect();
        if !silent.is_empty() {
            let mut names: Vec<_> = silent.into_iter().collect();
            names.sort_unstable();
            insights.push(format!("No recent data from: {}", names.join(", ")));
        }
    }

    AdviceResult {
        overall_advice: default_overall(&device_advice),
        device_advice,
        insights,
    }
}
