//! Type-aware lookup of per-event setting values with default fallback.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{FeatureDefinition, FeatureSettingDefinition, SessionError, SettingKind, TimelineEvent};

/// Setting values keyed by setting key.
pub type SettingsMap = BTreeMap<String, SettingValue>;

/// A stored or resolved setting value.
///
/// Stored values come straight from persisted timelines and may not match the
/// declared [`SettingKind`]; resolved values always do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl SettingValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "\"{value}\""),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Outcome of resolving one event against its feature declaration.
#[derive(Debug, Default)]
pub struct Resolution {
    /// One value per declared setting, each matching its declared kind.
    pub settings: SettingsMap,
    /// Non-fatal [`SessionError::ValueCoercion`] issues met along the way.
    pub coercions: Vec<SessionError>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SettingsResolver;

impl SettingsResolver {
    pub fn new() -> Self {
        Self
    }

    /// Produces a concrete value for every setting `feature` declares.
    ///
    /// Stored values that match their declaration are used as-is, mismatches
    /// are coerced where possible and everything else falls back to the
    /// declared default (or the kind's own fallback).
    pub fn resolve(&self, event: &TimelineEvent, feature: &FeatureDefinition) -> Resolution {
        let mut resolution = Resolution::default();
        for declaration in &feature.settings {
            let stored = event.settings.get(&declaration.key);
            let value =
                resolve_setting(&feature.id, declaration, stored, &mut resolution.coercions);
            resolution.settings.insert(declaration.key.clone(), value);
        }
        resolution
    }
}

fn resolve_setting(
    feature_id: &str,
    declaration: &FeatureSettingDefinition,
    stored: Option<&SettingValue>,
    issues: &mut Vec<SessionError>,
) -> SettingValue {
    let Some(stored) = stored else {
        return default_value(declaration);
    };

    let kind = &declaration.kind;
    if kind.accepts(stored) {
        let clamped = clamp_to_range(kind, stored.clone());
        if &clamped != stored {
            issues.push(SessionError::coercion(
                feature_id,
                &declaration.key,
                format!("{stored} is out of range, clamped to {clamped}"),
            ));
        }
        return clamped;
    }

    match coerce(kind, stored) {
        Some(value) => {
            issues.push(SessionError::coercion(
                feature_id,
                &declaration.key,
                format!("coerced {stored} to {} value {value}", kind.label()),
            ));
            value
        }
        None => {
            let fallback = default_value(declaration);
            issues.push(SessionError::coercion(
                feature_id,
                &declaration.key,
                format!(
                    "{stored} is not a valid {} value, using {fallback}",
                    kind.label()
                ),
            ));
            fallback
        }
    }
}

fn default_value(declaration: &FeatureSettingDefinition) -> SettingValue {
    declaration
        .default
        .as_ref()
        .filter(|value| declaration.kind.accepts(value))
        .map(|value| clamp_to_range(&declaration.kind, value.clone()))
        .unwrap_or_else(|| declaration.kind.fallback_value())
}

fn clamp_to_range(kind: &SettingKind, value: SettingValue) -> SettingValue {
    match (kind.range(), value) {
        (Some((min, max)), SettingValue::Integer(v)) => SettingValue::Integer(v.clamp(min, max)),
        (_, value) => value,
    }
}

/// Best-effort conversion of a mismatched stored value.
fn coerce(kind: &SettingKind, value: &SettingValue) -> Option<SettingValue> {
    let coerced = match kind {
        SettingKind::Slider { .. } => match value {
            SettingValue::Integer(v) => Some(*v),
            SettingValue::Float(v) if v.is_finite() => Some(v.round() as i64),
            SettingValue::Bool(v) => Some(i64::from(*v)),
            SettingValue::Text(text) => parse_number(text),
            _ => None,
        }
        .map(SettingValue::Integer),
        SettingKind::Toggle => match value {
            SettingValue::Integer(0) => Some(false),
            SettingValue::Integer(1) => Some(true),
            SettingValue::Text(text) => parse_flag(text),
            _ => None,
        }
        .map(SettingValue::Bool),
        SettingKind::Dropdown { options } => {
            let wanted = match value {
                SettingValue::Text(text) => text.trim().to_string(),
                other => other.to_string(),
            };
            options
                .iter()
                .find(|option| option.eq_ignore_ascii_case(&wanted))
                .cloned()
                .map(SettingValue::Text)
        }
        SettingKind::FilePicker => None,
    };
    coerced.map(|value| clamp_to_range(kind, value))
}

fn parse_number(text: &str) -> Option<i64> {
    let text = text.trim();
    text.parse::<i64>().ok().or_else(|| {
        text.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(|v| v.round() as i64)
    })
}

fn parse_flag(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventType, FeatureSettingDefinition};

    fn feature() -> FeatureDefinition {
        FeatureDefinition::new("lamp", "Lamp")
            .with_setting(
                FeatureSettingDefinition::slider("brightness", 10, 100)
                    .with_default(40)
                    .ramped(),
            )
            .with_setting(FeatureSettingDefinition::slider("warmth", 0, 5))
            .with_setting(FeatureSettingDefinition::toggle("blink"))
            .with_setting(FeatureSettingDefinition::dropdown("mode", ["steady", "pulse"]))
            .with_setting(FeatureSettingDefinition::file_picker("gobo"))
    }

    fn start_with(settings: &[(&str, SettingValue)]) -> TimelineEvent {
        let mut event = TimelineEvent::new(1, "lamp", EventType::Start, 0);
        for (key, value) in settings {
            event.settings.insert(key.to_string(), value.clone());
        }
        event
    }

    #[test]
    fn falls_back_to_declared_defaults() {
        let resolution = SettingsResolver::new().resolve(&start_with(&[]), &feature());

        assert!(resolution.coercions.is_empty());
        let settings = resolution.settings;
        assert_eq!(settings["brightness"], SettingValue::Integer(40));
        assert_eq!(settings["warmth"], SettingValue::Integer(0));
        assert_eq!(settings["blink"], SettingValue::Bool(false));
        assert_eq!(settings["mode"], SettingValue::Text("steady".into()));
        assert_eq!(settings["gobo"], SettingValue::Text(String::new()));
    }

    #[test]
    fn keeps_matching_stored_values() {
        let event = start_with(&[
            ("brightness", 75.into()),
            ("blink", true.into()),
            ("mode", "pulse".into()),
            ("gobo", "stars.png".into()),
        ]);
        let resolution = SettingsResolver::new().resolve(&event, &feature());

        assert!(resolution.coercions.is_empty());
        assert_eq!(resolution.settings["brightness"], SettingValue::Integer(75));
        assert_eq!(resolution.settings["blink"], SettingValue::Bool(true));
        assert_eq!(resolution.settings["mode"], SettingValue::Text("pulse".into()));
        assert_eq!(resolution.settings["gobo"], SettingValue::Text("stars.png".into()));
    }

    #[test]
    fn coerces_mismatched_values() {
        let event = start_with(&[
            ("brightness", " 55 ".into()),
            ("warmth", 2.6.into()),
            ("blink", "on".into()),
            ("mode", "PULSE".into()),
        ]);
        let resolution = SettingsResolver::new().resolve(&event, &feature());

        assert_eq!(resolution.settings["brightness"], SettingValue::Integer(55));
        assert_eq!(resolution.settings["warmth"], SettingValue::Integer(3));
        assert_eq!(resolution.settings["blink"], SettingValue::Bool(true));
        assert_eq!(resolution.settings["mode"], SettingValue::Text("pulse".into()));
        assert_eq!(resolution.coercions.len(), 4);
        assert!(resolution
            .coercions
            .iter()
            .all(|issue| matches!(issue, SessionError::ValueCoercion { .. })));
    }

    #[test]
    fn uncoercible_values_use_default_path() {
        let event = start_with(&[
            ("brightness", "bright".into()),
            ("blink", 7.into()),
            ("mode", "strobe".into()),
            ("gobo", 12.into()),
        ]);
        let resolution = SettingsResolver::new().resolve(&event, &feature());

        assert_eq!(resolution.settings["brightness"], SettingValue::Integer(40));
        assert_eq!(resolution.settings["blink"], SettingValue::Bool(false));
        assert_eq!(resolution.settings["mode"], SettingValue::Text("steady".into()));
        assert_eq!(resolution.settings["gobo"], SettingValue::Text(String::new()));
        assert_eq!(resolution.coercions.len(), 4);

        let message = resolution.coercions[0].to_string();
        assert!(message.contains("brightness"), "{message}");
        assert!(message.contains("lamp"), "{message}");
    }

    #[test]
    fn clamps_out_of_range_numbers() {
        let event = start_with(&[("brightness", 400.into()), ("warmth", "-3".into())]);
        let resolution = SettingsResolver::new().resolve(&event, &feature());

        assert_eq!(resolution.settings["brightness"], SettingValue::Integer(100));
        assert_eq!(resolution.settings["warmth"], SettingValue::Integer(0));
        assert_eq!(resolution.coercions.len(), 2);
    }

    #[test]
    fn ignores_undeclared_keys() {
        let event = start_with(&[("color", "red".into())]);
        let resolution = SettingsResolver::new().resolve(&event, &feature());

        assert!(!resolution.settings.contains_key("color"));
        assert_eq!(resolution.settings.len(), 5);
    }

    #[test]
    fn untagged_values_follow_json_types() {
        let parsed: SettingsMap =
            serde_json::from_str(r#"{"a": true, "b": 3, "c": 2.5, "d": "x"}"#).unwrap();
        assert_eq!(parsed["a"], SettingValue::Bool(true));
        assert_eq!(parsed["b"], SettingValue::Integer(3));
        assert_eq!(parsed["c"], SettingValue::Float(2.5));
        assert_eq!(parsed["d"], SettingValue::Text("x".into()));
    }
}
