//! Static catalog of feature definitions.
//!
//! A feature is a pluggable effect (audio cue, overlay, ...) described only by
//! its schema here: the settings it accepts and whether one of them can be
//! ramped. The registry is filled once at start-up and read-only afterwards.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, SessionError, SettingValue};

/// Declared type of a single feature setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SettingKind {
    Slider { min: i64, max: i64 },
    Toggle,
    Dropdown { options: Vec<String> },
    FilePicker,
}

impl SettingKind {
    /// Returns `true` if `value` can be used for this kind without coercion.
    pub fn accepts(&self, value: &SettingValue) -> bool {
        match (self, value) {
            (Self::Slider { .. }, SettingValue::Integer(_)) => true,
            (Self::Toggle, SettingValue::Bool(_)) => true,
            (Self::Dropdown { options }, SettingValue::Text(text)) => options.contains(text),
            (Self::FilePicker, SettingValue::Text(_)) => true,
            _ => false,
        }
    }

    /// Value used when neither the event nor the declaration provides one.
    pub fn fallback_value(&self) -> SettingValue {
        match self {
            Self::Slider { min, .. } => SettingValue::Integer(*min),
            Self::Toggle => SettingValue::Bool(false),
            Self::Dropdown { options } => {
                SettingValue::Text(options.first().cloned().unwrap_or_default())
            }
            Self::FilePicker => SettingValue::Text(String::new()),
        }
    }

    pub fn range(&self) -> Option<(i64, i64)> {
        match self {
            Self::Slider { min, max } => Some((*min, *max)),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Slider { .. } => "slider",
            Self::Toggle => "toggle",
            Self::Dropdown { .. } => "dropdown",
            Self::FilePicker => "file picker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSettingDefinition {
    pub key: String,
    #[serde(flatten)]
    pub kind: SettingKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<SettingValue>,
    /// Marks the one setting eligible for start/end ramping.
    #[serde(default)]
    pub supports_ramp: bool,
}

impl FeatureSettingDefinition {
    pub fn new(key: impl Into<String>, kind: SettingKind) -> Self {
        Self {
            key: key.into(),
            kind,
            default: None,
            supports_ramp: false,
        }
    }

    pub fn slider(key: impl Into<String>, min: i64, max: i64) -> Self {
        Self::new(key, SettingKind::Slider { min, max })
    }

    pub fn toggle(key: impl Into<String>) -> Self {
        Self::new(key, SettingKind::Toggle)
    }

    pub fn dropdown<I, S>(key: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let options = options.into_iter().map(Into::into).collect();
        Self::new(key, SettingKind::Dropdown { options })
    }

    pub fn file_picker(key: impl Into<String>) -> Self {
        Self::new(key, SettingKind::FilePicker)
    }

    pub fn with_default(mut self, value: impl Into<SettingValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn ramped(mut self) -> Self {
        self.supports_ramp = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub supports_ramping: bool,
    #[serde(default)]
    pub settings: Vec<FeatureSettingDefinition>,
}

impl FeatureDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            supports_ramping: false,
            settings: Vec::new(),
        }
    }

    /// Appends a setting declaration. Adding a ramped setting marks the whole
    /// feature as ramp-capable.
    pub fn with_setting(mut self, setting: FeatureSettingDefinition) -> Self {
        self.supports_ramping |= setting.supports_ramp;
        self.settings.push(setting);
        self
    }

    pub fn setting(&self, key: &str) -> Option<&FeatureSettingDefinition> {
        self.settings.iter().find(|setting| setting.key == key)
    }

    /// The setting eligible for start/end ramping, if the feature ramps at all.
    pub fn ramp_setting(&self) -> Option<&FeatureSettingDefinition> {
        if !self.supports_ramping {
            return None;
        }
        self.settings.iter().find(|setting| setting.supports_ramp)
    }

    pub fn ramp_range(&self) -> Option<(i64, i64)> {
        self.ramp_setting().and_then(|setting| setting.kind.range())
    }

    /// Checks the declaration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SessionError::configuration("feature id must not be empty"));
        }

        let mut keys = HashSet::new();
        let mut ramp_settings = 0;
        for setting in &self.settings {
            let context = format!("setting `{}` of feature `{}`", setting.key, self.id);
            if !keys.insert(setting.key.as_str()) {
                return Err(SessionError::configuration(format!("{context} is declared twice")));
            }

            match &setting.kind {
                SettingKind::Slider { min, max } if min > max => {
                    return Err(SessionError::configuration(format!(
                        "{context} has min {min} greater than max {max}"
                    )));
                }
                SettingKind::Dropdown { options } if options.is_empty() => {
                    return Err(SessionError::configuration(format!(
                        "{context} declares no options"
                    )));
                }
                _ => {}
            }

            if let Some(default) = &setting.default {
                let in_range = match (setting.kind.range(), default) {
                    (Some((min, max)), SettingValue::Integer(value)) => (min..=max).contains(value),
                    _ => true,
                };
                if !setting.kind.accepts(default) || !in_range {
                    return Err(SessionError::configuration(format!(
                        "{context} has a default that is not a valid {}",
                        setting.kind.label()
                    )));
                }
            }

            if setting.supports_ramp {
                ramp_settings += 1;
                if setting.kind.range().is_none() {
                    return Err(SessionError::configuration(format!(
                        "{context} is rampable but not a slider"
                    )));
                }
            }
        }

        match (self.supports_ramping, ramp_settings) {
            (_, n) if n > 1 => Err(SessionError::configuration(format!(
                "feature `{}` declares {n} rampable settings, at most one is allowed",
                self.id
            ))),
            (true, 0) => Err(SessionError::configuration(format!(
                "feature `{}` supports ramping but has no rampable setting",
                self.id
            ))),
            (false, 1) => Err(SessionError::configuration(format!(
                "feature `{}` has a rampable setting but does not support ramping",
                self.id
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    features: Vec<FeatureDefinition>,
}

/// Registry for every feature a timeline may reference.
#[derive(Debug, Default, Clone)]
pub struct FeatureRegistry {
    features: HashMap<String, FeatureDefinition>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self {
            features: HashMap::new(),
        }
    }

    /// Catalog of the stock feature back-ends.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for feature in builtin_features() {
            // The stock catalog is known to be consistent.
            registry.features.insert(feature.id.clone(), feature);
        }
        registry
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let document: RegistryDocument = serde_json::from_str(json)?;
        let mut registry = Self::new();
        for feature in document.features {
            registry.register(feature)?;
        }
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        let document = RegistryDocument {
            features: self.iter().cloned().collect(),
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    pub fn register(&mut self, feature: FeatureDefinition) -> Result<()> {
        feature.validate()?;
        if self.features.contains_key(&feature.id) {
            return Err(SessionError::configuration(format!(
                "feature `{}` is registered twice",
                feature.id
            )));
        }
        self.features.insert(feature.id.clone(), feature);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&FeatureDefinition> {
        self.features.get(id)
    }

    /// Like [`FeatureRegistry::get`] but reports unknown ids as configuration errors.
    pub fn require(&self, id: &str) -> Result<&FeatureDefinition> {
        self.get(id).ok_or_else(|| {
            SessionError::configuration(format!("unknown feature `{id}` referenced by timeline"))
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.features.contains_key(id)
    }

    /// Iterates definitions ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = &FeatureDefinition> {
        let mut features: Vec<_> = self.features.values().collect();
        features.sort_by(|a, b| a.id.cmp(&b.id));
        features.into_iter()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

fn builtin_features() -> Vec<FeatureDefinition> {
    vec![
        FeatureDefinition::new("audio", "Audio Cue")
            .with_setting(FeatureSettingDefinition::file_picker("file"))
            .with_setting(
                FeatureSettingDefinition::slider("volume", 0, 100)
                    .with_default(80)
                    .ramped(),
            )
            .with_setting(FeatureSettingDefinition::toggle("loop").with_default(false)),
        FeatureDefinition::new("video", "Video Clip")
            .with_setting(FeatureSettingDefinition::file_picker("file"))
            .with_setting(
                FeatureSettingDefinition::slider("opacity", 0, 100)
                    .with_default(100)
                    .ramped(),
            )
            .with_setting(FeatureSettingDefinition::dropdown(
                "fit",
                ["contain", "cover", "stretch"],
            )),
        FeatureDefinition::new("flash", "Screen Flash")
            .with_setting(
                FeatureSettingDefinition::slider("frequency", 1, 30)
                    .with_default(5)
                    .ramped(),
            )
            .with_setting(FeatureSettingDefinition::dropdown(
                "color",
                ["white", "red", "green", "blue"],
            )),
        FeatureDefinition::new("overlay", "Overlay")
            .with_setting(FeatureSettingDefinition::file_picker("image"))
            .with_setting(
                FeatureSettingDefinition::slider("opacity", 0, 100)
                    .with_default(50)
                    .ramped(),
            )
            .with_setting(FeatureSettingDefinition::toggle("click_through").with_default(true)),
    ]
}
