use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    /// Feature catalog replacing the built-in one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

/// Configuration specific to playback scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Wall-clock length of one session minute.
    pub minute_millis: u64,
    /// Period of the timer driving `tick`.
    pub tick_interval_millis: u64,
    /// Reject timelines referencing unknown features instead of skipping
    /// those events during playback.
    pub strict_feature_ids: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            minute_millis: 60_000,
            tick_interval_millis: 250,
            strict_feature_ids: false,
        }
    }
}

impl SchedulerConfig {
    pub fn minute_duration(&self) -> Duration {
        Duration::from_millis(self.minute_millis.max(1))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_millis.max(1))
    }
}
