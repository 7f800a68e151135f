//! Boundary between the scheduler and the concrete feature back-ends.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{Result, SessionError, SettingsMap};

/// Capability every feature back-end implements.
///
/// Calls must return promptly: the scheduler waits for each one before the
/// next tick, so back-ends with slow work hand it off themselves.
pub trait FeatureSink {
    /// Begin producing the feature's effect with the given static settings.
    fn activate(&mut self, feature_id: &str, settings: &SettingsMap) -> Result<()>;

    /// Apply a new intensity to a ramp-capable, active feature.
    fn update_ramp(&mut self, feature_id: &str, value: i64) -> Result<()>;

    /// Stop producing the effect. Must be safe to call on an inactive feature.
    fn deactivate(&mut self, feature_id: &str) -> Result<()>;
}

impl<S: FeatureSink + ?Sized> FeatureSink for Box<S> {
    fn activate(&mut self, feature_id: &str, settings: &SettingsMap) -> Result<()> {
        (**self).activate(feature_id, settings)
    }

    fn update_ramp(&mut self, feature_id: &str, value: i64) -> Result<()> {
        (**self).update_ramp(feature_id, value)
    }

    fn deactivate(&mut self, feature_id: &str) -> Result<()> {
        (**self).deactivate(feature_id)
    }
}

/// Routes each call to the back-end registered for its feature id.
#[derive(Default)]
pub struct SinkRouter {
    routes: HashMap<String, Box<dyn FeatureSink>>,
    fallback: Option<Box<dyn FeatureSink>>,
}

impl SinkRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, feature_id: impl Into<String>, sink: impl FeatureSink + 'static) -> Self {
        self.routes.insert(feature_id.into(), Box::new(sink));
        self
    }

    /// Back-end receiving calls for features without a dedicated route.
    pub fn with_fallback(mut self, sink: impl FeatureSink + 'static) -> Self {
        self.fallback = Some(Box::new(sink));
        self
    }

    fn target(&mut self, feature_id: &str) -> Result<&mut Box<dyn FeatureSink>> {
        match self.routes.get_mut(feature_id) {
            Some(sink) => Ok(sink),
            None => self
                .fallback
                .as_mut()
                .ok_or_else(|| SessionError::sink(feature_id, "no back-end registered")),
        }
    }
}

impl FeatureSink for SinkRouter {
    fn activate(&mut self, feature_id: &str, settings: &SettingsMap) -> Result<()> {
        self.target(feature_id)?.activate(feature_id, settings)
    }

    fn update_ramp(&mut self, feature_id: &str, value: i64) -> Result<()> {
        self.target(feature_id)?.update_ramp(feature_id, value)
    }

    fn deactivate(&mut self, feature_id: &str) -> Result<()> {
        self.target(feature_id)?.deactivate(feature_id)
    }
}

impl fmt::Debug for SinkRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut routes: Vec<_> = self.routes.keys().collect();
        routes.sort();
        f.debug_struct("SinkRouter")
            .field("routes", &routes)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Back-end that only logs what it is asked to do. Used for dry runs.
#[derive(Debug, Default)]
pub struct TracingSink;

impl FeatureSink for TracingSink {
    fn activate(&mut self, feature_id: &str, settings: &SettingsMap) -> Result<()> {
        let settings = settings
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(feature_id, %settings, "activate");
        Ok(())
    }

    fn update_ramp(&mut self, feature_id: &str, value: i64) -> Result<()> {
        tracing::debug!(feature_id, value, "ramp");
        Ok(())
    }

    fn deactivate(&mut self, feature_id: &str) -> Result<()> {
        tracing::info!(feature_id, "deactivate");
        Ok(())
    }
}

/// A single call received by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Activate {
        feature_id: String,
        settings: SettingsMap,
    },
    UpdateRamp {
        feature_id: String,
        value: i64,
    },
    Deactivate {
        feature_id: String,
    },
}

impl SinkCall {
    pub fn feature_id(&self) -> &str {
        match self {
            Self::Activate { feature_id, .. }
            | Self::UpdateRamp { feature_id, .. }
            | Self::Deactivate { feature_id } => feature_id,
        }
    }
}

#[derive(Debug, Default)]
struct Recording {
    calls: Vec<SinkCall>,
    active: HashSet<String>,
    failing: HashSet<String>,
}

/// Captures every call it receives. Clones share the same recording, so one
/// handle can be given to a scheduler and another kept for inspection.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    shared: Arc<Mutex<Recording>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call for `feature_id` fail, as a back-end with a missing
    /// asset would. Failed calls are still recorded.
    pub fn fail_feature(&self, feature_id: impl Into<String>) {
        self.lock().failing.insert(feature_id.into());
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.lock().calls.clone()
    }

    /// Calls recorded for one feature.
    pub fn calls_for(&self, feature_id: &str) -> Vec<SinkCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.feature_id() == feature_id)
            .cloned()
            .collect()
    }

    pub fn is_active(&self, feature_id: &str) -> bool {
        self.lock().active.contains(feature_id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn clear(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Recording> {
        // A poisoned recording is still worth reading.
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: SinkCall) -> Result<()> {
        let mut recording = self.lock();
        let feature_id = call.feature_id().to_string();
        let failing = recording.failing.contains(&feature_id);
        match &call {
            SinkCall::Activate { .. } if !failing => {
                recording.active.insert(feature_id.clone());
            }
            SinkCall::Deactivate { .. } => {
                recording.active.remove(&feature_id);
            }
            _ => {}
        }
        recording.calls.push(call);

        if failing {
            Err(SessionError::sink(feature_id, "back-end unavailable"))
        } else {
            Ok(())
        }
    }
}

impl FeatureSink for RecordingSink {
    fn activate(&mut self, feature_id: &str, settings: &SettingsMap) -> Result<()> {
        self.record(SinkCall::Activate {
            feature_id: feature_id.to_string(),
            settings: settings.clone(),
        })
    }

    fn update_ramp(&mut self, feature_id: &str, value: i64) -> Result<()> {
        self.record(SinkCall::UpdateRamp {
            feature_id: feature_id.to_string(),
            value,
        })
    }

    fn deactivate(&mut self, feature_id: &str) -> Result<()> {
        self.record(SinkCall::Deactivate {
            feature_id: feature_id.to_string(),
        })
    }
}
