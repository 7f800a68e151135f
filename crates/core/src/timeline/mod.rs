//! Authored timeline data: feature Start/Stop events placed on a minute grid.
//!
//! A [`Timeline`] is the mutable, authored document. Playback never reads it
//! directly; [`Timeline::validate`] checks every invariant and produces an
//! immutable [`TimelineSnapshot`] with Start/Stop occurrences already paired.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{FeatureRegistry, Result, SessionError, SettingsMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub id: u64,
    pub feature_id: String,
    pub event_type: EventType,
    pub minute: u32,
    /// Stored setting values; only Start events carry any.
    #[serde(default, skip_serializing_if = "SettingsMap::is_empty")]
    pub settings: SettingsMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_value: Option<i64>,
}

impl TimelineEvent {
    pub fn new(id: u64, feature_id: impl Into<String>, event_type: EventType, minute: u32) -> Self {
        Self {
            id,
            feature_id: feature_id.into(),
            event_type,
            minute,
            settings: SettingsMap::new(),
            start_value: None,
            end_value: None,
        }
    }

    pub fn is_start(&self) -> bool {
        self.event_type == EventType::Start
    }

    /// Both ramp endpoints, if the event carries a complete ramp.
    pub fn ramp_values(&self) -> Option<(i64, i64)> {
        self.start_value.zip(self.end_value)
    }
}

/// The authored, editable session document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    session_length: u32,
    #[serde(default)]
    events: Vec<TimelineEvent>,
}

impl Timeline {
    pub fn new(session_length: u32) -> Self {
        Self {
            session_length,
            events: Vec::new(),
        }
    }

    pub fn session_length(&self) -> u32 {
        self.session_length
    }

    /// Events in the order they were stored. Authoring methods keep this
    /// ordered by minute with ties in authored order.
    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn event(&self, id: u64) -> Option<&TimelineEvent> {
        self.events.iter().find(|event| event.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// One past the highest id in use, or the lowest free id once the
    /// highest is `u64::MAX`.
    fn next_id(&self) -> u64 {
        let highest = self.events.iter().map(|event| event.id).max();
        match highest {
            None => 1,
            Some(id) => id.checked_add(1).unwrap_or_else(|| {
                let used: HashSet<u64> = self.events.iter().map(|event| event.id).collect();
                (1..=u64::MAX).find(|id| !used.contains(id)).unwrap_or(0)
            }),
        }
    }

    /// Start/Stop pairs as currently authored, without checking them against
    /// a catalog. A Stop with no open Start and a Start of an already open
    /// feature are left out; a Start without a Stop runs to the session end.
    pub fn instances(&self) -> Vec<FeatureInstance> {
        let mut instances: Vec<FeatureInstance> = Vec::new();
        let mut open: HashMap<&str, usize> = HashMap::new();
        let mut ordinals: HashMap<&str, usize> = HashMap::new();

        for (index, event) in self.events.iter().enumerate() {
            let feature_id = event.feature_id.as_str();
            match event.event_type {
                EventType::Start => {
                    if open.contains_key(feature_id) {
                        continue;
                    }
                    let ordinal = ordinals.entry(feature_id).or_insert(0);
                    open.insert(feature_id, instances.len());
                    instances.push(FeatureInstance {
                        feature_id: event.feature_id.clone(),
                        ordinal: *ordinal,
                        start_event: event.id,
                        start_index: index,
                        stop_event: None,
                        start_minute: event.minute,
                        stop_minute: self.session_length,
                    });
                    *ordinal += 1;
                }
                EventType::Stop => {
                    if let Some(instance_index) = open.remove(feature_id) {
                        let instance = &mut instances[instance_index];
                        instance.stop_event = Some(event.id);
                        instance.stop_minute = event.minute;
                    }
                }
            }
        }
        instances
    }

    /// Adds a Start event and returns its id.
    pub fn add_start(
        &mut self,
        feature_id: impl Into<String>,
        minute: u32,
        settings: SettingsMap,
        ramp: Option<(i64, i64)>,
    ) -> u64 {
        let mut event = TimelineEvent::new(self.next_id(), feature_id, EventType::Start, minute);
        event.settings = settings;
        if let Some((start, end)) = ramp {
            event.start_value = Some(start);
            event.end_value = Some(end);
        }
        self.insert(event)
    }

    /// Adds a Stop event and returns its id.
    pub fn add_stop(&mut self, feature_id: impl Into<String>, minute: u32) -> u64 {
        let event = TimelineEvent::new(self.next_id(), feature_id, EventType::Stop, minute);
        self.insert(event)
    }

    /// Inserts an event after every event at the same or an earlier minute.
    /// The minute is clamped to the session.
    pub fn insert(&mut self, mut event: TimelineEvent) -> u64 {
        event.minute = event.minute.min(self.session_length);
        let position = self
            .events
            .partition_point(|existing| existing.minute <= event.minute);
        let id = event.id;
        self.events.insert(position, event);
        id
    }

    pub fn remove_event(&mut self, id: u64) -> Option<TimelineEvent> {
        let index = self.events.iter().position(|event| event.id == id)?;
        Some(self.events.remove(index))
    }

    /// Moves an event to another minute (clamped to the session). The moved
    /// event goes after events already sitting on the target minute.
    pub fn move_event(&mut self, id: u64, minute: u32) -> Result<()> {
        let mut event = self
            .remove_event(id)
            .ok_or_else(|| SessionError::configuration(format!("no event with id {id}")))?;
        event.minute = minute;
        self.insert(event);
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut timeline: Timeline = serde_json::from_str(json)?;
        timeline.events.sort_by_key(|event| event.minute);
        Ok(timeline)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    /// Checks every timeline invariant against `registry` and returns the
    /// read-only snapshot playback runs from.
    ///
    /// Unknown feature ids are rejected when `strict` is set; otherwise they
    /// are logged here and skipped by the scheduler.
    pub fn validate(&self, registry: &FeatureRegistry, strict: bool) -> Result<TimelineSnapshot> {
        if self.session_length == 0 {
            return Err(SessionError::configuration(
                "session length must be at least one minute",
            ));
        }

        let mut ids = HashSet::new();
        for event in &self.events {
            if !ids.insert(event.id) {
                return Err(SessionError::configuration(format!(
                    "event id {} is used more than once",
                    event.id
                )));
            }
        }

        let mut events = self.events.clone();
        events.sort_by_key(|event| event.minute);

        let mut instances: Vec<FeatureInstance> = Vec::new();
        let mut open: HashMap<&str, usize> = HashMap::new();
        let mut ordinals: HashMap<&str, usize> = HashMap::new();

        for (index, event) in events.iter().enumerate() {
            let context = format!(
                "event {} (`{}` at minute {})",
                event.id, event.feature_id, event.minute
            );
            if event.minute > self.session_length {
                return Err(SessionError::configuration(format!(
                    "{context} lies beyond the session length of {} minutes",
                    self.session_length
                )));
            }

            let feature = registry.get(&event.feature_id);
            if feature.is_none() {
                if strict {
                    registry.require(&event.feature_id)?;
                }
                tracing::warn!(
                    event_id = event.id,
                    feature_id = %event.feature_id,
                    "event references an unknown feature and will be skipped"
                );
            }

            match event.event_type {
                EventType::Start => {
                    if let Some(&previous) = open.get(event.feature_id.as_str()) {
                        return Err(SessionError::configuration(format!(
                            "{context} starts a feature that is still open since minute {}",
                            instances[previous].start_minute
                        )));
                    }

                    match (event.start_value, event.end_value, feature) {
                        (None, None, _) => {}
                        (Some(start), Some(end), Some(feature)) => {
                            let (min, max) = feature.ramp_range().ok_or_else(|| {
                                SessionError::configuration(format!(
                                    "{context} carries ramp values but the feature does not ramp"
                                ))
                            })?;
                            for value in [start, end] {
                                if !(min..=max).contains(&value) {
                                    return Err(SessionError::configuration(format!(
                                        "{context} ramp value {value} lies outside [{min}, {max}]"
                                    )));
                                }
                            }
                        }
                        (Some(_), Some(_), None) => {}
                        _ => {
                            return Err(SessionError::configuration(format!(
                                "{context} must carry both ramp values or neither"
                            )));
                        }
                    }

                    if let Some(feature) = feature {
                        for key in event.settings.keys() {
                            if feature.setting(key).is_none() {
                                tracing::warn!(
                                    event_id = event.id,
                                    feature_id = %event.feature_id,
                                    key = %key,
                                    "ignoring setting the feature does not declare"
                                );
                            }
                        }
                    }

                    let ordinal = ordinals.entry(event.feature_id.as_str()).or_insert(0);
                    open.insert(event.feature_id.as_str(), instances.len());
                    instances.push(FeatureInstance {
                        feature_id: event.feature_id.clone(),
                        ordinal: *ordinal,
                        start_event: event.id,
                        start_index: index,
                        stop_event: None,
                        start_minute: event.minute,
                        stop_minute: self.session_length,
                    });
                    *ordinal += 1;
                }
                EventType::Stop => {
                    if !event.settings.is_empty()
                        || event.start_value.is_some()
                        || event.end_value.is_some()
                    {
                        return Err(SessionError::configuration(format!(
                            "{context} is a Stop event and must not carry settings or ramp values"
                        )));
                    }

                    let Some(instance_index) = open.remove(event.feature_id.as_str()) else {
                        return Err(SessionError::configuration(format!(
                            "{context} stops a feature that has no open Start"
                        )));
                    };
                    let instance = &mut instances[instance_index];
                    if event.minute <= instance.start_minute {
                        return Err(SessionError::configuration(format!(
                            "{context} must come after its Start at minute {}",
                            instance.start_minute
                        )));
                    }
                    instance.stop_event = Some(event.id);
                    instance.stop_minute = event.minute;
                }
            }
        }

        let by_event = instances
            .iter()
            .enumerate()
            .flat_map(|(index, instance)| {
                std::iter::once((instance.start_event, index))
                    .chain(instance.stop_event.map(|stop| (stop, index)))
            })
            .collect();

        Ok(TimelineSnapshot {
            session_length: self.session_length,
            events,
            instances,
            by_event,
        })
    }
}

/// One activation of a feature: a Start and, if authored, its closing Stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureInstance {
    pub feature_id: String,
    /// Zero-based occurrence of this feature within the timeline.
    pub ordinal: usize,
    pub start_event: u64,
    start_index: usize,
    pub stop_event: Option<u64>,
    pub start_minute: u32,
    /// Minute of the paired Stop, or the session length when none is authored.
    pub stop_minute: u32,
}

/// Validated, immutable view of a timeline for one or more playback runs.
#[derive(Debug, Clone)]
pub struct TimelineSnapshot {
    session_length: u32,
    events: Vec<TimelineEvent>,
    instances: Vec<FeatureInstance>,
    by_event: HashMap<u64, usize>,
}

impl TimelineSnapshot {
    pub fn session_length(&self) -> u32 {
        self.session_length
    }

    /// Events ordered by minute, ties in authored order.
    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Feature instances ordered by their Start event.
    pub fn instances(&self) -> &[FeatureInstance] {
        &self.instances
    }

    /// The instance a Start or Stop event belongs to.
    pub fn instance_for(&self, event_id: u64) -> Option<&FeatureInstance> {
        self.by_event
            .get(&event_id)
            .and_then(|&index| self.instances.get(index))
    }

    /// Instances whose Start has fired by `minute` and whose Stop has not.
    /// Nothing is active once the session has ended.
    pub fn active_at(&self, minute: f64) -> impl Iterator<Item = (&FeatureInstance, &TimelineEvent)> {
        let ended = minute >= f64::from(self.session_length);
        self.instances.iter().filter_map(move |instance| {
            let started = f64::from(instance.start_minute) <= minute;
            let stopped = ended
                || (instance.stop_event.is_some() && f64::from(instance.stop_minute) <= minute);
            (started && !stopped).then(|| (instance, &self.events[instance.start_index]))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FeatureDefinition, FeatureSettingDefinition, SettingValue};

    fn registry() -> FeatureRegistry {
        let mut registry = FeatureRegistry::new();
        registry
            .register(
                FeatureDefinition::new("glow", "Glow")
                    .with_setting(FeatureSettingDefinition::slider("intensity", 0, 100).ramped()),
            )
            .unwrap();
        registry
            .register(
                FeatureDefinition::new("chime", "Chime")
                    .with_setting(FeatureSettingDefinition::file_picker("sound")),
            )
            .unwrap();
        registry
    }

    fn config_error(result: Result<TimelineSnapshot>) -> String {
        match result {
            Err(SessionError::Configuration(message)) => message,
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn authoring_keeps_minute_order_with_authored_ties() {
        let mut timeline = Timeline::new(30);
        let late = timeline.add_start("glow", 12, SettingsMap::new(), None);
        let first = timeline.add_start("chime", 4, SettingsMap::new(), None);
        let second = timeline.add_stop("chime", 12);

        let order: Vec<u64> = timeline.events().iter().map(|event| event.id).collect();
        assert_eq!(order, [first, late, second]);
    }

    #[test]
    fn clamps_minutes_to_session() {
        let mut timeline = Timeline::new(20);
        let id = timeline.add_stop("glow", 45);
        assert_eq!(timeline.event(id).unwrap().minute, 20);

        timeline.move_event(id, 7).unwrap();
        assert_eq!(timeline.event(id).unwrap().minute, 7);
        assert!(timeline.move_event(999, 3).is_err());
    }

    #[test]
    fn pairs_starts_with_stops() {
        let mut timeline = Timeline::new(30);
        let a = timeline.add_start("glow", 2, SettingsMap::new(), Some((10, 90)));
        let b = timeline.add_stop("glow", 10);
        let c = timeline.add_start("glow", 10, SettingsMap::new(), None);
        let d = timeline.add_start("chime", 5, SettingsMap::new(), None);

        // Stop at 10 was authored before the second Start at 10.
        let snapshot = timeline.validate(&registry(), true).unwrap();
        let instances = snapshot.instances();
        assert_eq!(instances.len(), 3);

        let first = snapshot.instance_for(a).unwrap();
        assert_eq!((first.ordinal, first.stop_event, first.stop_minute), (0, Some(b), 10));
        assert_eq!(snapshot.instance_for(b), Some(first));

        let reopened = snapshot.instance_for(c).unwrap();
        assert_eq!((reopened.ordinal, reopened.stop_event, reopened.stop_minute), (1, None, 30));

        let chime = snapshot.instance_for(d).unwrap();
        assert_eq!(chime.ordinal, 0);

        let active: Vec<u64> = snapshot.active_at(10.0).map(|(i, _)| i.start_event).collect();
        assert_eq!(active, [d, c]);
    }

    #[test]
    fn rejects_stop_without_open_start() {
        let mut timeline = Timeline::new(30);
        timeline.add_stop("glow", 3);
        let message = config_error(timeline.validate(&registry(), false));
        assert!(message.contains("no open Start"), "{message}");
    }

    #[test]
    fn rejects_stop_at_start_minute() {
        let mut timeline = Timeline::new(30);
        timeline.add_start("glow", 3, SettingsMap::new(), None);
        timeline.add_stop("glow", 3);
        let message = config_error(timeline.validate(&registry(), false));
        assert!(message.contains("after its Start"), "{message}");
    }

    #[test]
    fn rejects_overlapping_starts() {
        let mut timeline = Timeline::new(30);
        timeline.add_start("glow", 1, SettingsMap::new(), None);
        timeline.add_start("glow", 4, SettingsMap::new(), None);
        let message = config_error(timeline.validate(&registry(), false));
        assert!(message.contains("still open"), "{message}");
    }

    #[test]
    fn rejects_invalid_ramps() {
        let mut not_rampable = Timeline::new(30);
        not_rampable.add_start("chime", 1, SettingsMap::new(), Some((0, 5)));
        assert!(config_error(not_rampable.validate(&registry(), false)).contains("does not ramp"));

        let mut out_of_range = Timeline::new(30);
        out_of_range.add_start("glow", 1, SettingsMap::new(), Some((0, 150)));
        assert!(config_error(out_of_range.validate(&registry(), false)).contains("150"));

        let mut half = Timeline::new(30);
        let mut event = TimelineEvent::new(1, "glow", EventType::Start, 1);
        event.start_value = Some(20);
        half.insert(event);
        assert!(config_error(half.validate(&registry(), false)).contains("both ramp values"));
    }

    #[test]
    fn rejects_stop_carrying_settings() {
        let mut timeline = Timeline::new(30);
        timeline.add_start("glow", 1, SettingsMap::new(), None);
        let mut stop = TimelineEvent::new(7, "glow", EventType::Stop, 5);
        stop.settings.insert("intensity".into(), SettingValue::Integer(3));
        timeline.insert(stop);
        assert!(config_error(timeline.validate(&registry(), false)).contains("must not carry"));
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(config_error(Timeline::new(0).validate(&registry(), false)).contains("session"));

        let json = r#"{"sessionLength": 10, "events": [
            {"id": 1, "featureId": "glow", "eventType": "start", "minute": 1},
            {"id": 1, "featureId": "glow", "eventType": "stop", "minute": 2}
        ]}"#;
        let timeline = Timeline::from_json_str(json).unwrap();
        assert!(config_error(timeline.validate(&registry(), false)).contains("more than once"));

        let json = r#"{"sessionLength": 10, "events": [
            {"id": 1, "featureId": "glow", "eventType": "start", "minute": 11}
        ]}"#;
        let timeline = Timeline::from_json_str(json).unwrap();
        assert!(config_error(timeline.validate(&registry(), false)).contains("beyond"));
    }

    #[test]
    fn unknown_features_are_fatal_only_when_strict() {
        let mut timeline = Timeline::new(30);
        timeline.add_start("laser", 1, SettingsMap::new(), None);
        timeline.add_stop("laser", 2);

        assert!(timeline.validate(&registry(), false).is_ok());
        assert!(config_error(timeline.validate(&registry(), true)).contains("laser"));
    }

    #[test]
    fn persists_through_files() {
        let mut timeline = Timeline::new(45);
        let mut settings = SettingsMap::new();
        settings.insert("intensity".into(), SettingValue::Integer(40));
        timeline.add_start("glow", 2, settings, Some((10, 90)));
        timeline.add_stop("glow", 10);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        timeline.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"sessionLength\": 45"));
        assert!(raw.contains("\"eventType\": \"stop\""));
        assert!(!raw.contains("endValue\": null"));

        let loaded = Timeline::load(&path).unwrap();
        assert_eq!(loaded, timeline);
    }

    #[test]
    fn demo_session_matches_builtin_catalog() {
        let timeline = Timeline::from_json_str(include_str!("../../../../demos/wind-down.json"))
            .unwrap();
        let snapshot = timeline.validate(&FeatureRegistry::builtin(), true).unwrap();
        assert_eq!(snapshot.instances().len(), 3);
        assert!(snapshot.instances().iter().all(|i| i.stop_event.is_some()));
    }

    #[test]
    fn loading_sorts_by_minute_keeping_file_order_for_ties() {
        let json = r#"{"sessionLength": 10, "events": [
            {"id": 3, "featureId": "glow", "eventType": "stop", "minute": 6},
            {"id": 1, "featureId": "chime", "eventType": "start", "minute": 6},
            {"id": 2, "featureId": "glow", "eventType": "start", "minute": 1}
        ]}"#;
        let timeline = Timeline::from_json_str(json).unwrap();
        let order: Vec<u64> = timeline.events().iter().map(|event| event.id).collect();
        assert_eq!(order, [2, 3, 1]);
    }

    #[test]
    fn new_ids_stay_unique_after_the_highest_id() {
        let json = r#"{"sessionLength": 10, "events": [
            {"id": 18446744073709551615, "featureId": "glow", "eventType": "start", "minute": 1},
            {"id": 1, "featureId": "chime", "eventType": "start", "minute": 2}
        ]}"#;
        let mut timeline = Timeline::from_json_str(json).unwrap();
        let stop = timeline.add_stop("glow", 3);
        assert_eq!(stop, 2);
        assert_eq!(timeline.add_stop("chime", 4), 3);

        let snapshot = timeline.validate(&registry(), true).unwrap();
        assert_eq!(snapshot.instance_for(u64::MAX).unwrap().stop_event, Some(stop));
    }

    #[test]
    fn authored_instances_match_validated_pairing() {
        let mut timeline = Timeline::new(30);
        let glow = timeline.add_start("glow", 2, SettingsMap::new(), Some((10, 90)));
        let stop = timeline.add_stop("glow", 10);
        let chime = timeline.add_start("chime", 5, SettingsMap::new(), None);

        let instances = timeline.instances();
        assert_eq!(instances, timeline.validate(&registry(), true).unwrap().instances());
        assert_eq!(instances[0].start_event, glow);
        assert_eq!((instances[0].stop_event, instances[0].stop_minute), (Some(stop), 10));
        assert_eq!((instances[1].start_event, instances[1].stop_minute), (chime, 30));

        // Unpaired edits in progress are left out rather than rejected.
        timeline.add_stop("chime", 3);
        timeline.add_start("glow", 4, SettingsMap::new(), None);
        let instances = timeline.instances();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].stop_event, None);
    }

    #[test]
    fn nothing_is_active_after_the_session_ends() {
        let mut timeline = Timeline::new(20);
        let open = timeline.add_start("chime", 4, SettingsMap::new(), None);
        let snapshot = timeline.validate(&registry(), true).unwrap();

        let active: Vec<u64> = snapshot.active_at(19.5).map(|(i, _)| i.start_event).collect();
        assert_eq!(active, [open]);
        assert_eq!(snapshot.active_at(20.0).count(), 0);
        assert_eq!(snapshot.active_at(999.0).count(), 0);
    }
}
