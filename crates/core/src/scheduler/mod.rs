//! Playback of a validated timeline against the feature back-ends.
//!
//! [`PlaybackScheduler`] is a single-threaded state machine driven by a
//! recurring timer calling [`PlaybackScheduler::tick`]. Session time is
//! derived from the wall clock (minus time spent paused), never from the
//! number of ticks, so pausing does not shift events against the timeline.

mod clock;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use clock::{Clock, ManualClock, MonotonicClock};

use crate::{
    EventType, FeatureDefinition, FeatureRegistry, FeatureSink, RampSpan, Result,
    SchedulerConfig, SessionError, SettingValue, SettingsMap, SettingsResolver, Timeline,
    TimelineEvent, TimelineSnapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaybackState {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl PlaybackState {
    /// Running or paused: a run is in progress.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Notification delivered to observers registered with
/// [`PlaybackScheduler::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    StateChanged {
        from: PlaybackState,
        to: PlaybackState,
    },
    EventProcessed {
        event_id: u64,
        feature_id: String,
        event_type: EventType,
        minute: u32,
    },
    EventSkipped {
        event_id: u64,
        feature_id: String,
        reason: String,
    },
    SettingCoerced {
        event_id: u64,
        feature_id: String,
        reason: String,
    },
    SinkFailed {
        feature_id: String,
        reason: String,
    },
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub elapsed_minutes: f64,
    /// Ids of the timeline events consumed by this tick, in processing order.
    pub processed: Vec<u64>,
    /// Ramp values delivered by this tick, in delivery order.
    pub ramps: Vec<(String, i64)>,
    pub state: PlaybackState,
}

/// A feature instance active at some minute, as computed by
/// [`PlaybackScheduler::preview_at`].
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewEntry {
    pub feature_id: String,
    pub start_minute: u32,
    pub stop_minute: u32,
    pub settings: SettingsMap,
    pub ramp_value: Option<i64>,
}

#[derive(Debug)]
struct ActiveInstance {
    feature_id: String,
    start_event: u64,
    ramp: Option<RampSpan>,
    ramp_failures: u32,
}

#[derive(Debug, Default)]
struct RunState {
    started_at: Duration,
    paused_at: Option<Duration>,
    paused_total: Duration,
    elapsed_minutes: f64,
    cursor: usize,
    /// Open instances in activation order.
    active: Vec<ActiveInstance>,
}

type Observer = Box<dyn FnMut(&SchedulerEvent)>;

pub struct PlaybackScheduler {
    registry: Arc<FeatureRegistry>,
    sink: Box<dyn FeatureSink>,
    clock: Box<dyn Clock>,
    config: SchedulerConfig,
    resolver: SettingsResolver,
    snapshot: Option<Arc<TimelineSnapshot>>,
    staged: Option<Arc<TimelineSnapshot>>,
    state: PlaybackState,
    run: RunState,
    observers: Vec<Observer>,
}

impl PlaybackScheduler {
    /// Creates an idle scheduler bound to a catalog and a back-end, timed by
    /// a [`MonotonicClock`].
    pub fn new(
        registry: Arc<FeatureRegistry>,
        sink: impl FeatureSink + 'static,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            sink: Box::new(sink),
            clock: Box::new(MonotonicClock::start()),
            config,
            resolver: SettingsResolver::new(),
            snapshot: None,
            staged: None,
            state: PlaybackState::Idle,
            run: RunState::default(),
            observers: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Session minutes elapsed in the current (or last) run.
    pub fn elapsed_minutes(&self) -> f64 {
        self.run.elapsed_minutes
    }

    pub fn snapshot(&self) -> Option<&Arc<TimelineSnapshot>> {
        self.snapshot.as_ref()
    }

    pub fn has_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Feature ids of the currently open instances, in activation order.
    pub fn active_features(&self) -> Vec<&str> {
        self.run
            .active
            .iter()
            .map(|instance| instance.feature_id.as_str())
            .collect()
    }

    pub fn subscribe(&mut self, observer: impl FnMut(&SchedulerEvent) + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Validates `timeline` and makes it the timeline of the next run.
    ///
    /// Refused while a run is in progress; use [`PlaybackScheduler::stage`]
    /// to queue edits instead.
    pub fn load(&mut self, timeline: &Timeline) -> Result<()> {
        if self.state.is_active() {
            return Err(self.state_error("load a timeline"));
        }
        let snapshot = self.validate(timeline)?;
        self.snapshot = Some(snapshot);
        self.staged = None;
        self.set_state(PlaybackState::Idle);
        Ok(())
    }

    /// Validates `timeline` and swaps it in at the next safe boundary: right
    /// away when no run is in progress, otherwise when the next run starts.
    pub fn stage(&mut self, timeline: &Timeline) -> Result<()> {
        let snapshot = self.validate(timeline)?;
        if self.state.is_active() {
            tracing::info!("timeline staged for the next run");
            self.staged = Some(snapshot);
        } else {
            self.snapshot = Some(snapshot);
            self.staged = None;
        }
        Ok(())
    }

    fn validate(&self, timeline: &Timeline) -> Result<Arc<TimelineSnapshot>> {
        let snapshot = timeline.validate(&self.registry, self.config.strict_feature_ids)?;
        Ok(Arc::new(snapshot))
    }

    /// Begins a fresh run of the loaded timeline.
    pub fn start(&mut self) -> Result<()> {
        if self.state.is_active() {
            return Err(self.state_error("start"));
        }
        if let Some(staged) = self.staged.take() {
            self.snapshot = Some(staged);
        }
        let Some(snapshot) = &self.snapshot else {
            return Err(self.state_error("start without a timeline"));
        };

        tracing::info!(
            session_length = snapshot.session_length(),
            events = snapshot.events().len(),
            "starting playback"
        );
        self.run = RunState {
            started_at: self.clock.now(),
            ..RunState::default()
        };
        self.set_state(PlaybackState::Running);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        if self.state != PlaybackState::Running {
            return Err(self.state_error("pause"));
        }
        self.run.paused_at = Some(self.clock.now());
        self.set_state(PlaybackState::Paused);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.state != PlaybackState::Paused {
            return Err(self.state_error("resume"));
        }
        if let Some(paused_at) = self.run.paused_at.take() {
            self.run.paused_total += self.clock.now().saturating_sub(paused_at);
        }
        self.set_state(PlaybackState::Running);
        Ok(())
    }

    /// Stops the run, deactivating every open instance before returning.
    pub fn cancel(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(self.state_error("cancel"));
        }
        tracing::info!(active = self.run.active.len(), "cancelling playback");
        let mut report = self.empty_report();
        while !self.run.active.is_empty() {
            self.close_instance(0, None, &mut report);
        }
        self.set_state(PlaybackState::Cancelled);
        Ok(())
    }

    /// Advances the session to the current wall-clock time: fires every due
    /// event, then feeds the live ramp value to each ramping instance.
    pub fn tick(&mut self) -> Result<TickReport> {
        match self.state {
            PlaybackState::Running => {}
            PlaybackState::Paused => return Ok(self.empty_report()),
            _ => return Err(self.state_error("tick")),
        }
        let Some(snapshot) = self.snapshot.clone() else {
            return Err(self.state_error("tick without a timeline"));
        };

        let session_length = f64::from(snapshot.session_length());
        let elapsed = self.update_elapsed().min(session_length);
        let mut report = self.empty_report();
        report.elapsed_minutes = elapsed;

        while let Some(event) = snapshot.events().get(self.run.cursor) {
            if f64::from(event.minute) > elapsed {
                break;
            }
            self.run.cursor += 1;
            report.processed.push(event.id);
            match event.event_type {
                EventType::Start => self.start_instance(&snapshot, event),
                EventType::Stop => self.stop_instance(event, &mut report),
            }
        }

        if elapsed >= session_length {
            while !self.run.active.is_empty() {
                self.close_instance(0, Some(session_length), &mut report);
            }
            self.set_state(PlaybackState::Completed);
        } else {
            let due: Vec<(usize, i64)> = self
                .run
                .active
                .iter()
                .enumerate()
                .filter_map(|(index, instance)| {
                    instance.ramp.map(|ramp| (index, ramp.value_at(elapsed)))
                })
                .collect();
            for (index, value) in due {
                self.deliver_ramp(index, value, &mut report);
            }
        }

        report.state = self.state;
        Ok(report)
    }

    /// Drives a whole run: starts it if needed, then ticks every configured
    /// interval until it completes or is cancelled. `wait` is called between
    /// ticks; pass [`std::thread::sleep`] for real-time playback.
    pub fn run(&mut self, mut wait: impl FnMut(Duration)) -> Result<PlaybackState> {
        match self.state {
            PlaybackState::Running => {}
            PlaybackState::Paused => return Err(self.state_error("run")),
            _ => self.start()?,
        }
        let interval = self.config.tick_interval();
        loop {
            let report = self.tick()?;
            if report.state.is_terminal() {
                return Ok(report.state);
            }
            wait(interval);
        }
    }

    /// Instances active at `minute` with their resolved settings and ramp
    /// values. Touches neither the back-end nor the run state.
    pub fn preview_at(&self, minute: f64) -> Result<Vec<PreviewEntry>> {
        let Some(snapshot) = &self.snapshot else {
            return Err(self.state_error("preview without a timeline"));
        };

        let mut entries = Vec::new();
        for (instance, event) in snapshot.active_at(minute) {
            let Some(feature) = self.registry.get(&instance.feature_id) else {
                continue;
            };
            let mut settings = self.resolver.resolve(event, feature).settings;
            let ramp = ramp_for(event, feature, instance.stop_minute);
            if let (Some(ramp), Some(setting)) = (ramp, feature.ramp_setting()) {
                settings.insert(setting.key.clone(), SettingValue::Integer(ramp.start_value));
            }
            entries.push(PreviewEntry {
                feature_id: instance.feature_id.clone(),
                start_minute: instance.start_minute,
                stop_minute: instance.stop_minute,
                settings,
                ramp_value: ramp.map(|ramp| ramp.value_at(minute)),
            });
        }
        Ok(entries)
    }

    fn start_instance(&mut self, snapshot: &TimelineSnapshot, event: &TimelineEvent) {
        let registry = Arc::clone(&self.registry);
        let feature = match registry.require(&event.feature_id) {
            Ok(feature) => feature,
            Err(err) => {
                self.skip_event(event, err.to_string());
                return;
            }
        };

        let resolution = self.resolver.resolve(event, feature);
        for issue in resolution.coercions {
            tracing::warn!(event_id = event.id, error = %issue, "falling back for setting value");
            self.notify(SchedulerEvent::SettingCoerced {
                event_id: event.id,
                feature_id: event.feature_id.clone(),
                reason: issue.to_string(),
            });
        }

        let mut settings = resolution.settings;
        let stop_minute = snapshot
            .instance_for(event.id)
            .map_or(snapshot.session_length(), |instance| instance.stop_minute);
        let mut ramp = ramp_for(event, feature, stop_minute);
        if let (Some(ramp), Some(setting)) = (ramp, feature.ramp_setting()) {
            settings.insert(setting.key.clone(), SettingValue::Integer(ramp.start_value));
        }

        tracing::info!(
            event_id = event.id,
            feature_id = %event.feature_id,
            minute = event.minute,
            "activating feature"
        );
        if let Err(err) = self.sink.activate(&event.feature_id, &settings) {
            self.sink_failed(&event.feature_id, "activate", &err);
            ramp = None;
        }

        self.run.active.push(ActiveInstance {
            feature_id: event.feature_id.clone(),
            start_event: event.id,
            ramp,
            ramp_failures: 0,
        });
        self.processed(event);
    }

    fn stop_instance(&mut self, event: &TimelineEvent, report: &mut TickReport) {
        let Some(index) = self
            .run
            .active
            .iter()
            .position(|instance| instance.feature_id == event.feature_id)
        else {
            self.skip_event(event, "feature is not active".to_string());
            return;
        };

        tracing::info!(
            event_id = event.id,
            feature_id = %event.feature_id,
            minute = event.minute,
            "deactivating feature"
        );
        self.close_instance(index, Some(f64::from(event.minute)), report);
        self.processed(event);
    }

    /// Removes an open instance, delivering its final ramp value at
    /// `final_minute` (if given) before deactivating it.
    fn close_instance(&mut self, index: usize, final_minute: Option<f64>, report: &mut TickReport) {
        if let (Some(minute), Some(ramp)) = (final_minute, self.run.active[index].ramp) {
            self.deliver_ramp(index, ramp.value_at(minute), report);
        }
        let instance = self.run.active.remove(index);
        tracing::debug!(
            feature_id = %instance.feature_id,
            start_event = instance.start_event,
            "closing feature instance"
        );
        if let Err(err) = self.sink.deactivate(&instance.feature_id) {
            self.sink_failed(&instance.feature_id, "deactivate", &err);
        }
    }

    fn deliver_ramp(&mut self, index: usize, value: i64, report: &mut TickReport) {
        let feature_id = self.run.active[index].feature_id.clone();
        tracing::trace!(feature_id = %feature_id, value, "ramp update");
        match self.sink.update_ramp(&feature_id, value) {
            Ok(()) => report.ramps.push((feature_id, value)),
            Err(err) => {
                let instance = &mut self.run.active[index];
                instance.ramp_failures += 1;
                if instance.ramp_failures == 1 {
                    self.sink_failed(&feature_id, "update ramp", &err);
                }
            }
        }
    }

    fn update_elapsed(&mut self) -> f64 {
        let now = self.clock.now();
        let paused = self.run.paused_total
            + self
                .run
                .paused_at
                .map_or(Duration::ZERO, |at| now.saturating_sub(at));
        let playing = now
            .saturating_sub(self.run.started_at)
            .saturating_sub(paused);
        let minutes = playing.as_secs_f64() / self.config.minute_duration().as_secs_f64();
        self.run.elapsed_minutes = self.run.elapsed_minutes.max(minutes);
        self.run.elapsed_minutes
    }

    fn processed(&mut self, event: &TimelineEvent) {
        self.notify(SchedulerEvent::EventProcessed {
            event_id: event.id,
            feature_id: event.feature_id.clone(),
            event_type: event.event_type,
            minute: event.minute,
        });
    }

    fn skip_event(&mut self, event: &TimelineEvent, reason: String) {
        tracing::warn!(
            event_id = event.id,
            feature_id = %event.feature_id,
            %reason,
            "skipping timeline event"
        );
        self.notify(SchedulerEvent::EventSkipped {
            event_id: event.id,
            feature_id: event.feature_id.clone(),
            reason,
        });
    }

    fn sink_failed(&mut self, feature_id: &str, call: &str, err: &SessionError) {
        tracing::warn!(feature_id, call, error = %err, "feature back-end call failed");
        self.notify(SchedulerEvent::SinkFailed {
            feature_id: feature_id.to_string(),
            reason: err.to_string(),
        });
    }

    fn set_state(&mut self, to: PlaybackState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        tracing::info!(%from, %to, elapsed = self.run.elapsed_minutes, "playback state changed");
        self.notify(SchedulerEvent::StateChanged { from, to });
    }

    fn notify(&mut self, event: SchedulerEvent) {
        for observer in &mut self.observers {
            observer(&event);
        }
    }

    fn state_error(&self, action: &'static str) -> SessionError {
        SessionError::SchedulerState {
            action,
            state: self.state,
        }
    }

    fn empty_report(&self) -> TickReport {
        TickReport {
            elapsed_minutes: self.run.elapsed_minutes,
            processed: Vec::new(),
            ramps: Vec::new(),
            state: self.state,
        }
    }
}

fn ramp_for(
    event: &TimelineEvent,
    feature: &FeatureDefinition,
    stop_minute: u32,
) -> Option<RampSpan> {
    feature.ramp_setting()?;
    let (start_value, end_value) = event.ramp_values()?;
    Some(RampSpan::new(start_value, end_value, event.minute, stop_minute))
}

impl fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("elapsed_minutes", &self.run.elapsed_minutes)
            .field("active", &self.run.active.len())
            .field("staged", &self.staged.is_some())
            .field("observers", &self.observers.len())
            .finish()
    }
}
