//! Core library for timed feature sessions.
//!
//! A session is a timeline of Start/Stop events placed on a minute grid, each
//! switching a pluggable feature on or off. Ramp-capable features also get an
//! intensity value interpolated between a start and end value while active.
//! Each module owns one piece of that model: the feature catalog, settings
//! resolution, ramp interpolation, the authored timeline, the playback
//! scheduler and the back-end boundary it drives.

pub mod config;
pub mod error;
pub mod ramp;
pub mod registry;
pub mod scheduler;
pub mod settings;
pub mod sink;
pub mod timeline;

pub use config::{AppConfig, SchedulerConfig};
pub use error::{Result, SessionError};
pub use ramp::{interpolate, RampSpan};
pub use registry::{FeatureDefinition, FeatureRegistry, FeatureSettingDefinition, SettingKind};
pub use scheduler::{
    Clock, ManualClock, MonotonicClock, PlaybackScheduler, PlaybackState, PreviewEntry,
    SchedulerEvent, TickReport,
};
pub use settings::{Resolution, SettingValue, SettingsMap, SettingsResolver};
pub use sink::{FeatureSink, RecordingSink, SinkCall, SinkRouter, TracingSink};
pub use timeline::{EventType, FeatureInstance, Timeline, TimelineEvent, TimelineSnapshot};
