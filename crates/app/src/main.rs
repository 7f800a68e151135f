use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use session_timeline_core::{
    AppConfig, FeatureRegistry, PlaybackScheduler, SchedulerEvent, SettingKind, Timeline,
    TracingSink,
};
use tracing_subscriber::EnvFilter;

fn main() -> session_timeline_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if cli.registry.is_some() {
        config.registry_path = cli.registry.clone();
    }

    match cli.command {
        Commands::Features => run_features(&config),
        Commands::Validate { timeline } => run_validate(&config, &timeline),
        Commands::Play {
            timeline,
            minute_millis,
            tick_millis,
            strict,
        } => {
            if let Some(minute_millis) = minute_millis {
                config.scheduler.minute_millis = minute_millis;
            }
            if let Some(tick_millis) = tick_millis {
                config.scheduler.tick_interval_millis = tick_millis;
            }
            config.scheduler.strict_feature_ids |= strict;
            run_play(&config, &timeline)
        }
        Commands::Preview { timeline, minute } => run_preview(&config, &timeline, minute),
    }
}

fn load_registry(config: &AppConfig) -> session_timeline_core::Result<FeatureRegistry> {
    match &config.registry_path {
        Some(path) => {
            tracing::info!(?path, "loading feature catalog");
            FeatureRegistry::load(path)
        }
        None => Ok(FeatureRegistry::builtin()),
    }
}

fn run_features(config: &AppConfig) -> session_timeline_core::Result<()> {
    let registry = load_registry(config)?;
    for feature in registry.iter() {
        let ramp = if feature.supports_ramping { " (ramps)" } else { "" };
        println!("{} - {}{ramp}", feature.id, feature.name);
        for setting in &feature.settings {
            let detail = match &setting.kind {
                SettingKind::Slider { min, max } => format!("slider {min}..={max}"),
                SettingKind::Dropdown { options } => format!("dropdown [{}]", options.join(", ")),
                other => other.label().to_string(),
            };
            let default = setting
                .default
                .as_ref()
                .map(|value| format!(", default {value}"))
                .unwrap_or_default();
            let marker = if setting.supports_ramp { " *" } else { "" };
            println!("    {}: {detail}{default}{marker}", setting.key);
        }
    }
    Ok(())
}

fn run_validate(config: &AppConfig, path: &Path) -> session_timeline_core::Result<()> {
    let registry = load_registry(config)?;
    let timeline = Timeline::load(path)?;
    let snapshot = timeline.validate(&registry, config.scheduler.strict_feature_ids)?;
    println!(
        "{}: {} events, {} feature instances over {} minutes",
        path.display(),
        snapshot.events().len(),
        snapshot.instances().len(),
        snapshot.session_length()
    );
    Ok(())
}

fn run_play(config: &AppConfig, path: &Path) -> session_timeline_core::Result<()> {
    tracing::info!(?path, minute_millis = config.scheduler.minute_millis, "starting session");

    let registry = Arc::new(load_registry(config)?);
    let timeline = Timeline::load(path)?;
    let mut scheduler = PlaybackScheduler::new(registry, TracingSink, config.scheduler.clone());
    scheduler.subscribe(|event| match event {
        SchedulerEvent::EventSkipped { event_id, reason, .. } => {
            eprintln!("skipped event {event_id}: {reason}");
        }
        SchedulerEvent::SinkFailed { feature_id, reason } => {
            eprintln!("feature {feature_id} failed: {reason}");
        }
        _ => {}
    });
    scheduler.load(&timeline)?;

    let state = scheduler.run(std::thread::sleep)?;
    println!("session {state} after {:.2} minutes", scheduler.elapsed_minutes());
    Ok(())
}

fn run_preview(config: &AppConfig, path: &Path, minute: f64) -> session_timeline_core::Result<()> {
    let registry = Arc::new(load_registry(config)?);
    let timeline = Timeline::load(path)?;
    let mut scheduler = PlaybackScheduler::new(registry, TracingSink, config.scheduler.clone());
    scheduler.load(&timeline)?;

    let entries = scheduler.preview_at(minute)?;
    if entries.is_empty() {
        println!("no features active at minute {minute}");
    }
    for entry in entries {
        let settings = entry
            .settings
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        let ramp = entry
            .ramp_value
            .map(|value| format!(" ramp={value}"))
            .unwrap_or_default();
        println!(
            "{} [{}..{}]{ramp} {settings}",
            entry.feature_id, entry.start_minute, entry.stop_minute
        );
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Timed feature session player", long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// JSON feature catalog replacing the built-in one.
    #[arg(short, long, global = true)]
    registry: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the features timelines may reference.
    Features,
    /// Check a timeline file without playing it.
    Validate {
        /// Path to the timeline document.
        timeline: PathBuf,
    },
    /// Play a timeline in real time, logging every feature call.
    Play {
        /// Path to the timeline document.
        timeline: PathBuf,
        /// Wall-clock length of one session minute.
        #[arg(long)]
        minute_millis: Option<u64>,
        /// Timer period between ticks.
        #[arg(long)]
        tick_millis: Option<u64>,
        /// Reject events referencing unknown features.
        #[arg(long)]
        strict: bool,
    },
    /// Show which features are active at a given minute.
    Preview {
        /// Path to the timeline document.
        timeline: PathBuf,
        /// Session minute to inspect.
        #[arg(short, long)]
        minute: f64,
    },
}
