use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use trainlink::logging::{init_logging, LogLevel};
use trainlink::protocol::uuids;
use trainlink::{
    ConnectionEvent, Engine, EngineConfig, EndpointId, FlatPlan, IntensityTarget, MetricKind, PlanBlock,
    ReadingValidator, SensorEndpoint, SensorService, SessionSummary, SimulatedTransport, WorkoutStep,
    ZoneClassifier, ZoneModel,
};

/// TrainLink - Live sensor recording and smart trainer control
///
/// Connects to heart rate straps, power meters and FTMS trainers, records a
/// session in real time and drives the trainer from a structured workout.
#[derive(Parser)]
#[command(name = "trainlink")]
#[command(author = "TrainLink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Live sensor recording and smart trainer control", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ride a scripted interval workout against simulated sensors
    Simulate {
        /// Ride length in seconds
        #[arg(short, long, default_value = "60")]
        duration: u64,

        /// Override the configured FTP
        #[arg(long)]
        ftp: Option<u16>,
    },

    /// Check a value against a metric's plausibility bounds
    Validate {
        /// Metric name (heart_rate, power, cadence, speed, ...)
        metric: MetricKind,

        /// Value to check
        value: f64,
    },

    /// Print power and heart rate zone tables
    Zones {
        /// Functional threshold power in watts
        #[arg(long)]
        ftp: Option<u16>,

        /// Lactate threshold heart rate in bpm
        #[arg(long)]
        lthr: Option<u16>,
    },

    /// Configure application settings
    Config {
        /// Write a default configuration file
        #[arg(long)]
        init: bool,

        /// Print the active configuration
        #[arg(long)]
        show: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from_file(path),
        None => Ok(EngineConfig::load_or_default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    config.logging.level = match cli.verbose {
        0 => config.logging.level,
        1 => LogLevel::Info,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };
    init_logging(&config.logging).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Simulate { duration, ftp } => {
            if ftp.is_some() {
                config.athlete.ftp = ftp;
            }
            if config.athlete.ftp.is_none() {
                config.athlete.ftp = Some(200);
            }
            println!("{}", "Starting simulated ride...".green().bold());
            let summary = simulate(config, Duration::from_secs(duration)).await?;
            print_summary(&summary);
        }

        Commands::Validate { metric, value } => match ReadingValidator::validate(metric, value) {
            Ok(_) => println!("{} {} {} is plausible", "✓".green(), value, metric.unit()),
            Err(err) => {
                let bounds = ReadingValidator::bounds(metric);
                println!("{} {}", "✗".red(), err);
                println!("  Accepted range: {} to {} {}", bounds.min, bounds.max, metric.unit());
            }
        },

        Commands::Zones { ftp, lthr } => {
            let ftp = ftp.or(config.athlete.ftp);
            let lthr = lthr.or(config.athlete.lthr);
            if ftp.is_none() && lthr.is_none() {
                anyhow::bail!("Provide --ftp and/or --lthr, or set them in the config file");
            }
            if let Some(ftp) = ftp {
                print_zones(ZoneModel::Power, ftp, "W");
            }
            if let Some(lthr) = lthr {
                print_zones(ZoneModel::HeartRate, lthr, "bpm");
            }
        }

        Commands::Config { init, show } => {
            let path = cli.config.unwrap_or_else(EngineConfig::default_config_path);
            if init {
                EngineConfig::default().save_to_file(&path)?;
                println!("{} Wrote default configuration to {}", "✓".green(), path.display());
            }
            if show || !init {
                println!("{}", format!("# {}", path.display()).dimmed());
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

fn demo_plan(ride: Duration) -> FlatPlan {
    // Warmup, three over-unders, then spin until the ride ends
    let block = (ride.as_secs() / 8).max(5);
    FlatPlan::flatten(&[
        PlanBlock::Step(WorkoutStep::timed("Warmup", block).with_target(IntensityTarget::PercentFtp(55.0))),
        PlanBlock::Repeat {
            count: 3,
            blocks: vec![
                PlanBlock::Step(WorkoutStep::timed("Over", block).with_target(IntensityTarget::PercentFtp(105.0))),
                PlanBlock::Step(WorkoutStep::timed("Under", block).with_target(IntensityTarget::PercentFtp(85.0))),
            ],
        },
        PlanBlock::Step(WorkoutStep::open_ended("Cooldown").with_target(IntensityTarget::Grade(0.0))),
    ])
}

async fn simulate(config: EngineConfig, ride: Duration) -> Result<SessionSummary> {
    let transport = SimulatedTransport::new();
    let trainer = EndpointId::new("sim-trainer");
    let strap = EndpointId::new("sim-hrm");
    transport.add_trainer(trainer.clone(), "Simulated Trainer").await;
    transport
        .add_device(
            SensorEndpoint::new(strap.clone(), "Simulated HRM")
                .with_services([SensorService::HeartRate, SensorService::Battery]),
        )
        .await;
    transport.set_value(&strap, uuids::BATTERY_LEVEL, vec![87]).await;

    let ftp = config.athlete.ftp.unwrap_or(200);
    let engine = Engine::new(Arc::new(transport.clone()), config);
    let mut events = engine.subscribe_connection_events();

    // Pick both devices up from a scan
    let found: Vec<SensorEndpoint> = engine.connections().discover().take(2).collect().await;
    for endpoint in found {
        println!("  Found {} ({})", endpoint.name.cyan(), endpoint.id);
        engine.connections().connect(&endpoint.id).await?;
    }
    while let Ok(event) = events.try_recv() {
        if let ConnectionEvent::StateChanged { endpoint, state, .. } = event {
            println!("  {} is {}", endpoint, state.to_string().green());
        }
    }

    let mut steps = engine.subscribe_step_changes();
    engine.start(Some(demo_plan(ride))).await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut watts = f64::from(ftp) * 0.55;
    for second in 0..ride.as_secs() {
        ticker.tick().await;

        // The rider follows whatever ERG target the trainer was given last
        if let Some(target) = last_power_target(&transport, &trainer).await {
            watts += (target - watts) * 0.5;
        }
        let wobble = ((second as f64) * 0.7).sin() * 6.0;
        let power = (watts + wobble).max(0.0);
        let heart_rate = 95.0 + power * 0.3;

        transport
            .notify(&trainer, uuids::INDOOR_BIKE_DATA, &indoor_bike_data(power))
            .await;
        transport
            .notify(&strap, uuids::HEART_RATE_MEASUREMENT, &[0x00, heart_rate.round() as u8])
            .await;

        while let Ok(change) = steps.try_recv() {
            match change.step {
                Some(step) => println!("  {} {}", "→".blue(), step.name.bold()),
                None => println!("  {} plan complete", "→".blue()),
            }
        }
    }

    let summary = engine.finish().await?;
    engine.shutdown().await;
    Ok(summary)
}

/// Indoor Bike Data with speed, cadence and power
fn indoor_bike_data(watts: f64) -> Vec<u8> {
    let speed = ((watts.max(1.0).cbrt() * 5.5) * 100.0) as u16; // 0.01 km/h
    let cadence = (90.0 * 2.0) as u16; // 0.5 rpm
    let power = watts.round() as i16;

    let mut bytes = vec![0x44, 0x00]; // speed, cadence, power
    bytes.extend_from_slice(&speed.to_le_bytes());
    bytes.extend_from_slice(&cadence.to_le_bytes());
    bytes.extend_from_slice(&power.to_le_bytes());
    bytes
}

async fn last_power_target(transport: &SimulatedTransport, trainer: &EndpointId) -> Option<f64> {
    transport
        .control_writes(trainer)
        .await
        .iter()
        .rev()
        .find(|write| write.first() == Some(&0x05) && write.len() >= 3)
        .map(|write| f64::from(i16::from_le_bytes([write[1], write[2]])))
}

fn print_zones(model: ZoneModel, threshold: u16, unit: &str) {
    let title = match model {
        ZoneModel::Power => format!("Power zones (FTP {} W)", threshold),
        ZoneModel::HeartRate => format!("Heart rate zones (LTHR {} bpm)", threshold),
    };
    println!("{}", title.bold());
    for zone in ZoneClassifier::zone_table(model, threshold) {
        let range = match zone.max {
            Some(max) => format!("{:.0}-{:.0} {}", zone.min, max - 1.0, unit),
            None => format!("{:.0}+ {}", zone.min, unit),
        };
        println!("  Z{}  {:<20} {}", zone.zone + 1, zone.name, range.cyan());
    }
}

fn print_summary(summary: &SessionSummary) {
    let snapshot = &summary.snapshot;
    let advanced = &summary.advanced;
    let or_dash = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());

    println!();
    println!("{}", "Session summary".green().bold());
    println!("  Session:          {}", summary.id);
    println!("  Elapsed:          {} s", snapshot.elapsed.as_secs());
    println!("  Distance:         {:.2} km", snapshot.distance_m / 1000.0);
    println!("  Work:             {:.1} kJ", snapshot.work_kj);
    println!("  Calories:         {:.0} kcal", snapshot.calories_kcal);
    println!(
        "  Average power:    {}",
        or_dash(advanced.average_power.map(|p| format!("{} W", p)))
    );
    println!(
        "  Normalized power: {}",
        or_dash(advanced.normalized_power.map(|p| format!("{} W", p)))
    );
    println!(
        "  Max power:        {}",
        or_dash(snapshot.maximum(MetricKind::Power).map(|p| format!("{:.0} W", p)))
    );
    println!("  IF:               {}", or_dash(advanced.intensity_factor.map(|v| v.to_string())));
    println!("  TSS:              {}", or_dash(advanced.training_stress_score.map(|v| v.to_string())));
    println!(
        "  Average HR:       {}",
        or_dash(advanced.average_heart_rate.map(|hr| format!("{} bpm", hr)))
    );

    println!("{}", "  Time in power zones".bold());
    for (zone, seconds) in snapshot.power_zone_seconds.iter().enumerate() {
        if *seconds > 0 {
            println!("    Z{} {:<20} {} s", zone + 1, ZoneModel::Power.zone_name(zone), seconds);
        }
    }

    println!("{}", "  Laps".bold());
    for lap in &summary.laps {
        println!(
            "    {:<16} {:>4} s  {}",
            lap.step_name,
            lap.duration.as_secs(),
            or_dash(lap.average_power.map(|p| format!("{:.0} W", p)))
        );
    }
}
