//! ODOMETRY: EKF dead reckoning from velocity, orientation and position-fix logs.
//!
//! Subcommands:
//!
//! - `run`: fuse the logs named in a configuration file and write the trajectory as CSV.
//! - `init-config`: write a configuration file populated with the defaults.
//! - `simulate`: generate synthetic logs, a matching configuration and the ground truth.
use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};

use odometry::analysis::trajectory_errors;
use odometry::config::OdometryConfig;
use odometry::fusion::{FusionEngine, FusionResult};
use odometry::logs::{load_streams, write_position_fixes, write_trajectory};
use odometry::sim::{Scenario, TruthRecord, simulate};
use odometry::stream::SensorKind;

const LONG_ABOUT: &str = "ODOMETRY: Extended Kalman filter dead reckoning for underwater vehicles.

The filter tracks position, depth, heading and body-frame velocities. Velocity sensor readings
(bottom lock) and orientation sensor headings correct a constant-velocity motion model; position
fixes are projected onto a local plane and logged alongside the trajectory for comparison.

Sensor logs are whitespace-delimited numeric tables whose first column is the timestamp; lines
beginning with '%' are comments. All settings live in a TOML/JSON/YAML configuration file, which
`init-config` creates with the default sensor calibration.";

#[derive(Parser)]
#[command(author, version, about = "EKF odometry from multi-rate sensor logs", long_about = LONG_ABOUT)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    #[command(name = "run", about = "Fuse sensor logs into a trajectory")]
    Run(RunArgs),
    #[command(
        name = "init-config",
        about = "Write a configuration file with default settings"
    )]
    InitConfig(InitConfigArgs),
    #[command(
        name = "simulate",
        about = "Generate synthetic sensor logs with ground truth",
        long_about = "Generate synthetic velocity, orientation, position-fix and scan logs for a vehicle on a constant-rate arc, together with truth.csv and a config.toml that points at the generated logs."
    )]
    Simulate(SimulateArgs),
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Configuration file (TOML/JSON/YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Trajectory CSV output path
    #[arg(short, long, default_value = "trajectory.csv")]
    output: PathBuf,

    /// Also write projected position fixes to this CSV
    #[arg(long)]
    fixes: Option<PathBuf>,

    /// Ground truth CSV to report errors against
    #[arg(long)]
    truth: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
struct InitConfigArgs {
    /// Where to write the configuration; the extension selects the format
    path: PathBuf,
}

#[derive(Args, Clone, Debug)]
struct SimulateArgs {
    /// Directory receiving the logs, truth.csv and config.toml
    #[arg(short, long)]
    output_dir: PathBuf,

    /// Scenario file (TOML/JSON/YAML); defaults are used when omitted
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Override the scenario duration (s)
    #[arg(long)]
    duration: Option<f64>,

    /// Override the scenario random seed
    #[arg(long)]
    seed: Option<u64>,
}

fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            buf.timestamp_millis(),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn report(result: &FusionResult, truth: Option<&Path>) -> Result<(), Box<dyn Error>> {
    if let Some(last) = &result.final_estimate {
        info!(
            "Final state {}",
            odometry::VehicleState::try_from(&last.state)?
        );
    }
    let Some(path) = truth else {
        return Ok(());
    };
    let truth = TruthRecord::from_csv(path)?;
    for (name, summary) in trajectory_errors(&result.trajectory, &truth) {
        info!(
            "{name:>6} error: rms {:.3}, mean {:.3}, max {:.3} over {} samples",
            summary.rms, summary.mean, summary.max_abs, summary.samples
        );
    }
    Ok(())
}

fn run(args: &RunArgs) -> Result<(), Box<dyn Error>> {
    let config = OdometryConfig::load(&args.config)?;
    info!("Loaded configuration from {}", args.config.display());
    let mut mux = load_streams(&config.logs, config.fusion.exhaustion_policy)?;
    let result = FusionEngine::new(&config)?.run(&mut mux)?;
    if result.trajectory.is_empty() {
        warn!("No corrections were applied; the trajectory is empty");
    }
    write_trajectory(&result.trajectory, &args.output)?;
    info!(
        "Wrote {} trajectory rows to {}",
        result.trajectory.len(),
        args.output.display()
    );
    if let Some(path) = &args.fixes {
        write_position_fixes(&result.position_fixes, path)?;
        info!("Wrote {} position fixes to {}", result.position_fixes.len(), path.display());
    }
    report(&result, args.truth.as_deref())
}

fn init_config(args: &InitConfigArgs) -> Result<(), Box<dyn Error>> {
    OdometryConfig::default().to_file(&args.path)?;
    info!("Wrote default configuration to {}", args.path.display());
    Ok(())
}

fn load_scenario(path: &Path) -> Result<Scenario, Box<dyn Error>> {
    let text = std::fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase());
    let scenario: Scenario = match ext.as_deref() {
        Some("json") => serde_json::from_str(&text)?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&text)?,
        Some("toml") => toml::from_str(&text)?,
        _ => return Err(format!("unsupported scenario file {}", path.display()).into()),
    };
    Ok(scenario)
}

fn simulate_logs(args: &SimulateArgs) -> Result<(), Box<dyn Error>> {
    let mut scenario = match &args.scenario {
        Some(path) => load_scenario(path)?,
        None => Scenario::default(),
    };
    if let Some(duration) = args.duration {
        scenario.duration = duration;
    }
    if let Some(seed) = args.seed {
        scenario.seed = seed;
    }

    let mut config = OdometryConfig::default();
    let logs = simulate(&scenario, &config)?;
    let written = logs.write_to(&args.output_dir, config.logs.delimiter)?;
    // Paths in the config are relative to the config file itself.
    for kind in SensorKind::ALL {
        if let Some(name) = written.path(kind).and_then(|p| p.file_name()) {
            config.logs.set_path(kind, PathBuf::from(name));
        }
    }
    let config_path = args.output_dir.join("config.toml");
    config.to_file(&config_path)?;
    info!(
        "Run `odometry run --config {} --truth {}` to fuse the synthetic logs",
        config_path.display(),
        args.output_dir.join("truth.csv").display()
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    if let Err(e) = init_logger(&cli.log_level, cli.log_file.as_ref()) {
        eprintln!("Failed to initialize logger: {}", e);
    }

    let outcome = match &cli.command {
        Command::Run(args) => run(args),
        Command::InitConfig(args) => init_config(args),
        Command::Simulate(args) => simulate_logs(args),
    };
    if let Err(e) = &outcome {
        error!("{e}");
    }
    outcome
}
