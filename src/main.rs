// Command line front end for the scanner gantry
//
// Usage: scanner-motion [--config FILE] [--simulate] [--ports P1,P2,P3] <command>
// Commands: status, home, move-to X Y Z, move-by DX DY DZ, measure-travel,
//           check X Y Z [--relative]
// Example: RUST_LOG=debug scanner-motion --simulate move-to 10 20 5
//
// Every command except `check` connects, runs, and disconnects again.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scanner_motion::config::ScannerConfig;
use scanner_motion::motor::sim::SimConnector;
use scanner_motion::scanner::{Scanner, ScannerError};

#[derive(Parser, Debug)]
#[command(name = "scanner-motion")]
#[command(about = "Home and position the three-axis scanner gantry")]
struct Args {
    /// JSON scanner configuration (built-in gantry defaults otherwise)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Talk to simulated modules instead of serial ports
    #[arg(long)]
    simulate: bool,

    /// Serial ports in axis order, overriding the configuration
    #[arg(long, value_delimiter = ',')]
    ports: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and report every axis
    Status,
    /// Configure the motors and find the reference position
    Home,
    /// Home, then move to an absolute position in mm
    MoveTo {
        #[arg(required = true, allow_negative_numbers = true)]
        point: Vec<f64>,
    },
    /// Home, then move by a distance in mm
    MoveBy {
        #[arg(required = true, allow_negative_numbers = true)]
        deltas: Vec<f64>,
    },
    /// Home, then run every axis into its far endstop and report the travel
    MeasureTravel,
    /// Check a position against the working volume without touching hardware.
    /// Offline, a relative point is taken from the reference position.
    Check {
        #[arg(required = true, allow_negative_numbers = true)]
        point: Vec<f64>,

        #[arg(long)]
        relative: bool,
    },
}

fn load_config(args: &Args) -> Result<ScannerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ScannerConfig::load(path)?,
        None => ScannerConfig::default(),
    };

    if !args.ports.is_empty() {
        if args.ports.len() != config.axes.len() {
            return Err(format!(
                "{} ports given for {} axes",
                args.ports.len(),
                config.axes.len()
            )
            .into());
        }
        for (axis, port) in config.axes.iter_mut().zip(&args.ports) {
            axis.port = port.clone();
        }
    }
    Ok(config)
}

fn home(scanner: &mut Scanner) -> Result<(), ScannerError> {
    scanner.configure_motors()?;
    scanner.find_reference_position()
}

fn run(scanner: &mut Scanner, command: &Command) -> Result<(), ScannerError> {
    match command {
        Command::Status | Command::Check { .. } => {}
        Command::Home => home(scanner)?,
        Command::MoveTo { point } => {
            home(scanner)?;
            scanner.move_to_absolute_position_in_mm(point)?;
        }
        Command::MoveBy { deltas } => {
            home(scanner)?;
            scanner.move_relative_distance_in_mm(deltas)?;
        }
        Command::MeasureTravel => {
            home(scanner)?;
            let travel = scanner.measure_travel()?;
            for (axis, steps) in scanner.axes().iter().zip(&travel) {
                println!(
                    "Axis {}: travel {} steps ({:.4} mm)",
                    axis.index(),
                    steps,
                    axis.steps_to_mm(*steps)
                );
            }
        }
    }

    let actual = scanner.read_actual_steps()?;
    for (axis, steps) in scanner.axes().iter().zip(actual) {
        let state = axis.state();
        println!(
            "Axis {}: {:?}, homed: {}, position: {} steps ({:.4} mm), motion: {:?}",
            axis.index(),
            state.connection,
            state.homed,
            steps,
            axis.steps_to_mm(steps),
            state.motion
        );
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging (set RUST_LOG=debug for per-transaction output)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let mut scanner = if args.simulate {
        info!("Using simulated modules");
        Scanner::with_connector(config, SimConnector::new())?
    } else {
        Scanner::new(config)?
    };

    if let Command::Check { point, relative } = &args.command {
        let allowed = scanner.check_position_in_mm_allowed(point, *relative);
        println!(
            "{:?} mm{}: {}",
            point,
            if *relative { " (relative)" } else { "" },
            if allowed { "allowed" } else { "outside the working volume" }
        );
        return Ok(());
    }

    let mut session = scanner.configured_session()?;
    let result = run(&mut session, &args.command);
    let closed = session.close();
    result?;
    closed?;
    Ok(())
}
