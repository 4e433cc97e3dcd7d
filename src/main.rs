use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kinesis_tracker::config::{DEFAULT_CONFIG_PATH, TOPIC_CMD_TRACKER, TrackerConfig};
use kinesis_tracker::messages::{Axis, TrackerCommand};
use kinesis_tracker::runtime::{self, BoxError};
use kinesis_tracker::stage::{self, SimulatedController, Stage, StageError};

#[derive(Parser)]
#[command(name = "kinesis-tracker", about = "Sun tracking on Thorlabs APT rotation stages")]
struct Cli {
    /// Tracker configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List APT controllers on the serial ports
    Devices,
    /// Home both stages and follow the target until stopped
    Track,
    /// Home one stage
    Home { serial: String },
    /// Move one stage to an absolute angle in degrees
    Move { serial: String, degrees: f64 },
    /// Print a stage's position in degrees
    Position { serial: String },
    /// Print a stage's status bits, position and velocity
    Status { serial: String },
    /// Stop a stage immediately
    Stop { serial: String },
    /// Blink a controller's front panel LED
    Identify { serial: String },
    /// Nudge a running tracker's offset
    Offset {
        #[arg(value_enum)]
        axis: Axis,
        /// Degrees to add to the current offset
        #[arg(allow_hyphen_values = true)]
        delta: f64,
    },
    /// Ask a running tracker to stop
    Halt,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init(); // installs the subscriber globally

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), BoxError> {
    let config = TrackerConfig::load_or_default(&cli.config)?;

    match cli.command {
        Command::Devices => {
            let devices = tokio::task::spawn_blocking(stage::list_devices).await??;
            if devices.is_empty() {
                println!("No APT controllers found");
            }
            for d in devices {
                println!(
                    "{}  serial {}  {}  {} channel(s)  firmware {}",
                    d.port, d.serial, d.model, d.channels, d.firmware
                );
            }
        }
        Command::Track => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received, stopping");
                    on_signal.cancel();
                }
            });
            runtime::run(config, cancel).await?;
        }
        Command::Home { serial } => {
            with_stage(&config, serial, |stage| {
                stage.initialize()?;
                stage.home()?;
                println!("Homed at {:.4}°", stage.position()?);
                Ok(())
            })
            .await?;
        }
        Command::Move { serial, degrees } => {
            with_stage(&config, serial, move |stage| {
                stage.initialize()?;
                let settled = stage.move_absolute(degrees)?;
                println!("Settled at {:.4}°", settled);
                Ok(())
            })
            .await?;
        }
        Command::Position { serial } => {
            with_stage(&config, serial, |stage| {
                println!("{:.4}°", stage.position()?);
                Ok(())
            })
            .await?;
        }
        Command::Status { serial } => {
            with_stage(&config, serial, |stage| {
                let status = stage.status()?;
                let scale = stage.settings().scale;
                println!("Position: {:.4}°", scale.to_degrees(status.counts));
                println!("Velocity: {:.4}°/s", scale.velocity_to_deg_per_s(status.velocity));
                println!("Moving:   {}", status.is_moving());
                println!("Status:   {:?}", status.status);
                Ok(())
            })
            .await?;
        }
        Command::Stop { serial } => {
            with_stage(&config, serial, |stage| stage.stop()).await?;
        }
        Command::Identify { serial } => {
            with_stage(&config, serial, |stage| stage.identify()).await?;
        }
        Command::Offset { axis, delta } => {
            send_command(TrackerCommand::Nudge {
                axis,
                delta_deg: delta,
            })
            .await?;
        }
        Command::Halt => {
            send_command(TrackerCommand::StopTracking).await?;
        }
    }

    Ok(())
}

/// Open one stage on a blocking thread and run `op` against it
async fn with_stage<F>(config: &TrackerConfig, serial: String, op: F) -> Result<(), BoxError>
where
    F: FnOnce(&mut Stage) -> Result<(), StageError> + Send + 'static,
{
    let settings = config.settings_for_serial(&serial);
    let simulate = config.simulate;

    tokio::task::spawn_blocking(move || {
        let mut stage = if simulate {
            let number = serial.parse().unwrap_or_default();
            Stage::with_link(&serial, Box::new(SimulatedController::new(number)), settings)
        } else {
            Stage::open(&serial, settings)?
        };
        let result = op(&mut stage);
        stage.close();
        result
    })
    .await??;
    Ok(())
}

async fn send_command(cmd: TrackerCommand) -> Result<(), BoxError> {
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_TRACKER).await?;
    publisher.put(serde_json::to_string(&cmd)?).await?;
    info!("Sent {:?} on {}", cmd, TOPIC_CMD_TRACKER);
    session.close().await?;
    Ok(())
}
