use clap::Parser;
use obd2_telemetry::infrastructure::logging;
use obd2_telemetry::{ConnectionState, Settings, TelemetryEvent, TelemetrySession};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Exit codes for process managers
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(author, about, version)]
struct Options {
    /// Path to the settings file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Advertised device name to connect to, overriding the settings file
    #[arg(long)]
    device_name: Option<String>,

    /// Verbose output (debug-level logging)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();

    let mut settings = Settings::load(options.config.as_deref())?;
    if let Some(name) = options.device_name {
        settings.link.device_name = name;
    }
    if options.verbose {
        settings.log.level = "debug".to_string();
    }
    let _logging_guard = logging::init_logger(&settings.log)?;

    let session = TelemetrySession::spawn(settings.link)?;
    let mut events = session.subscribe();
    session.start_receiving()?;

    let exit_code = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(TelemetryEvent::Loading(message)) => info!("{message}"),
                Ok(TelemetryEvent::Success(record)) => {
                    if record.connection_state == ConnectionState::Disconnected {
                        info!("link closed by peripheral");
                        continue;
                    }
                    println!(
                        "rpm={:.0} speed={:.1} coolant={:.1} oil={:.1} intake={:.1} \
                         load={:.1} boost={:.2} maf={:.1} throttle={:.1} fuel_p={:.2} \
                         fuel_rate={:.2} accel={:.1} brake={:.1} fuel_t={:.1}",
                        record.engine_rpm,
                        record.vehicle_speed,
                        record.engine_coolant_temp,
                        record.engine_oil_temp,
                        record.intake_air_temp,
                        record.load_value,
                        record.boost_pressure,
                        record.mass_air_flow_rate,
                        record.throttle_position,
                        record.fuel_pressure,
                        record.fuel_consumption,
                        record.accelerator_pedal_position,
                        record.brake_pedal_position,
                        record.fuel_temp,
                    );
                }
                Ok(TelemetryEvent::Error(message)) => {
                    eprintln!("error: {message}");
                    break EXIT_ERROR;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "output fell behind the telemetry stream");
                }
                Err(RecvError::Closed) => break EXIT_SUCCESS,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break EXIT_SUCCESS;
            }
        }
    };

    session.shutdown().ok();
    std::process::exit(exit_code);
}
