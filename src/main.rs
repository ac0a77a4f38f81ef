//! `losant-device` - run a Losant device from a TOML config file

use losant_mqtt::config::DeviceConfig;
use losant_mqtt::observability::{init_default_logging, init_logging, LogFormat};
use losant_mqtt::protocol::{Command, TopicRouter};
use losant_mqtt::session::{ConnectMode, Device, DeviceEvent, EventKind, Observer, ReconnectPolicy};
use losant_mqtt::{CloseHandle, SessionError, DEFAULT_LOOP_TIMEOUT};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::signal;
use tokio::time::Instant;
use tracing::{error, info, warn, Level};

/// Losant MQTT device client
#[derive(Parser)]
#[command(name = "losant-device")]
#[command(about = "Connect a device to the Losant platform over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "LOSANT_DEVICE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace); ignored when LOG_LEVEL is set
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and log incoming commands until interrupted
    Run,
    /// Connect and report a fixed state periodically until interrupted
    Report {
        /// State to report, as a JSON object
        #[arg(long, value_name = "JSON")]
        state: String,
        /// Seconds between reports
        #[arg(long, default_value_t = 1)]
        interval_secs: u64,
    },
    /// Validate the configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging = match (cli.verbose, std::env::var("LOG_LEVEL").is_ok()) {
        (0, _) | (_, true) => init_default_logging(),
        (1, false) => init_logging(Level::DEBUG, LogFormat::Compact, false),
        (_, false) => init_logging(Level::TRACE, LogFormat::Compact, false),
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialise logging: {e}");
    }

    info!("Starting losant-device v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_device(config).await,
        Commands::Report {
            state,
            interval_secs,
        } => report_state(config, &state, Duration::from_secs(interval_secs)).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<DeviceConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(DeviceConfig::load_from_file(path)?);
    }

    for path_str in ["device.toml", "config/device.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(DeviceConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass one with -c/--config or create device.toml".into())
}

/// Close the session on Ctrl-C
fn close_on_interrupt(close: CloseHandle) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, closing session");
                close.close();
            }
            Err(e) => error!("Unable to listen for interrupt: {}", e),
        }
    });
}

fn logging_observers(device: &mut Device) {
    device.add_event_observer(
        EventKind::Connect,
        Observer::new(|ctx, _| {
            info!(device_id = ctx.device_id(), "Device connected");
            Ok(())
        }),
    );
    device.add_event_observer(
        EventKind::Reconnect,
        Observer::new(|ctx, _| {
            info!(device_id = ctx.device_id(), "Device reconnected");
            Ok(())
        }),
    );
    device.add_event_observer(
        EventKind::Close,
        Observer::new(|ctx, _| {
            info!(device_id = ctx.device_id(), "Device connection closed");
            Ok(())
        }),
    );
    device.add_event_observer(
        EventKind::Command,
        Observer::new(|ctx, event| {
            if let DeviceEvent::Command(command) = event {
                let payload = payload_json(command);
                info!(
                    device_id = ctx.device_id(),
                    command = %command.name,
                    payload = %payload,
                    time = %command.time,
                    "Command received"
                );
            }
            Ok(())
        }),
    );
}

/// Command payload rendered as a JSON object
fn payload_json(command: &Command) -> String {
    Value::Object(command.payload.clone()).to_string()
}

async fn run_device(config: DeviceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut device = Device::from_config(&config)?;
    logging_observers(&mut device);
    close_on_interrupt(device.close_handle());

    info!(device_id = device.device_id(), "Running until interrupted");
    device.connect(ConnectMode::Blocking).await?;
    Ok(())
}

fn parse_state(state: &str) -> Result<Map<String, Value>, Box<dyn std::error::Error>> {
    match serde_json::from_str::<Value>(state)? {
        Value::Object(map) => Ok(map),
        other => Err(format!("state must be a JSON object, got: {other}").into()),
    }
}

async fn report_state(
    config: DeviceConfig,
    state: &str,
    interval: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = parse_state(state)?;
    let mut device = Device::from_config(&config)?;
    logging_observers(&mut device);
    close_on_interrupt(device.close_handle());

    device.connect(ConnectMode::NonBlocking).await?;

    let mut last_sent: Option<Instant> = None;
    while device.state().is_running() {
        match device.run_loop(DEFAULT_LOOP_TIMEOUT).await {
            Ok(()) => {}
            Err(SessionError::Observer(failures)) => {
                warn!("{} observer(s) failed", failures.len());
            }
            Err(e) => return Err(e.into()),
        }

        let due = last_sent.map_or(true, |sent| sent.elapsed() >= interval);
        if device.is_connected() && due {
            device.send_state(state.clone(), None).await?;
            last_sent = Some(Instant::now());
            info!(device_id = device.device_id(), "State reported");
        }
    }

    Ok(())
}

/// How long the reconnect policy keeps trying before giving up
fn describe_reconnect(policy: &ReconnectPolicy) -> String {
    match (policy.max_attempts, policy.max_total_delay()) {
        (Some(attempts), Some(total)) => format!(
            "up to {attempts} attempts, {:.1}s of backoff in total",
            total.as_secs_f64()
        ),
        _ => "retries until closed".to_string(),
    }
}

fn handle_config_command(config: DeviceConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    let connection = config.connection_config()?;

    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
        println!("Broker: {} (port {})", connection.broker_address(), connection.port());
        println!("Reconnect: {}", describe_reconnect(&connection.reconnect));
        println!(
            "Command topic: {}",
            TopicRouter::build_command_topic(&config.device.id)
        );
        println!(
            "State topic: {}",
            TopicRouter::build_state_topic(&config.device.id)
        );
    }

    if let Err(e) = config.identity() {
        warn!("Configuration is valid but credentials are missing: {}", e);
    }

    info!("Configuration validation complete");
    Ok(())
}
