//! pump-bridge - command line entry point
//!
//! Runs the pump state store against a broker, or performs a single store
//! action and prints the resulting state.

use clap::{Args, Parser, Subcommand, ValueEnum};
use pump_bridge::config::BridgeConfig;
use pump_bridge::observability::init_default_logging;
use pump_bridge::protocol::SwitchState;
use pump_bridge::store::SensorStore;
use pump_bridge::transport::mqtt::MqttClient;
use std::path::{Path, PathBuf};
use std::process;
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info, warn, Level};

/// Default configuration file locations, searched in order
const DEFAULT_CONFIG_PATHS: &[&str] = &["pump-bridge.toml", "config/pump-bridge.toml"];

/// Time given to the event loop to flush a one-shot publish before disconnecting
const FLUSH_DELAY_MS: u64 = 250;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// MQTT bridge for a water pump controller
#[derive(Parser)]
#[command(name = "pump-bridge")]
#[command(about = "MQTT bridge and state store for a water pump controller")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SwitchArg {
    On,
    Off,
}

impl From<SwitchArg> for SwitchState {
    fn from(arg: SwitchArg) -> Self {
        match arg {
            SwitchArg::On => SwitchState::On,
            SwitchArg::Off => SwitchState::Off,
        }
    }
}

#[derive(Args, Clone, Copy)]
struct SettleArgs {
    /// Wait for retained state before acting, in milliseconds
    #[arg(long, default_value_t = 1500)]
    settle_ms: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and track state until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Toggle the pump once
    TogglePump(SettleArgs),
    /// Toggle auto mode once
    ToggleAutoMode(SettleArgs),
    /// Command the pump on or off
    SetPump {
        #[arg(value_enum)]
        state: SwitchArg,
        #[command(flatten)]
        settle: SettleArgs,
    },
    /// Command auto mode on or off
    SetAutoMode {
        #[arg(value_enum)]
        state: SwitchArg,
        #[command(flatten)]
        settle: SettleArgs,
    },
    /// Set the auto-mode threshold, percent
    SetAutoLevel {
        level: f64,
        #[command(flatten)]
        settle: SettleArgs,
    },
}

fn verbosity_level(verbose: u8) -> Option<Level> {
    match verbose {
        0 => None,
        1 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(verbosity_level(cli.verbose));

    info!("Starting pump-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::TogglePump(settle) => {
            one_shot(config, settle, |store| async move {
                store.toggle_pump().await;
                Ok(())
            })
            .await
        }
        Commands::ToggleAutoMode(settle) => {
            one_shot(config, settle, |store| async move {
                store.toggle_auto_mode().await;
                Ok(())
            })
            .await
        }
        Commands::SetPump { state, settle } => {
            one_shot(config, settle, move |store| async move {
                store.set_pump(state.into()).await;
                Ok(())
            })
            .await
        }
        Commands::SetAutoMode { state, settle } => {
            one_shot(config, settle, move |store| async move {
                store.set_auto_mode(state.into()).await;
                Ok(())
            })
            .await
        }
        Commands::SetAutoLevel { level, settle } => {
            one_shot(config, settle, move |store| async move {
                store.set_auto_level(level).await?;
                Ok(())
            })
            .await
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> CliResult<BridgeConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(path)?);
        }
    }

    Err(format!(
        "No configuration file found. Provide one with -c/--config or create one of {DEFAULT_CONFIG_PATHS:?}"
    )
    .into())
}

async fn connect_store(config: &BridgeConfig) -> CliResult<SensorStore<MqttClient>> {
    let transport = MqttClient::new(config.mqtt.clone())?;
    let store = SensorStore::from_config(config);
    store.setup_mqtt(transport).await;
    Ok(store)
}

async fn run_bridge(config: BridgeConfig) -> CliResult<()> {
    info!(broker = %config.mqtt.broker_url, policy = ?config.store.control_policy, "Bridge starting");

    let store = connect_store(&config).await?;

    let mut state_rx = store.watch();
    let logger = tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow_and_update().clone();
            info!(
                water_level = state.water_level,
                pump = %state.pump.current(),
                pump_pending = state.pump.is_pending(),
                auto_mode = %state.auto_mode.current(),
                auto_level = state.auto_level,
                "State changed"
            );
        }
    });

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Bridge is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = monitor_connection_health(&store) => {
            error!("MQTT connection permanently lost, shutting down...");
        }
    }

    logger.abort();
    store.teardown().await;
    Ok(())
}

async fn one_shot<F, Fut>(config: BridgeConfig, settle: SettleArgs, action: F) -> CliResult<()>
where
    F: FnOnce(SensorStore<MqttClient>) -> Fut,
    Fut: std::future::Future<Output = CliResult<()>>,
{
    let store = connect_store(&config).await?;

    sleep(Duration::from_millis(settle.settle_ms)).await;

    let result = action(store.clone()).await;
    sleep(Duration::from_millis(FLUSH_DELAY_MS)).await;

    if result.is_ok() {
        println!("{}", serde_json::to_string_pretty(&store.snapshot())?);
    }

    store.teardown().await;
    result
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> CliResult<()> {
    if config.mqtt.require_username()?.is_some() && config.mqtt.password().is_none() {
        warn!("MQTT username is set but no password was found in the environment");
    }

    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

/// Resolve once the transport gives up reconnecting
async fn monitor_connection_health(store: &SensorStore<MqttClient>) {
    loop {
        if store.bridge().is_permanently_disconnected().await {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
}
