pub mod config;
pub mod device;
pub mod dispatch;
pub mod mqtt;
pub mod persistence;
pub mod signal;
pub mod temperature;

use crate::config::BridgeConfig;
use crate::dispatch::CommandDispatcher;
use crate::mqtt::{MqttSession, TopicLayout};
use crate::persistence::SignalStore;
use crate::temperature::TemperaturePoller;
use color_eyre::Result;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Commands waiting for the dispatcher while a recording is in flight.
const COMMAND_QUEUE: usize = 100;

/// Exit status for configuration and device failures.
const STARTUP_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = setup() {
        eprintln!("Failed to install error reporting: {}", e);
        return ExitCode::from(STARTUP_FAILURE);
    }

    let config = match load_config().await {
        Ok(config) => {
            setup_logging(&config.log_level);
            config
        }
        Err(e) => {
            setup_logging("info");
            error!("{:?}", e);
            return ExitCode::from(STARTUP_FAILURE);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:?}", e);
            ExitCode::from(STARTUP_FAILURE)
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

async fn load_config() -> Result<BridgeConfig> {
    let path = BridgeConfig::config_path()?;
    BridgeConfig::load(&path).await
}

async fn run(config: BridgeConfig) -> Result<()> {
    let device = device::connect(&config.device).await?;
    let capabilities = device.capabilities();
    let device = device::share(device);

    let shutdown = CancellationToken::new();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (session, publisher) = MqttSession::create(&config.mqtt, command_tx);

    let store = SignalStore::new(config.commands_dir());
    info!("Storing learned commands in {}", store.root().display());
    let dispatcher = CommandDispatcher::new(store, device.clone(), config.learn_settings());
    let dispatcher_task = tokio::spawn(dispatcher.run(command_rx, shutdown.clone()));

    let poller_task = temperature::effective_interval(config.temperature_interval(), capabilities)
        .map(|period| {
            TemperaturePoller::new(
                device.clone(),
                Arc::new(publisher),
                TopicLayout::new(config.mqtt.topic_prefix.clone()).temperature_topic(),
                period,
                config.mqtt.qos(),
                config.mqtt.retain,
            )
            .spawn(shutdown.clone())
        });

    info!(
        "Broadlink bridge listening on {}#",
        config.mqtt.topic_prefix
    );

    tokio::select! {
        _ = session.run_forever() => {}
        signal = shutdown_signal() => {
            signal?;
            info!("Shutdown requested");
        }
    }

    shutdown.cancel();
    if let Err(e) = dispatcher_task.await {
        error!("Command dispatcher ended abnormally: {}", e);
    }
    if let Some(task) = poller_task {
        if let Err(e) = task.await {
            error!("Temperature poller ended abnormally: {}", e);
        }
    }

    info!("Broadlink bridge stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}
