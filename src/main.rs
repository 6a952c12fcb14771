mod cloud;
mod config;
mod error;
mod gateway;
mod lorawan;
mod mac;
mod mesh;
mod radio;
mod telemetry;

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cloud::CloudClient;
use config::Config;
use gateway::{CloudChannels, Gateway, SupervisorOpts};
use lorawan::keys::KeyStore;
use mac::{MacConfig, MacEngine};
use radio::UdpRadio;
use telemetry::{LoggingActuator, SimulatedField};

#[derive(Parser)]
#[command(name = "agrimesh")]
#[command(about = "LoRaWAN mesh gateway firmware for agricultural sensor networks")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "agrimesh.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("agrimesh v{}", env!("CARGO_PKG_VERSION"));
    info!("===========================================");
    info!("LoRaWAN Mesh Gateway — {}", config.gateway.gateway_id);
    info!("===========================================");

    let identity = config.gateway.identity()?;
    let store_path = PathBuf::from(&config.store.path);
    let mut store = KeyStore::load(&store_path)?;
    // First boot: provision our own endpoint. Re-provisioning would reset
    // the persisted counters, so existing records are left alone.
    if !store.contains(identity.dev_eui) {
        store.store(identity.dev_eui, identity.app_key, identity.nwk_key, identity.app_eui);
    }
    info!(devices = store.device_count(), "key store loaded");

    let mac = MacEngine::new(
        identity.dev_eui,
        identity.app_eui,
        store,
        MacConfig {
            activation: config.gateway.activation,
            retries: config.gateway.retries,
            ack_deadline_ms: config.gateway.ack_deadline_ms,
            join_timeout_ms: config.gateway.join_timeout_ms,
        },
    );

    // The bridge gets its own task and cadence; the supervisor only ever
    // touches the channel ends.
    let cloud_channels = match &config.cloud {
        Some(cloud_config) => {
            let client = CloudClient::new(cloud_config, &config.gateway.gateway_id);
            let (uplink_tx, uplink_rx) = tokio::sync::mpsc::channel(64);
            let (downlink_tx, downlink_rx) = tokio::sync::mpsc::channel(64);
            tokio::spawn(cloud::bridge_task(
                client,
                uplink_rx,
                downlink_tx,
                cloud_config.poll_interval_ms,
                cloud_config.queue_capacity,
            ));
            info!("network-server bridge enabled");
            Some(CloudChannels { uplink_tx, downlink_rx })
        }
        None => {
            info!("network-server bridge not configured");
            None
        }
    };

    let radio = UdpRadio::bind(&config.radio.bind, &config.radio.peer)?;
    let opts = SupervisorOpts::from_config(&config.gateway, &config.radio);

    let mut gateway = Gateway::new(
        radio,
        mac,
        opts,
        Box::new(SimulatedField::default()),
        Box::new(LoggingActuator),
        cloud_channels,
    );
    gateway.init()?;

    tokio::select! {
        result = gateway.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    gateway.mac().store().save(&store_path)?;
    info!("key store persisted");
    Ok(())
}
