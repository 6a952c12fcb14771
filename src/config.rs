use std::path::Path;

use serde::Deserialize;

use crate::lorawan::keys::{AppKey, Eui, NwkKey};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub radio: RadioConfig,
    pub cloud: Option<CloudConfig>,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

/// Activation mode for the gateway's own uplink endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Otaa,
    Abp,
}

/// Regional frequency plan. The PHY parameters live in the radio driver; the
/// core only selects among the plans the hardware supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
    Eu868,
    Us915,
    As923,
    Au915,
    In865,
}

impl Region {
    /// Default uplink datarate index used when the config leaves it unset.
    pub fn default_datarate(&self) -> u8 {
        match self {
            Region::Eu868 | Region::As923 | Region::In865 => 5, // SF7BW125
            Region::Us915 | Region::Au915 => 3,                 // SF7BW125 (fixed plans)
        }
    }

    /// Regulatory EIRP ceiling in dBm.
    pub fn max_tx_power(&self) -> u8 {
        match self {
            Region::Eu868 | Region::As923 | Region::In865 => 16,
            Region::Us915 | Region::Au915 => 30,
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Region::Eu868 => "EU868",
            Region::Us915 => "US915",
            Region::As923 => "AS923",
            Region::Au915 => "AU915",
            Region::In865 => "IN865",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Gateway identifier used by the network-server bridge.
    pub gateway_id: String,
    /// This gateway's own end-device identity (hex, 16 chars).
    pub dev_eui: String,
    pub app_eui: String,
    /// Root keys (hex, 32 chars).
    pub app_key: String,
    pub nwk_key: String,
    pub activation: Activation,
    pub region: Region,
    pub datarate: Option<u8>,
    pub tx_power: Option<u8>,
    /// Uplink cadence.
    pub tx_interval_ms: u64,
    /// Confirmed-uplink / join retry budget. 0 means unconfirmed uplinks.
    pub retries: u8,
    pub ack_deadline_ms: u64,
    pub join_timeout_ms: u64,
}

/// Parsed form of the identity fields.
#[derive(Debug, Clone)]
pub struct GatewayIdentity {
    pub dev_eui: Eui,
    pub app_eui: Eui,
    pub app_key: AppKey,
    pub nwk_key: NwkKey,
}

impl GatewayConfig {
    pub fn identity(&self) -> anyhow::Result<GatewayIdentity> {
        Ok(GatewayIdentity {
            dev_eui: parse_eui("gateway.dev_eui", &self.dev_eui)?,
            app_eui: parse_eui("gateway.app_eui", &self.app_eui)?,
            app_key: AppKey::from(parse_key("gateway.app_key", &self.app_key)?),
            nwk_key: NwkKey::from(parse_key("gateway.nwk_key", &self.nwk_key)?),
        })
    }

    pub fn datarate(&self) -> u8 {
        self.datarate.unwrap_or_else(|| self.region.default_datarate())
    }

    pub fn tx_power(&self) -> u8 {
        self.tx_power.unwrap_or_else(|| self.region.max_tx_power()).min(self.region.max_tx_power())
    }
}

#[derive(Debug, Deserialize)]
pub struct RadioConfig {
    /// Local datagram endpoint standing in for the transceiver.
    pub bind: String,
    /// Peer endpoint the radio transmits toward.
    pub peer: String,
    /// Per-tick receive wait budget, capped at 1000 ms.
    pub rx_budget_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    pub base_url: String,
    pub api_key: String,
    pub poll_interval_ms: u64,
    pub queue_capacity: usize,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig {
                gateway_id: "agrimesh-gw-0".to_string(),
                dev_eui: "1111111111111111".to_string(),
                app_eui: "0000000000000001".to_string(),
                app_key: "00000000000000000000000000000000".to_string(),
                nwk_key: "00000000000000000000000000000000".to_string(),
                activation: Activation::Otaa,
                region: Region::Eu868,
                datarate: None,
                tx_power: None,
                tx_interval_ms: 30_000,
                retries: 3,
                ack_deadline_ms: 2_000,
                join_timeout_ms: 6_000,
            },
            radio: RadioConfig {
                bind: "0.0.0.0:1780".to_string(),
                peer: "127.0.0.1:1781".to_string(),
                rx_budget_ms: None,
            },
            cloud: None,
            store: StoreConfig { path: "agrimesh-keys.bin".to_string() },
            logging: LoggingConfig { level: "info".to_string() },
        }
    }
}

fn parse_eui(field: &str, value: &str) -> anyhow::Result<Eui> {
    let bytes = hex::decode(value)
        .map_err(|e| anyhow::anyhow!("{} is not valid hex: {}", field, e))?;
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("{} must be 8 bytes (16 hex chars)", field))?;
    Ok(Eui::from(u64::from_be_bytes(arr)))
}

fn parse_key(field: &str, value: &str) -> anyhow::Result<[u8; 16]> {
    let bytes = hex::decode(value)
        .map_err(|e| anyhow::anyhow!("{} is not valid hex: {}", field, e))?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("{} must be 16 bytes (32 hex chars)", field))
}
