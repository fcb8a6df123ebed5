//! Bridge configuration.
//!
//! Loaded once at startup from a TOML file and validated before anything
//! else runs. Every key has a default except the device address, which is
//! required when a fixed device type is configured.
//!
//! ```toml
//! temperature_interval = 60
//!
//! [mqtt]
//! broker = "10.0.0.2"
//! username = "bridge"
//! password = "secret"
//!
//! [device]
//! device_type = "rm"
//! device_host = "10.0.0.40"
//! device_mac = "34:ea:34:aa:bb:cc"
//! ```

use crate::device::DeviceKind;
use crate::dispatch::LearnSettings;
use crate::mqtt::config::MqttConfig;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable pointing at the configuration file.
pub const CONFIG_ENV: &str = "BROADLINKMQTTCONFIG";
const CONFIG_DIR: &str = "broadlink-mqtt";
const CONFIG_FILE: &str = "mqtt.toml";
const COMMANDS_DIR: &str = "commands";
/// Upper bound for every interval given in seconds, one week.
const MAX_INTERVAL: u64 = 7 * 24 * 60 * 60;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Log filter used when `RUST_LOG` is not set
    pub log_level: String,
    /// Where learned signals are stored, relative to the config file
    pub commands_dir: PathBuf,
    /// Seconds between temperature reports, 0 disables them
    pub temperature_interval: u64,
    pub mqtt: MqttConfig,
    pub device: DeviceConfig,
    pub learning: LearningConfig,

    #[serde(skip)]
    base_dir: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            commands_dir: PathBuf::from(COMMANDS_DIR),
            temperature_interval: 0,
            mqtt: MqttConfig::default(),
            device: DeviceConfig::default(),
            learning: LearningConfig::default(),
            base_dir: PathBuf::from("."),
        }
    }
}

/// The `[device]` table.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// `lookup`, `test`, `rm`, `sp1`, `sp2`, `a1` or `mp1`
    pub device_type: String,
    /// Source address for discovery broadcasts
    pub local_address: Option<Ipv4Addr>,
    /// Seconds to wait for discovery replies
    pub lookup_timeout: u64,
    pub device_host: Option<String>,
    pub device_mac: Option<String>,
    /// Seconds to wait for a reply to a single request
    pub timeout: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_type: "lookup".to_string(),
            local_address: None,
            lookup_timeout: 20,
            device_host: None,
            device_mac: None,
            timeout: 10,
        }
    }
}

/// How the device is found at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelection {
    Lookup,
    Test,
    Fixed {
        kind: DeviceKind,
        host: String,
        mac: [u8; 6],
    },
}

impl DeviceConfig {
    pub fn selection(&self) -> Result<DeviceSelection> {
        let kind = match self.device_type.as_str() {
            "lookup" => return Ok(DeviceSelection::Lookup),
            "test" => return Ok(DeviceSelection::Test),
            "rm" => DeviceKind::Rm,
            "sp1" => DeviceKind::Sp1,
            "sp2" => DeviceKind::Sp2,
            "a1" => DeviceKind::A1,
            "mp1" => DeviceKind::Mp1,
            other => return Err(eyre!("Incorrect device configured: {}", other)),
        };

        let host = self
            .device_host
            .clone()
            .ok_or_else(|| eyre!("Configuration parameter 'device.device_host' should be specified"))?;
        let mac = self
            .device_mac
            .as_deref()
            .ok_or_else(|| eyre!("Configuration parameter 'device.device_mac' should be specified"))?;

        Ok(DeviceSelection::Fixed {
            kind,
            host,
            mac: parse_mac(mac)?,
        })
    }
}

/// Parses `aa:bb:cc:dd:ee:ff` (colons or dashes optional).
pub fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let digits: String = text.chars().filter(|c| !matches!(c, ':' | '-')).collect();
    let bytes = hex::decode(&digits).map_err(|e| eyre!("Invalid device MAC '{}': {}", text, e))?;
    bytes
        .try_into()
        .map_err(|_| eyre!("Invalid device MAC '{}': expected 6 bytes", text))
}

/// The `[learning]` table.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LearningConfig {
    /// Seconds between checks for a captured signal
    pub poll_interval: u64,
    pub max_attempts: u32,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            poll_interval: 5,
            max_attempts: 6,
        }
    }
}

impl BridgeConfig {
    /// `$BROADLINKMQTTCONFIG`, else `<config dir>/broadlink-mqtt/mqtt.toml`.
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| eyre!("Cannot determine the user configuration directory"))?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Cannot load configuration from file {}: {}", path.display(), e))?;

        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&content, base_dir)
    }

    pub fn parse(content: &str, base_dir: PathBuf) -> Result<Self> {
        let mut config: BridgeConfig =
            toml::from_str(content).map_err(|e| eyre!("Failed to parse configuration: {}", e))?;
        config.base_dir = base_dir;
        config.validate()?;
        debug!("Configuration loaded: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.mqtt.validate()?;
        self.device.selection()?;
        if self.learning.max_attempts == 0 {
            return Err(eyre!("learning.max_attempts must be at least 1"));
        }
        for (key, seconds) in [
            ("temperature_interval", self.temperature_interval),
            ("learning.poll_interval", self.learning.poll_interval),
            ("device.timeout", self.device.timeout),
            ("device.lookup_timeout", self.device.lookup_timeout),
        ] {
            if seconds > MAX_INTERVAL {
                return Err(eyre!(
                    "{} must be at most {} seconds, got {}",
                    key,
                    MAX_INTERVAL,
                    seconds
                ));
            }
        }
        Ok(())
    }

    pub fn commands_dir(&self) -> PathBuf {
        self.base_dir.join(&self.commands_dir)
    }

    pub fn temperature_interval(&self) -> Option<Duration> {
        (self.temperature_interval > 0).then(|| Duration::from_secs(self.temperature_interval))
    }

    pub fn learn_settings(&self) -> LearnSettings {
        LearnSettings {
            poll_interval: Duration::from_secs(self.learning.poll_interval),
            max_attempts: self.learning.max_attempts,
        }
    }
}
