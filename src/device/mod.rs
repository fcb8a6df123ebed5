//! # Device Adapter
//!
//! Abstraction over the single Broadlink device the bridge talks to.
//!
//! ```text
//! device/
//! ├── protocol.rs   - packet framing, checksums, AES-CBC payloads
//! ├── broadlink.rs  - UDP client for a real device
//! ├── discovery.rs  - LAN broadcast lookup
//! └── simulated.rs  - the `test` device type
//! ```
//!
//! Devices differ in what they can do: RM remotes learn and send IR and
//! report temperature, A1 sensors only report temperature, SP/MP plugs are
//! switch-only. Operations outside a device's [`Capabilities`] fail with
//! [`DeviceError::Unsupported`].
//!
//! The device cannot serve concurrent requests, so it is shared behind a
//! tokio mutex ([`SharedDevice`]) and every caller holds the lock for the
//! full duration of its exchange.

pub mod broadlink;
pub mod discovery;
pub mod protocol;
pub mod simulated;

use crate::config::{DeviceConfig, DeviceSelection};
use crate::signal::Signal;
use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use broadlink::BroadlinkDevice;
use simulated::SimulatedDevice;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("{device} device does not support {capability}")]
    Unsupported {
        device: DeviceKind,
        capability: &'static str,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("device did not answer within {0:?}")]
    Timeout(Duration),

    #[error("device returned error status {0:#06x}")]
    Status(u16),

    #[error("malformed device reply: {0}")]
    Protocol(String),

    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    pub fn unsupported(device: DeviceKind, capability: &'static str) -> Self {
        DeviceError::Unsupported { device, capability }
    }
}

/// Device families understood by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Rm,
    A1,
    Sp1,
    Sp2,
    Mp1,
    Test,
}

impl DeviceKind {
    /// Maps the type code from a discovery reply to a device family.
    pub fn from_devtype(devtype: u16) -> Option<Self> {
        match devtype {
            0x0000 => Some(DeviceKind::Sp1),
            0x2711 | 0x2719 | 0x7919 | 0x271a | 0x791a | 0x2720 | 0x753e | 0x7d00 | 0x947a
            | 0x9479 | 0x2728 | 0x2733 | 0x273e | 0x7530 | 0x7918 | 0x2736 => Some(DeviceKind::Sp2),
            0x2712 | 0x2737 | 0x273d | 0x2783 | 0x277c | 0x272a | 0x2787 | 0x278b | 0x278f
            | 0x27c2 | 0x27d1 | 0x27de | 0x5f36 => Some(DeviceKind::Rm),
            0x2714 => Some(DeviceKind::A1),
            0x4eb5 | 0x4ef7 => Some(DeviceKind::Mp1),
            _ => None,
        }
    }

    pub fn capabilities(self) -> Capabilities {
        match self {
            DeviceKind::Rm => Capabilities {
                learning: true,
                temperature: true,
            },
            DeviceKind::A1 | DeviceKind::Test => Capabilities {
                learning: false,
                temperature: true,
            },
            DeviceKind::Sp1 | DeviceKind::Sp2 | DeviceKind::Mp1 => Capabilities::default(),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Rm => write!(f, "rm"),
            DeviceKind::A1 => write!(f, "a1"),
            DeviceKind::Sp1 => write!(f, "sp1"),
            DeviceKind::Sp2 => write!(f, "sp2"),
            DeviceKind::Mp1 => write!(f, "mp1"),
            DeviceKind::Test => write!(f, "test"),
        }
    }
}

/// What a device can do beyond authenticating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Learn and send IR signals
    pub learning: bool,
    /// Report ambient temperature
    pub temperature: bool,
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.learning, self.temperature) {
            (true, true) => write!(f, "learning, temperature"),
            (true, false) => write!(f, "learning"),
            (false, true) => write!(f, "temperature"),
            (false, false) => write!(f, "switch only"),
        }
    }
}

/// Operations the bridge needs from an IR-capable device.
///
/// Every method except [`IrDevice::authenticate`] defaults to
/// [`DeviceError::Unsupported`] so that implementations only provide what
/// their hardware supports.
#[async_trait]
pub trait IrDevice: Send {
    fn kind(&self) -> DeviceKind;

    /// Human readable address for logs
    fn host(&self) -> String;

    fn capabilities(&self) -> Capabilities {
        self.kind().capabilities()
    }

    /// Must succeed once before any other operation.
    async fn authenticate(&mut self) -> Result<(), DeviceError>;

    /// Arms the device to capture the next IR pulse it sees.
    async fn enter_learning(&mut self) -> Result<(), DeviceError> {
        Err(DeviceError::unsupported(self.kind(), "learning"))
    }

    /// Non-blocking check for a signal captured since `enter_learning`.
    async fn poll_captured_signal(&mut self) -> Result<Option<Signal>, DeviceError> {
        Err(DeviceError::unsupported(self.kind(), "learning"))
    }

    async fn send(&mut self, _signal: &Signal) -> Result<(), DeviceError> {
        Err(DeviceError::unsupported(self.kind(), "sending"))
    }

    async fn read_temperature(&mut self) -> Result<f32, DeviceError> {
        Err(DeviceError::unsupported(self.kind(), "temperature"))
    }
}

/// The one device handle, shared by the dispatcher and the temperature poller.
pub type SharedDevice = Arc<Mutex<Box<dyn IrDevice>>>;

pub fn share(device: Box<dyn IrDevice>) -> SharedDevice {
    Arc::new(Mutex::new(device))
}

/// Resolves the configured device, authenticates it and returns the handle.
///
/// Any failure here is fatal for the bridge.
pub async fn connect(config: &DeviceConfig) -> Result<Box<dyn IrDevice>> {
    let timeout = Duration::from_secs(config.timeout);

    let mut device: Box<dyn IrDevice> = match config.selection()? {
        DeviceSelection::Lookup => {
            let lookup_timeout = Duration::from_secs(config.lookup_timeout);
            let found = discovery::discover(config.local_address, lookup_timeout)
                .await
                .map_err(|e| eyre!("Broadlink discovery failed: {}", e))?;

            let target = match found.as_slice() {
                [] => {
                    error!("No Broadlink device found");
                    return Err(eyre!("No Broadlink device found"));
                }
                [single] => single.clone(),
                many => {
                    let hosts: Vec<String> = many.iter().map(|d| d.host.to_string()).collect();
                    error!("More than one Broadlink device found ({})", hosts.join(", "));
                    return Err(eyre!(
                        "More than one Broadlink device found ({})",
                        hosts.join(", ")
                    ));
                }
            };

            let kind = DeviceKind::from_devtype(target.devtype).ok_or_else(|| {
                eyre!(
                    "Unsupported Broadlink device type {:#06x} at {}",
                    target.devtype,
                    target.host
                )
            })?;
            debug!("Discovered {} device at {}", kind, target.host);
            Box::new(BroadlinkDevice::connect(kind, target.host, target.mac, timeout).await?)
        }
        DeviceSelection::Test => Box::new(SimulatedDevice::default()),
        DeviceSelection::Fixed { kind, host, mac } => {
            let host = resolve_host(&host).await?;
            Box::new(BroadlinkDevice::connect(kind, host, mac, timeout).await?)
        }
    };

    if let Err(e) = device.authenticate().await {
        return Err(eyre!(
            "Failed to authenticate {} device at {}: {}",
            device.kind(),
            device.host(),
            e
        ));
    }

    info!(
        "Connected to {} Broadlink device at {} ({})",
        device.kind(),
        device.host(),
        device.capabilities()
    );
    Ok(device)
}

async fn resolve_host(host: &str) -> Result<SocketAddr> {
    let target = if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:80", host)
    };

    let mut addresses = tokio::net::lookup_host(target.as_str())
        .await
        .map_err(|e| eyre!("Failed to resolve device host {}: {}", target, e))?;
    let address = addresses.find(SocketAddr::is_ipv4);
    address.ok_or_else(|| eyre!("Device host {} has no IPv4 address", target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_codes_map_to_families() {
        assert_eq!(DeviceKind::from_devtype(0x2737), Some(DeviceKind::Rm));
        assert_eq!(DeviceKind::from_devtype(0x2712), Some(DeviceKind::Rm));
        assert_eq!(DeviceKind::from_devtype(0x2714), Some(DeviceKind::A1));
        assert_eq!(DeviceKind::from_devtype(0x0000), Some(DeviceKind::Sp1));
        assert_eq!(DeviceKind::from_devtype(0x2711), Some(DeviceKind::Sp2));
        assert_eq!(DeviceKind::from_devtype(0x4eb5), Some(DeviceKind::Mp1));
        assert_eq!(DeviceKind::from_devtype(0xdead), None);
    }

    #[test]
    fn only_rm_can_learn() {
        assert!(DeviceKind::Rm.capabilities().learning);
        for kind in [DeviceKind::A1, DeviceKind::Sp1, DeviceKind::Sp2, DeviceKind::Mp1, DeviceKind::Test] {
            assert!(!kind.capabilities().learning, "{kind} should not learn");
        }
        assert!(!DeviceKind::Sp2.capabilities().temperature);
        assert!(DeviceKind::Test.capabilities().temperature);
    }

    #[tokio::test]
    async fn default_operations_are_unsupported() {
        let mut device = SimulatedDevice::default();
        assert!(matches!(
            device.enter_learning().await,
            Err(DeviceError::Unsupported { capability: "learning", .. })
        ));
        assert!(matches!(
            device.send(&Signal::new(vec![1])).await,
            Err(DeviceError::Unsupported { capability: "sending", .. })
        ));
    }

    #[tokio::test]
    async fn test_device_type_connects_without_network() {
        let config = DeviceConfig {
            device_type: "test".to_string(),
            ..DeviceConfig::default()
        };

        let mut device = connect(&config).await.unwrap();
        assert_eq!(device.kind(), DeviceKind::Test);
        assert_eq!(device.read_temperature().await.unwrap(), 23.5);
    }

    #[tokio::test]
    async fn host_without_port_defaults_to_80() {
        let addr = resolve_host("127.0.0.1").await.unwrap();
        assert_eq!(addr.port(), 80);

        let addr = resolve_host("127.0.0.1:8080").await.unwrap();
        assert_eq!(addr.port(), 8080);
    }
}
