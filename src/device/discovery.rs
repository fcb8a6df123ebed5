//! LAN discovery of Broadlink devices.
//!
//! Broadcasts a hello packet on port 80 and collects every reply that
//! arrives before the lookup timeout expires.

use super::protocol;
use super::DeviceError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info};

/// A device that answered the discovery broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub host: SocketAddr,
    pub devtype: u16,
    pub mac: [u8; 6],
}

pub async fn discover(
    local_address: Option<Ipv4Addr>,
    timeout: Duration,
) -> Result<Vec<DiscoveredDevice>, DeviceError> {
    let local = match local_address {
        Some(address) => address,
        None => outbound_address().await?,
    };

    let socket = UdpSocket::bind((local, 0)).await?;
    socket.set_broadcast(true)?;
    let port = socket.local_addr()?.port();

    let hello = protocol::hello_packet(local, port, chrono::Local::now().fixed_offset());
    info!(
        "Looking for Broadlink devices from {}:{} for {:?}",
        local, port, timeout
    );
    socket
        .send_to(&hello, (Ipv4Addr::BROADCAST, 80))
        .await?;

    collect_replies(&socket, Instant::now() + timeout).await
}

/// Reads discovery replies until the deadline, one entry per host.
pub async fn collect_replies(
    socket: &UdpSocket,
    deadline: Instant,
) -> Result<Vec<DiscoveredDevice>, DeviceError> {
    let mut found: Vec<DiscoveredDevice> = Vec::new();
    let mut buf = vec![0u8; 1024];

    while let Ok(received) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
        let (len, from) = received?;
        let Some((devtype, mac)) = protocol::parse_hello_reply(&buf[..len]) else {
            debug!("Ignoring {} byte datagram from {}", len, from);
            continue;
        };

        if found.iter().any(|d| d.host == from) {
            continue;
        }
        debug!("Device type {:#06x} answered from {}", devtype, from);
        found.push(DiscoveredDevice {
            host: from,
            devtype,
            mac,
        });
    }

    Ok(found)
}

/// The address the OS would use for outbound traffic. Connecting a UDP
/// socket sends nothing; it only selects a route.
async fn outbound_address() -> Result<Ipv4Addr, DeviceError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect(("8.8.8.8", 53)).await?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(address) if !address.is_unspecified() => Ok(address),
        other => Err(DeviceError::Protocol(format!(
            "cannot use {} as discovery source address",
            other
        ))),
    }
}
