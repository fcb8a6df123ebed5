use super::protocol::{self, RequestOp, Response, Session};
use super::{DeviceError, DeviceKind, IrDevice};
use crate::signal::Signal;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// UDP client for a single Broadlink device.
///
/// Holds the session key negotiated by [`IrDevice::authenticate`] and the
/// packet counter, which is why every operation needs `&mut self`.
pub struct BroadlinkDevice {
    kind: DeviceKind,
    host: SocketAddr,
    mac: [u8; 6],
    session: Session,
    count: u16,
    timeout: Duration,
    socket: UdpSocket,
}

impl BroadlinkDevice {
    pub async fn connect(
        kind: DeviceKind,
        host: SocketAddr,
        mac: [u8; 6],
        timeout: Duration,
    ) -> Result<Self, DeviceError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        debug!(
            "Opened socket {} for {} device at {}",
            socket.local_addr()?,
            kind,
            host
        );

        Ok(Self {
            kind,
            host,
            mac,
            session: Session::default(),
            count: rand::random(),
            timeout,
            socket,
        })
    }

    /// Sends one request and waits for the matching reply.
    async fn exchange(&mut self, command: u8, payload: &[u8]) -> Result<Response, DeviceError> {
        self.count = self.count.wrapping_add(1);
        let packet = protocol::encode_packet(&self.session, &self.mac, self.count, command, payload)?;
        self.socket.send_to(&packet, self.host).await?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; 2048];
        loop {
            let (len, from) = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| DeviceError::Timeout(self.timeout))??;

            if from.ip() != self.host.ip() {
                debug!("Ignoring {} byte datagram from {}", len, from);
                continue;
            }

            return protocol::decode_response(&self.session.key, &buf[..len]);
        }
    }

    async fn request(&mut self, op: RequestOp, data: &[u8]) -> Result<Response, DeviceError> {
        let payload = protocol::request_payload(op, data);
        self.exchange(protocol::CMD_REQUEST, &payload).await
    }

    fn require_learning(&self) -> Result<(), DeviceError> {
        if self.capabilities().learning {
            Ok(())
        } else {
            Err(DeviceError::unsupported(self.kind, "learning"))
        }
    }
}

#[async_trait]
impl IrDevice for BroadlinkDevice {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn host(&self) -> String {
        self.host.to_string()
    }

    async fn authenticate(&mut self) -> Result<(), DeviceError> {
        info!("Authenticating with {} device at {}", self.kind, self.host);
        self.session = Session::default();

        let reply = self
            .exchange(protocol::CMD_AUTH, &protocol::auth_payload())
            .await?;
        if reply.status != 0 {
            return Err(DeviceError::Auth(format!(
                "device rejected authentication with status {:#06x}",
                reply.status
            )));
        }

        self.session = protocol::parse_auth_reply(&reply.payload)?;
        debug!("Authenticated, session id {:02x?}", self.session.id);
        Ok(())
    }

    async fn enter_learning(&mut self) -> Result<(), DeviceError> {
        self.require_learning()?;
        self.request(RequestOp::EnterLearning, &[]).await?.ensure_ok()?;
        Ok(())
    }

    async fn poll_captured_signal(&mut self) -> Result<Option<Signal>, DeviceError> {
        self.require_learning()?;
        let reply = self.request(RequestOp::CheckData, &[]).await?;
        if reply.status != 0 {
            debug!("No signal captured yet (status {:#06x})", reply.status);
            return Ok(None);
        }
        Ok(protocol::captured_data(&reply.payload).map(Signal::new))
    }

    async fn send(&mut self, signal: &Signal) -> Result<(), DeviceError> {
        if !self.capabilities().learning {
            return Err(DeviceError::unsupported(self.kind, "sending"));
        }
        self.request(RequestOp::SendData, signal.as_bytes())
            .await?
            .ensure_ok()?;
        Ok(())
    }

    async fn read_temperature(&mut self) -> Result<f32, DeviceError> {
        if !self.capabilities().temperature {
            return Err(DeviceError::unsupported(self.kind, "temperature"));
        }
        let reply = self.request(RequestOp::CheckTemperature, &[]).await?;
        if reply.status != 0 {
            warn!("Temperature request failed with status {:#06x}", reply.status);
            return Err(DeviceError::Status(reply.status));
        }
        protocol::decode_temperature(&reply.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::protocol::{DEFAULT_KEY, HEADER_LEN};

    const MAC: [u8; 6] = [0x34, 0xea, 0x34, 0xaa, 0xbb, 0xcc];
    const SESSION_KEY: [u8; 16] = [0x42; 16];

    /// Minimal fake device answering on a loopback socket.
    async fn fake_device() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn reply(key: &[u8; 16], status: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; HEADER_LEN];
        packet[0x22..0x24].copy_from_slice(&status.to_le_bytes());
        if status == 0 {
            let mut body = payload.to_vec();
            body.resize(body.len().div_ceil(16) * 16, 0);
            packet.extend_from_slice(&protocol::encrypt(key, &body).unwrap());
        }
        packet
    }

    async fn answer(socket: &UdpSocket, key: &[u8; 16], status: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        socket
            .send_to(&reply(key, status, payload), from)
            .await
            .unwrap();
        buf.truncate(len);
        buf
    }

    fn auth_reply_payload() -> Vec<u8> {
        let mut payload = vec![0u8; 0x20];
        payload[..4].copy_from_slice(&[9, 8, 7, 6]);
        payload[4..20].copy_from_slice(&SESSION_KEY);
        payload
    }

    async fn authenticated(kind: DeviceKind) -> (BroadlinkDevice, UdpSocket) {
        let (remote, addr) = fake_device().await;
        let mut device = BroadlinkDevice::connect(kind, addr, MAC, Duration::from_secs(2))
            .await
            .unwrap();

        let auth_reply = auth_reply_payload();
        let (result, request) = tokio::join!(
            device.authenticate(),
            answer(&remote, &DEFAULT_KEY, 0, &auth_reply)
        );
        result.unwrap();
        assert_eq!(request[0x26], protocol::CMD_AUTH);
        (device, remote)
    }

    #[tokio::test]
    async fn authenticate_switches_to_session_key() {
        let (device, _remote) = authenticated(DeviceKind::Rm).await;

        assert_eq!(device.session.id, [9, 8, 7, 6]);
        assert_eq!(device.session.key, SESSION_KEY);
    }

    #[tokio::test]
    async fn rejected_authentication_is_auth_error() {
        let (remote, addr) = fake_device().await;
        let mut device = BroadlinkDevice::connect(DeviceKind::Rm, addr, MAC, Duration::from_secs(2))
            .await
            .unwrap();

        let (result, _) = tokio::join!(device.authenticate(), answer(&remote, &DEFAULT_KEY, 0xfff9, &[]));
        assert!(matches!(result, Err(DeviceError::Auth(_))));
    }

    #[tokio::test]
    async fn learning_poll_and_send() {
        let (mut device, remote) = authenticated(DeviceKind::Rm).await;

        let (result, request) = tokio::join!(device.enter_learning(), answer(&remote, &SESSION_KEY, 0, &[]));
        result.unwrap();
        let body = protocol::decrypt(&SESSION_KEY, &request[HEADER_LEN..]).unwrap();
        assert_eq!(body[0], RequestOp::EnterLearning as u8);
        assert_eq!(&request[0x30..0x34], &[9, 8, 7, 6]);

        // Nothing captured yet: the device answers with a non-zero status.
        let (result, _) = tokio::join!(device.poll_captured_signal(), answer(&remote, &SESSION_KEY, 0xfff6, &[]));
        assert_eq!(result.unwrap(), None);

        let (result, _) = tokio::join!(
            device.poll_captured_signal(),
            answer(&remote, &SESSION_KEY, 0, &[0x04, 0, 0, 0, 0x26, 0x00, 0x02, 0x00])
        );
        let captured = result.unwrap().unwrap();
        assert_eq!(&captured.as_bytes()[..4], &[0x26, 0x00, 0x02, 0x00]);

        let learned = Signal::new(vec![0x26, 0x00, 0x02, 0x00]);
        let (result, request) = tokio::join!(
            device.send(&learned),
            answer(&remote, &SESSION_KEY, 0, &[])
        );
        result.unwrap();
        let body = protocol::decrypt(&SESSION_KEY, &request[HEADER_LEN..]).unwrap();
        assert_eq!(&body[..8], &[0x02, 0, 0, 0, 0x26, 0x00, 0x02, 0x00]);
    }

    #[tokio::test]
    async fn temperature_is_decoded() {
        let (mut device, remote) = authenticated(DeviceKind::Rm).await;

        let (result, _) = tokio::join!(
            device.read_temperature(),
            answer(&remote, &SESSION_KEY, 0, &[0x01, 0, 0, 0, 21, 7])
        );
        assert_eq!(result.unwrap(), 21.7);
    }

    #[tokio::test]
    async fn packet_counter_increments() {
        let (mut device, remote) = authenticated(DeviceKind::Rm).await;
        let before = device.count;

        let (_, request) = tokio::join!(device.enter_learning(), answer(&remote, &SESSION_KEY, 0, &[]));
        assert_eq!(
            u16::from_le_bytes([request[0x28], request[0x29]]),
            before.wrapping_add(1)
        );
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let (_remote, addr) = fake_device().await;
        let mut device = BroadlinkDevice::connect(DeviceKind::Rm, addr, MAC, Duration::from_millis(50))
            .await
            .unwrap();

        assert!(matches!(device.authenticate().await, Err(DeviceError::Timeout(_))));
    }

    #[tokio::test]
    async fn switch_only_device_refuses_learning_without_network() {
        let (_remote, addr) = fake_device().await;
        let mut device = BroadlinkDevice::connect(DeviceKind::Sp2, addr, MAC, Duration::from_millis(50))
            .await
            .unwrap();

        assert!(matches!(
            device.enter_learning().await,
            Err(DeviceError::Unsupported { .. })
        ));
        assert!(matches!(
            device.read_temperature().await,
            Err(DeviceError::Unsupported { .. })
        ));
    }
}
