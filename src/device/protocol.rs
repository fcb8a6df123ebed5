//! Broadlink LAN protocol framing.
//!
//! Every request is a single UDP datagram: a 0x38 byte clear-text header
//! followed by an AES-128-CBC encrypted payload. Replies use the same layout.
//!
//! ```text
//! 0x00  magic 5a a5 aa 55 5a a5 aa 55
//! 0x20  packet checksum (LE)
//! 0x22  status code in replies (LE, 0 = ok)
//! 0x24  2a 27
//! 0x26  command
//! 0x28  packet counter (LE)
//! 0x2a  device MAC
//! 0x30  session id
//! 0x34  payload checksum (LE)
//! 0x38  encrypted payload
//! ```

use super::DeviceError;
use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use std::net::Ipv4Addr;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const DEFAULT_KEY: [u8; 16] = [
    0x09, 0x76, 0x28, 0x34, 0x3f, 0xe9, 0x9e, 0x23, 0x76, 0x5c, 0x15, 0x13, 0xac, 0xcf, 0x8b, 0x02,
];
pub const IV: [u8; 16] = [
    0x56, 0x2e, 0x17, 0x99, 0x6d, 0x09, 0x3d, 0x28, 0xdd, 0xb3, 0xba, 0x69, 0x5a, 0x2e, 0x6f, 0x58,
];

pub const HEADER_LEN: usize = 0x38;
pub const HELLO_LEN: usize = 0x30;
pub const HELLO_REPLY_MIN_LEN: usize = 0x40;

pub const CMD_AUTH: u8 = 0x65;
pub const CMD_REQUEST: u8 = 0x6a;
const CMD_HELLO: u8 = 0x06;

const MAGIC: [u8; 8] = [0x5a, 0xa5, 0xaa, 0x55, 0x5a, 0xa5, 0xaa, 0x55];

/// First payload byte of a `CMD_REQUEST` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOp {
    CheckTemperature = 0x01,
    SendData = 0x02,
    EnterLearning = 0x03,
    CheckData = 0x04,
}

/// Key material negotiated during authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: [u8; 4],
    pub key: [u8; 16],
}

impl Default for Session {
    fn default() -> Self {
        Self {
            id: [0; 4],
            key: DEFAULT_KEY,
        }
    }
}

/// A decoded reply. The payload is only decrypted when the status is 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn ensure_ok(self) -> Result<Self, DeviceError> {
        if self.status == 0 {
            Ok(self)
        } else {
            Err(DeviceError::Status(self.status))
        }
    }
}

pub fn checksum(data: &[u8]) -> u16 {
    data.iter()
        .fold(0xbeafu16, |acc, byte| acc.wrapping_add(u16::from(*byte)))
}

fn pad_to_block(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    let remainder = padded.len() % 16;
    if remainder != 0 {
        padded.resize(padded.len() + 16 - remainder, 0);
    }
    padded
}

pub fn encrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, DeviceError> {
    let mut buf = data.to_vec();
    let len = buf.len();
    Aes128CbcEnc::new(&(*key).into(), &IV.into())
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .map_err(|_| DeviceError::Protocol("payload is not block aligned".to_string()))?;
    Ok(buf)
}

pub fn decrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, DeviceError> {
    let mut buf = data.to_vec();
    let len = Aes128CbcDec::new(&(*key).into(), &IV.into())
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| DeviceError::Protocol("encrypted payload is not block aligned".to_string()))?
        .len();
    buf.truncate(len);
    Ok(buf)
}

/// Builds a complete request datagram.
pub fn encode_packet(
    session: &Session,
    mac: &[u8; 6],
    count: u16,
    command: u8,
    payload: &[u8],
) -> Result<Vec<u8>, DeviceError> {
    let mut packet = vec![0u8; HEADER_LEN];
    packet[..MAGIC.len()].copy_from_slice(&MAGIC);
    packet[0x24] = 0x2a;
    packet[0x25] = 0x27;
    packet[0x26] = command;
    packet[0x28..0x2a].copy_from_slice(&count.to_le_bytes());
    packet[0x2a..0x30].copy_from_slice(mac);
    packet[0x30..0x34].copy_from_slice(&session.id);

    let payload = pad_to_block(payload);
    packet[0x34..0x36].copy_from_slice(&checksum(&payload).to_le_bytes());
    packet.extend_from_slice(&encrypt(&session.key, &payload)?);

    let sum = checksum(&packet);
    packet[0x20..0x22].copy_from_slice(&sum.to_le_bytes());
    Ok(packet)
}

pub fn decode_response(key: &[u8; 16], data: &[u8]) -> Result<Response, DeviceError> {
    if data.len() < HEADER_LEN {
        return Err(DeviceError::Protocol(format!(
            "reply of {} bytes is shorter than the header",
            data.len()
        )));
    }

    let status = u16::from_le_bytes([data[0x22], data[0x23]]);
    let payload = if status == 0 {
        decrypt(key, &data[HEADER_LEN..])?
    } else {
        Vec::new()
    };

    Ok(Response { status, payload })
}

pub fn auth_payload() -> Vec<u8> {
    let mut payload = vec![0u8; 0x50];
    payload[0x04..0x13].fill(0x31);
    payload[0x1e] = 0x01;
    payload[0x2d] = 0x01;
    payload[0x30..0x36].copy_from_slice(b"Test 1");
    payload
}

/// Extracts the session id and key from a decrypted auth reply.
pub fn parse_auth_reply(payload: &[u8]) -> Result<Session, DeviceError> {
    if payload.len() < 0x14 {
        return Err(DeviceError::Auth(format!(
            "auth reply payload has {} bytes, expected at least 20",
            payload.len()
        )));
    }

    let mut session = Session::default();
    session.id.copy_from_slice(&payload[0x00..0x04]);
    session.key.copy_from_slice(&payload[0x04..0x14]);
    Ok(session)
}

pub fn request_payload(op: RequestOp, data: &[u8]) -> Vec<u8> {
    let mut payload = vec![0u8; 4];
    payload[0] = op as u8;
    if data.is_empty() {
        payload.resize(16, 0);
    } else {
        payload.extend_from_slice(data);
    }
    payload
}

/// Captured IR data starts after a 4 byte prefix in the check-data reply.
pub fn captured_data(payload: &[u8]) -> Option<Vec<u8>> {
    match payload.get(0x04..) {
        Some(data) if !data.is_empty() => Some(data.to_vec()),
        _ => None,
    }
}

pub fn decode_temperature(payload: &[u8]) -> Result<f32, DeviceError> {
    if payload.len() < 6 {
        return Err(DeviceError::Protocol(format!(
            "temperature reply has {} bytes, expected at least 6",
            payload.len()
        )));
    }
    Ok((f32::from(payload[4]) * 10.0 + f32::from(payload[5])) / 10.0)
}

/// Discovery broadcast announcing our address, port and local time.
pub fn hello_packet(local: Ipv4Addr, port: u16, now: DateTime<FixedOffset>) -> Vec<u8> {
    let mut packet = vec![0u8; HELLO_LEN];
    let timezone = now.offset().local_minus_utc() / 3600;
    packet[0x08..0x0c].copy_from_slice(&timezone.to_le_bytes());

    let year = now.year() as u16;
    packet[0x0c..0x0e].copy_from_slice(&year.to_le_bytes());
    packet[0x0e] = now.minute() as u8;
    packet[0x0f] = now.hour() as u8;
    packet[0x10] = (year % 100) as u8;
    packet[0x11] = now.weekday().number_from_monday() as u8;
    packet[0x12] = now.day() as u8;
    packet[0x13] = now.month() as u8;
    packet[0x18..0x1c].copy_from_slice(&local.octets());
    packet[0x1c..0x1e].copy_from_slice(&port.to_le_bytes());
    packet[0x26] = CMD_HELLO;

    let sum = checksum(&packet);
    packet[0x20..0x22].copy_from_slice(&sum.to_le_bytes());
    packet
}

/// Returns the device type code and MAC advertised in a discovery reply.
pub fn parse_hello_reply(data: &[u8]) -> Option<(u16, [u8; 6])> {
    if data.len() < HELLO_REPLY_MIN_LEN {
        return None;
    }
    let devtype = u16::from_le_bytes([data[0x34], data[0x35]]);
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&data[0x3a..0x40]);
    Some((devtype, mac))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MAC: [u8; 6] = [0x34, 0xea, 0x34, 0x01, 0x02, 0x03];

    #[test]
    fn checksum_starts_at_beaf_and_wraps() {
        assert_eq!(checksum(&[]), 0xbeaf);
        assert_eq!(checksum(&[1, 2, 3]), 0xbeb5);
        assert_eq!(
            checksum(&[0xff; 0x200]),
            ((0xbeaf_u32 + 0xff * 0x200) & 0xffff) as u16
        );
    }

    #[test]
    fn encryption_round_trips_block_aligned_data() {
        let data: Vec<u8> = (0..32).collect();
        let encrypted = encrypt(&DEFAULT_KEY, &data).unwrap();

        assert_ne!(encrypted, data);
        assert_eq!(decrypt(&DEFAULT_KEY, &encrypted).unwrap(), data);
    }

    #[test]
    fn encrypt_rejects_unaligned_data() {
        assert!(encrypt(&DEFAULT_KEY, &[1, 2, 3]).is_err());
    }

    #[test]
    fn packet_header_layout() {
        let session = Session {
            id: [0xaa, 0xbb, 0xcc, 0xdd],
            key: DEFAULT_KEY,
        };
        let payload = request_payload(RequestOp::EnterLearning, &[]);
        let packet = encode_packet(&session, &MAC, 0x1234, CMD_REQUEST, &payload).unwrap();

        assert_eq!(packet.len(), HEADER_LEN + 16);
        assert_eq!(&packet[..8], &MAGIC);
        assert_eq!(packet[0x26], CMD_REQUEST);
        assert_eq!(&packet[0x28..0x2a], &[0x34, 0x12]);
        assert_eq!(&packet[0x2a..0x30], &MAC);
        assert_eq!(&packet[0x30..0x34], &session.id);
        assert_eq!(
            u16::from_le_bytes([packet[0x34], packet[0x35]]),
            checksum(&payload)
        );

        // The packet checksum covers the packet with the checksum field zeroed.
        let mut zeroed = packet.clone();
        zeroed[0x20] = 0;
        zeroed[0x21] = 0;
        assert_eq!(
            u16::from_le_bytes([packet[0x20], packet[0x21]]),
            checksum(&zeroed)
        );
        assert_eq!(decrypt(&DEFAULT_KEY, &packet[HEADER_LEN..]).unwrap(), payload);
    }

    #[test]
    fn send_payload_is_padded_to_block_size() {
        let payload = request_payload(RequestOp::SendData, &[0x26, 0x00, 0x01]);
        assert_eq!(payload, vec![0x02, 0, 0, 0, 0x26, 0x00, 0x01]);

        let packet = encode_packet(&Session::default(), &MAC, 1, CMD_REQUEST, &payload).unwrap();
        assert_eq!(packet.len(), HEADER_LEN + 16);
    }

    #[test]
    fn response_payload_is_decrypted_only_on_success() {
        let mut reply = vec![0u8; HEADER_LEN];
        let body: Vec<u8> = vec![0x04, 0, 0, 0, 0xa1, 0xb2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        reply.extend_from_slice(&encrypt(&DEFAULT_KEY, &body).unwrap());

        let ok = decode_response(&DEFAULT_KEY, &reply).unwrap();
        assert_eq!(ok.status, 0);
        assert_eq!(ok.payload, body);

        reply[0x22] = 0xf9;
        reply[0x23] = 0xff;
        let pending = decode_response(&DEFAULT_KEY, &reply).unwrap();
        assert_eq!(pending.status, 0xfff9);
        assert!(pending.payload.is_empty());
        assert!(matches!(pending.ensure_ok(), Err(DeviceError::Status(0xfff9))));
    }

    #[test]
    fn short_response_is_protocol_error() {
        assert!(matches!(
            decode_response(&DEFAULT_KEY, &[0u8; 10]),
            Err(DeviceError::Protocol(_))
        ));
    }

    #[test]
    fn auth_payload_and_reply() {
        let payload = auth_payload();
        assert_eq!(payload.len(), 0x50);
        assert!(payload[0x04..0x13].iter().all(|b| *b == 0x31));
        assert_eq!(&payload[0x30..0x36], b"Test 1");

        let mut reply = vec![0u8; 0x20];
        reply[..4].copy_from_slice(&[1, 2, 3, 4]);
        reply[4..20].copy_from_slice(&[7u8; 16]);
        let session = parse_auth_reply(&reply).unwrap();
        assert_eq!(session.id, [1, 2, 3, 4]);
        assert_eq!(session.key, [7u8; 16]);

        assert!(matches!(parse_auth_reply(&[0u8; 8]), Err(DeviceError::Auth(_))));
    }

    #[test]
    fn captured_data_skips_prefix() {
        assert_eq!(captured_data(&[4, 0, 0, 0, 0xa1, 0xb2]), Some(vec![0xa1, 0xb2]));
        assert_eq!(captured_data(&[4, 0, 0, 0]), None);
        assert_eq!(captured_data(&[]), None);
    }

    #[test]
    fn temperature_is_tenths() {
        let payload = [0x01, 0, 0, 0, 23, 5, 0, 0];
        assert_eq!(decode_temperature(&payload).unwrap(), 23.5);
        assert!(decode_temperature(&payload[..4]).is_err());
    }

    #[test]
    fn hello_packet_layout() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = offset.with_ymd_and_hms(2024, 3, 14, 15, 9, 26).unwrap();
        let packet = hello_packet(Ipv4Addr::new(192, 168, 1, 20), 0xc350, now);

        assert_eq!(packet.len(), HELLO_LEN);
        assert_eq!(&packet[0x08..0x0c], &2i32.to_le_bytes());
        assert_eq!(&packet[0x0c..0x0e], &2024u16.to_le_bytes());
        assert_eq!(packet[0x0e], 9);
        assert_eq!(packet[0x0f], 15);
        assert_eq!(packet[0x10], 24);
        assert_eq!(packet[0x11], 4); // Thursday
        assert_eq!(packet[0x12], 14);
        assert_eq!(packet[0x13], 3);
        assert_eq!(&packet[0x18..0x1c], &[192, 168, 1, 20]);
        assert_eq!(&packet[0x1c..0x1e], &[0x50, 0xc3]);
        assert_eq!(packet[0x26], 6);
    }

    #[test]
    fn negative_timezone_is_twos_complement() {
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        let now = offset.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let packet = hello_packet(Ipv4Addr::LOCALHOST, 80, now);

        assert_eq!(&packet[0x08..0x0c], &[0xfb, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn hello_reply_exposes_type_and_mac() {
        let mut reply = vec![0u8; HELLO_REPLY_MIN_LEN];
        reply[0x34] = 0x37;
        reply[0x35] = 0x27;
        reply[0x3a..0x40].copy_from_slice(&MAC);

        assert_eq!(parse_hello_reply(&reply), Some((0x2737, MAC)));
        assert_eq!(parse_hello_reply(&reply[..0x30]), None);
    }
}
