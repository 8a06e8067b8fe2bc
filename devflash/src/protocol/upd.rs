//! UPD bulk-protocol packet codec.
//!
//! The camera bar's update interface speaks a type/length/value protocol
//! over a pair of bulk endpoints.
//!
//! ## Packet Format
//!
//! ```text
//! +-------------+-------------+------------------------+
//! |   Command   |   Length    |        Payload         |
//! +-------------+-------------+------------------------+
//! |  u32 (LE)   |  u32 (LE)   |  up to 8184 bytes      |
//! +-------------+-------------+------------------------+
//! ```
//!
//! Every request is answered by an `ACK` packet whose payload starts with
//! the command being acknowledged.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fmt;

/// Size of the command plus length header.
pub const HEADER_SIZE: usize = 8;

/// Largest packet the device accepts.
pub const MAX_PACKET_SIZE: usize = 8192;

/// Largest payload that fits in one packet.
pub const MAX_PAYLOAD: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Interface subclass of the update interface.
pub const INTERFACE_SUBCLASS: u8 = 101;

/// Interface protocol of the update interface.
pub const INTERFACE_PROTOCOL: u8 = 1;

/// UPD command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UpdCommand {
    /// Query the receive buffer size.
    CheckBufferSize = 0xCC00,
    /// Open an update session.
    Init = 0xCC01,
    /// Announce the image size.
    StartTransfer = 0xCC02,
    /// One block of image data.
    DataTransfer = 0xCC03,
    /// Finish the image and hand over its digest.
    EndTransfer = 0xCC04,
    /// Close the update session.
    Uninit = 0xCC05,
    /// Read from the device buffer.
    BufferRead = 0xCC06,
    /// Write to the device buffer.
    BufferWrite = 0xCC07,
    /// Release the device buffer.
    UninitBuffer = 0xCC08,
    /// Positive acknowledgment.
    Ack = 0xFF01,
    /// The device gave up waiting.
    Timeout = 0xFF02,
    /// Negative acknowledgment.
    Nack = 0xFF03,
}

impl UpdCommand {
    /// Decode a command code.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0xCC00 => Some(Self::CheckBufferSize),
            0xCC01 => Some(Self::Init),
            0xCC02 => Some(Self::StartTransfer),
            0xCC03 => Some(Self::DataTransfer),
            0xCC04 => Some(Self::EndTransfer),
            0xCC05 => Some(Self::Uninit),
            0xCC06 => Some(Self::BufferRead),
            0xCC07 => Some(Self::BufferWrite),
            0xCC08 => Some(Self::UninitBuffer),
            0xFF01 => Some(Self::Ack),
            0xFF02 => Some(Self::Timeout),
            0xFF03 => Some(Self::Nack),
            _ => None,
        }
    }

    /// Wire value.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for UpdCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CheckBufferSize => "CHECK_BUFFERSIZE",
            Self::Init => "INIT",
            Self::StartTransfer => "START_TRANSFER",
            Self::DataTransfer => "DATA_TRANSFER",
            Self::EndTransfer => "END_TRANSFER",
            Self::Uninit => "UNINIT",
            Self::BufferRead => "BUFFER_READ",
            Self::BufferWrite => "BUFFER_WRITE",
            Self::UninitBuffer => "UNINIT_BUFFER",
            Self::Ack => "ACK",
            Self::Timeout => "TIMEOUT",
            Self::Nack => "NACK",
        };
        write!(f, "{name}")
    }
}

/// Digest algorithm named in the end-transfer packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChecksumType {
    /// SHA-256.
    Sha256 = 0,
    /// SHA-512.
    Sha512 = 1,
    /// MD5.
    Md5 = 2,
}

/// A UPD packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    command: UpdCommand,
    payload: Vec<u8>,
}

impl Packet {
    /// Create a packet, rejecting payloads that do not fit.
    pub fn new(command: UpdCommand, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::InvalidFirmware(format!(
                "{command} payload of {} bytes exceeds {MAX_PAYLOAD}",
                payload.len()
            )));
        }
        Ok(Self { command, payload })
    }

    /// Packet with no payload.
    pub fn empty(command: UpdCommand) -> Self {
        Self {
            command,
            payload: Vec::new(),
        }
    }

    /// Command code.
    pub fn command(&self) -> UpdCommand {
        self.command
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize header and payload.
    #[allow(clippy::unwrap_used, clippy::cast_possible_truncation)]
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.write_u32::<LittleEndian>(self.command.code())
            .unwrap();
        // Safe cast: payload is bounded by MAX_PAYLOAD
        buf.write_u32::<LittleEndian>(self.payload.len() as u32)
            .unwrap();
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a packet received from the device.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let code = read_u32(data, 0)
            .ok_or_else(|| Error::TransportRead(format!("short UPD packet: {} bytes", data.len())))?;
        let command = UpdCommand::from_u32(code)
            .ok_or_else(|| Error::mismatch("unknown UPD command", &code.to_le_bytes()))?;
        let len = read_u32(data, 4).unwrap_or(0) as usize;
        let end = (HEADER_SIZE + len).min(data.len());
        Ok(Self {
            command,
            payload: data[HEADER_SIZE.min(end)..end].to_vec(),
        })
    }
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Start-transfer payload: image size as LE64.
pub fn start_transfer_payload(image_size: u64) -> Vec<u8> {
    image_size
        .to_le_bytes()
        .to_vec()
}

/// End-transfer payload: update and force flags, digest type, digest text.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn end_transfer_payload(
    update: bool,
    force: bool,
    checksum: ChecksumType,
    digest: &str,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + digest.len());
    buf.write_u32::<LittleEndian>(u32::from(update))
        .unwrap();
    buf.write_u32::<LittleEndian>(u32::from(force))
        .unwrap();
    buf.write_u32::<LittleEndian>(checksum as u32)
        .unwrap();
    buf.extend_from_slice(digest.as_bytes());
    buf
}

/// Validate the device's answer to `sent`.
///
/// The answer must be an `ACK` whose payload begins with the sent command.
pub fn check_ack(response: &[u8], sent: UpdCommand) -> Result<()> {
    let code = read_u32(response, 0)
        .ok_or_else(|| Error::TransportRead(format!("short UPD reply to {sent}")))?;
    if code != UpdCommand::Ack.code() {
        let what = UpdCommand::from_u32(code)
            .map_or_else(|| format!("{code:#x}"), |c| c.to_string());
        return Err(Error::mismatch(
            format!("{sent} not acknowledged, got {what}"),
            &response[..HEADER_SIZE.min(response.len())],
        ));
    }
    let echoed = read_u32(response, HEADER_SIZE)
        .ok_or_else(|| Error::TransportRead(format!("truncated ACK for {sent}")))?;
    if echoed != sent.code() {
        return Err(Error::mismatch(
            format!("ACK for wrong command, expected {sent}"),
            &echoed.to_le_bytes(),
        ));
    }
    Ok(())
}

/// Firmware version reported by the camera's extension unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CameraVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Build number.
    pub build: u16,
}

impl CameraVersion {
    /// Packed 32-bit form: major in the top byte, build in the low half.
    pub fn to_u32(self) -> u32 {
        (u32::from(self.major) << 24) | (u32::from(self.minor) << 16) | u32::from(self.build)
    }
}

impl fmt::Display for CameraVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Decode the four-byte version control of the camera's extension unit.
///
/// Byte 0 is the minor version, byte 1 the major version and bytes 2..4
/// the build number in little-endian order.
pub fn camera_version_from_xu(data: [u8; 4]) -> CameraVersion {
    CameraVersion {
        major: data[1],
        minor: data[0],
        build: u16::from_le_bytes([data[2], data[3]]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(for_cmd: UpdCommand) -> Vec<u8> {
        Packet::new(UpdCommand::Ack, for_cmd.code().to_le_bytes().to_vec())
            .unwrap()
            .build()
    }

    #[test]
    fn test_header_layout() {
        let data = Packet::new(UpdCommand::StartTransfer, start_transfer_payload(0x0102_0304))
            .unwrap()
            .build();
        assert_eq!(&data[..4], &[0x02, 0xCC, 0x00, 0x00]);
        assert_eq!(&data[4..8], &[8, 0, 0, 0]);
        assert_eq!(&data[8..], &[0x04, 0x03, 0x02, 0x01, 0, 0, 0, 0]);
    }

    #[test]
    fn test_empty_packet() {
        let data = Packet::empty(UpdCommand::Init).build();
        assert_eq!(data, vec![0x01, 0xCC, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_payload_limit() {
        assert!(Packet::new(UpdCommand::DataTransfer, vec![0; MAX_PAYLOAD]).is_ok());
        assert!(Packet::new(UpdCommand::DataTransfer, vec![0; MAX_PAYLOAD + 1]).is_err());
        assert_eq!(MAX_PAYLOAD, 8184);
    }

    #[test]
    fn test_parse_roundtrip() {
        let packet = Packet::new(UpdCommand::DataTransfer, vec![9; 20]).unwrap();
        assert_eq!(Packet::parse(&packet.build()).unwrap(), packet);
    }

    #[test]
    fn test_parse_ignores_trailing_buffer() {
        let mut data = ack(UpdCommand::Init);
        data.resize(MAX_PACKET_SIZE, 0);
        let packet = Packet::parse(&data).unwrap();
        assert_eq!(packet.command(), UpdCommand::Ack);
        assert_eq!(packet.payload().len(), 4);
    }

    #[test]
    fn test_end_transfer_payload() {
        let payload = end_transfer_payload(true, false, ChecksumType::Md5, "kAFQ");
        assert_eq!(&payload[..12], &[1, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(&payload[12..], b"kAFQ");
    }

    #[test]
    fn test_check_ack_ok() {
        assert!(check_ack(&ack(UpdCommand::Init), UpdCommand::Init).is_ok());
    }

    #[test]
    fn test_check_ack_wrong_echo() {
        let err = check_ack(&ack(UpdCommand::Init), UpdCommand::StartTransfer).unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch { .. }));
    }

    #[test]
    fn test_check_ack_nack_is_named() {
        let nack = Packet::new(UpdCommand::Nack, UpdCommand::Init.code().to_le_bytes().to_vec())
            .unwrap()
            .build();
        let err = check_ack(&nack, UpdCommand::Init).unwrap_err();
        assert!(err.to_string().contains("NACK"));
    }

    #[test]
    fn test_check_ack_short() {
        assert!(matches!(
            check_ack(&[0x01, 0xFF], UpdCommand::Init),
            Err(Error::TransportRead(_))
        ));
    }

    #[test]
    fn test_command_codes() {
        for code in (0xCC00..=0xCC08).chain(0xFF01..=0xFF03) {
            let cmd = UpdCommand::from_u32(code).unwrap();
            assert_eq!(cmd.code(), code);
        }
        assert_eq!(UpdCommand::from_u32(0x1234), None);
    }

    #[test]
    fn test_camera_version_from_xu() {
        let version = camera_version_from_xu([0x02, 0x01, 0x39, 0x05]);
        assert_eq!(version.to_string(), "1.2.1337");
        assert_eq!(version.to_u32(), 0x0102_0539);
    }
}
