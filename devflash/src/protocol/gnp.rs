//! GN interrupt-protocol frame codec.
//!
//! Every frame, in either direction, is a fixed 63-byte HID report.
//!
//! ## Frame Format
//!
//! ```text
//! +--------+---------+-----+-----+--------+-------+---------+-------------+
//! | Marker | Address | Rsv | Seq | Length | Group | Subcode |   Payload   |
//! +--------+---------+-----+-----+--------+-------+---------+-------------+
//! |  0x05  |  0x08   | 0x00| seq | cls|n  | grp   |  sub    | zero padded |
//! +--------+---------+-----+-----+--------+-------+---------+-------------+
//!   [0]       [1]      [2]   [3]    [4]     [5]      [6]       [7..63]
//! ```
//!
//! The length byte carries the command class in its top two bits and, in the
//! low six bits, the number of meaningful bytes that follow the marker.
//!
//! In responses, offset 5 holds the status (`0xFF` for success) and device
//! notifications are recognised by their fixed 7-byte prefix.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fmt;

/// Size of every frame on the wire.
pub const FRAME_SIZE: usize = 63;

/// Protocol marker in byte 0.
pub const MARKER: u8 = 0x05;

/// Device address in byte 1.
pub const ADDRESS: u8 = 0x08;

/// Size of the fixed frame header up to and including the subcode.
pub const HEADER_SIZE: usize = 7;

/// Status byte of an accepted response.
pub const STATUS_OK: u8 = 0xFF;

/// Offset of the first version character in a read-version response.
pub const VERSION_OFFSET: usize = 8;

/// Firmware bytes carried by one write-chunk frame.
pub const CHUNK_SIZE: usize = 52;

/// Largest payload that fits after the header.
pub const MAX_PAYLOAD: usize = FRAME_SIZE - HEADER_SIZE;

/// Largest chunk that fits after the chunk index and size fields.
pub const MAX_CHUNK_DATA: usize = MAX_PAYLOAD - 4;

/// Device-flash command group.
pub const GROUP_FLASH: u8 = 0x0F;

/// Device-information command group.
pub const GROUP_INFO: u8 = 0x02;

/// Notification sent once the selected partition is erased.
pub const ERASE_DONE_PATTERN: [u8; 7] = [0x05, 0x08, 0x00, 0x00, 0x06, 0x0F, 0x18];

/// Notification acknowledging a window of chunks; the chunk index follows.
pub const CHUNK_ACK_PATTERN: [u8; 7] = [0x05, 0x08, 0x00, 0x00, 0x06, 0x0F, 0x1B];

/// Notification sent once the written image is verified.
pub const VERIFY_OK_PATTERN: [u8; 7] = [0x05, 0x08, 0x00, 0x00, 0x06, 0x0F, 0x1C];

/// Command class, stored in the top bits of the length byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandClass {
    /// Unacknowledged data or notification.
    Stream = 0x00,
    /// Request that returns data.
    Read = 0x40,
    /// Request that changes device state.
    Write = 0x80,
}

impl CommandClass {
    fn from_bits(byte: u8) -> Option<Self> {
        match byte & 0xC0 {
            0x00 => Some(Self::Stream),
            0x40 => Some(Self::Read),
            0x80 => Some(Self::Write),
            _ => None,
        }
    }
}

/// Commands understood by the dock bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Read the running firmware version string.
    ReadVersion,
    /// Select the partition the following write targets.
    WritePartition,
    /// Start the update; the device erases the partition.
    Start,
    /// Announce image CRC, chunk count and window size.
    WriteCrc,
    /// Commit the version triplet of the new image.
    WriteVersion,
    /// Ask the device to boot the image from serial flash.
    DfuFromSqif,
    /// One unacknowledged chunk of firmware.
    WriteChunk,
}

impl Command {
    const ALL: [Self; 7] = [
        Self::ReadVersion,
        Self::WritePartition,
        Self::Start,
        Self::WriteCrc,
        Self::WriteVersion,
        Self::DfuFromSqif,
        Self::WriteChunk,
    ];

    /// Command class of this request.
    pub fn class(self) -> CommandClass {
        match self {
            Self::ReadVersion => CommandClass::Read,
            Self::WriteChunk => CommandClass::Stream,
            _ => CommandClass::Write,
        }
    }

    /// Command group byte.
    pub fn group(self) -> u8 {
        match self {
            Self::ReadVersion => GROUP_INFO,
            _ => GROUP_FLASH,
        }
    }

    /// Subcode byte.
    pub fn subcode(self) -> u8 {
        match self {
            Self::ReadVersion => 0x03,
            Self::WritePartition => 0x2D,
            Self::Start => 0x17,
            Self::WriteCrc | Self::WriteChunk => 0x19,
            Self::WriteVersion => 0x1E,
            Self::DfuFromSqif => 0x1D,
        }
    }

    fn lookup(class: CommandClass, group: u8, subcode: u8) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.class() == class && c.group() == group && c.subcode() == subcode)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadVersion => write!(f, "read version"),
            Self::WritePartition => write!(f, "write partition"),
            Self::Start => write!(f, "start"),
            Self::WriteCrc => write!(f, "write CRC"),
            Self::WriteVersion => write!(f, "write version"),
            Self::DfuFromSqif => write!(f, "DFU from SQIF"),
            Self::WriteChunk => write!(f, "write chunk"),
        }
    }
}

/// Outbound command frame builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    sequence: u8,
    command: Command,
    payload: Vec<u8>,
}

impl CommandFrame {
    /// Create a frame with an empty payload.
    pub fn new(sequence: u8, command: Command) -> Self {
        Self {
            sequence,
            command,
            payload: Vec::new(),
        }
    }

    /// Read-version request.
    pub fn read_version(sequence: u8) -> Self {
        Self::new(sequence, Command::ReadVersion)
    }

    /// Partition select request.
    pub fn write_partition(sequence: u8, partition: u8) -> Self {
        let mut frame = Self::new(sequence, Command::WritePartition);
        frame
            .payload
            .push(partition);
        frame
    }

    /// Start request.
    pub fn start(sequence: u8) -> Self {
        Self::new(sequence, Command::Start)
    }

    /// CRC announcement. `crc` is sent exactly as given.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn write_crc(sequence: u8, crc: u32, total_chunks: u16, preload_count: u16) -> Self {
        let mut frame = Self::new(sequence, Command::WriteCrc);
        frame
            .payload
            .write_u32::<LittleEndian>(crc)
            .unwrap();
        frame
            .payload
            .write_u16::<LittleEndian>(total_chunks)
            .unwrap();
        frame
            .payload
            .write_u16::<LittleEndian>(preload_count)
            .unwrap();
        frame
    }

    /// Version commit request.
    pub fn write_version(sequence: u8, version: [u8; 3]) -> Self {
        let mut frame = Self::new(sequence, Command::WriteVersion);
        frame
            .payload
            .extend_from_slice(&version);
        frame
    }

    /// Boot-from-serial-flash request.
    pub fn dfu_from_squif(sequence: u8) -> Self {
        Self::new(sequence, Command::DfuFromSqif)
    }

    /// Firmware chunk. Chunks are always sent with sequence byte `0x00`.
    #[allow(clippy::unwrap_used, clippy::cast_possible_truncation)]
    pub fn write_chunk(index: u16, data: &[u8]) -> Result<Self> {
        if data.len() > MAX_CHUNK_DATA {
            return Err(Error::InvalidFirmware(format!(
                "chunk of {} bytes exceeds frame capacity of {MAX_CHUNK_DATA}",
                data.len()
            )));
        }
        let mut frame = Self::new(0x00, Command::WriteChunk);
        frame
            .payload
            .write_u16::<LittleEndian>(index)
            .unwrap();
        // Safe cast: bounded by MAX_CHUNK_DATA above
        frame
            .payload
            .write_u16::<LittleEndian>(data.len() as u16)
            .unwrap();
        frame
            .payload
            .extend_from_slice(data);
        Ok(frame)
    }

    /// Command carried by this frame.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Sequence byte carried by this frame.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Payload after the subcode.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The length byte: class bits plus bytes following the marker.
    #[allow(clippy::cast_possible_truncation)]
    pub fn length_byte(&self) -> u8 {
        // Safe cast: header plus payload never exceeds FRAME_SIZE
        let used = (HEADER_SIZE + self.payload.len() - 1) as u8;
        self.command.class() as u8 | used
    }

    /// Build the zero-padded wire frame.
    pub fn build(&self) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = MARKER;
        buf[1] = ADDRESS;
        buf[2] = 0x00;
        buf[3] = self.sequence;
        buf[4] = self.length_byte();
        buf[5] = self.command.group();
        buf[6] = self.command.subcode();
        let len = self.payload.len().min(MAX_PAYLOAD);
        buf[HEADER_SIZE..HEADER_SIZE + len].copy_from_slice(&self.payload[..len]);
        buf
    }

    /// Decode a frame previously produced by [`CommandFrame::build`].
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE || data[0] != MARKER || data[1] != ADDRESS {
            return None;
        }
        let class = CommandClass::from_bits(data[4])?;
        let command = Command::lookup(class, data[5], data[6])?;
        let used = usize::from(data[4] & 0x3F) + 1;
        if used < HEADER_SIZE || used > data.len() {
            return None;
        }
        Some(Self {
            sequence: data[3],
            command,
            payload: data[HEADER_SIZE..used].to_vec(),
        })
    }
}

/// Sequence byte of a response.
pub fn sequence(frame: &[u8]) -> Option<u8> {
    frame
        .get(3)
        .copied()
}

/// Status byte of a response.
pub fn status(frame: &[u8]) -> Option<u8> {
    frame
        .get(5)
        .copied()
}

/// Fail unless the response status is [`STATUS_OK`].
///
/// The error carries the status byte and the byte after it.
pub fn check_status(frame: &[u8], command: Command) -> Result<()> {
    match frame.get(5..7) {
        Some([STATUS_OK, _]) => Ok(()),
        Some(bytes) => Err(Error::mismatch(
            format!("{command} rejected, status"),
            bytes,
        )),
        None => Err(Error::TransportRead(format!(
            "short response to {command}: {} bytes",
            frame.len()
        ))),
    }
}

/// Whether `frame` starts with `pattern`.
pub fn matches_pattern(frame: &[u8], pattern: &[u8]) -> bool {
    frame.starts_with(pattern)
}

/// Fail unless `frame` starts with `pattern`.
pub fn expect_pattern(frame: &[u8], pattern: &[u8], what: &str) -> Result<()> {
    if matches_pattern(frame, pattern) {
        Ok(())
    } else {
        let end = pattern
            .len()
            .min(frame.len());
        Err(Error::mismatch(
            format!("unexpected {what} notification"),
            &frame[..end],
        ))
    }
}

/// Chunk index echoed in a chunk acknowledgment.
pub fn echoed_chunk_index(frame: &[u8]) -> Option<u16> {
    let bytes = frame.get(HEADER_SIZE..HEADER_SIZE + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Extract the version string from a read-version response.
///
/// The string starts at [`VERSION_OFFSET`] and ends at the first NUL byte.
pub fn version_string(frame: &[u8]) -> Result<String> {
    let tail = frame
        .get(VERSION_OFFSET..)
        .ok_or_else(|| Error::InternalState("version response too short".into()))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::InternalState("version string is not terminated".into()))?;
    if end == 0 {
        return Err(Error::InternalState("version string is empty".into()));
    }
    String::from_utf8(tail[..end].to_vec())
        .map_err(|_| Error::InternalState("version string is not valid text".into()))
}
