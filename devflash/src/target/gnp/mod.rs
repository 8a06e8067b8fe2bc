//! GN interrupt-protocol docks.
//!
//! - [`engine`]: request/response commands over a [`Transport`](crate::transport::Transport)
//! - [`writer`]: the partition update sequence
//! - [`device`]: the [`FirmwareDevice`](crate::target::FirmwareDevice) implementation

pub mod device;
pub mod engine;
pub mod writer;

use crate::retry::RetryPolicy;
use crate::protocol::gnp::CHUNK_SIZE;
use std::time::Duration;

pub use device::GnpDevice;
pub use engine::CommandEngine;
pub use writer::{FirmwareWriter, WritePhase};

/// Timeout for sending one frame.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(3000);

/// Timeout for an ordinary command response.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Timeout for chunk acknowledgments and the verify notification.
pub const LONG_RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the erase-done notification.
pub const ERASE_TIMEOUT: Duration = Duration::from_secs(60);

/// Chunks sent between two acknowledgments.
pub const DEFAULT_PRELOAD_COUNT: u16 = 100;

/// Partition written when the caller names none.
pub const DEFAULT_PARTITION: u8 = 1;

/// Protocol tuning for a dock session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GnpConfig {
    /// Firmware bytes per chunk frame.
    pub chunk_size: usize,
    /// Acknowledgment window in chunks.
    pub preload_count: u16,
    /// Timeout for sending a frame.
    pub send_timeout: Duration,
    /// Timeout for a command response.
    pub receive_timeout: Duration,
    /// Timeout for chunk acknowledgments and verification.
    pub long_timeout: Duration,
    /// Timeout for the erase notification.
    pub erase_timeout: Duration,
    /// Retry policy applied to every single transfer.
    pub retry: RetryPolicy,
}

impl Default for GnpConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            preload_count: DEFAULT_PRELOAD_COUNT,
            send_timeout: SEND_TIMEOUT,
            receive_timeout: RECEIVE_TIMEOUT,
            long_timeout: LONG_RECEIVE_TIMEOUT,
            erase_timeout: ERASE_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl GnpConfig {
    /// Set the acknowledgment window.
    #[must_use]
    pub fn with_preload_count(mut self, preload_count: u16) -> Self {
        self.preload_count = preload_count;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// What to write and how to label it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GnpWriteOptions {
    /// Partitions to write, one full pass each, in order.
    pub partitions: Vec<u8>,
    /// Version triplet committed after a successful write.
    pub version: Option<[u8; 3]>,
}

impl Default for GnpWriteOptions {
    fn default() -> Self {
        Self {
            partitions: vec![DEFAULT_PARTITION],
            version: None,
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Response builders shared by the dock tests.

    use crate::protocol::gnp::{
        ADDRESS, CHUNK_ACK_PATTERN, ERASE_DONE_PATTERN, FRAME_SIZE, MARKER, STATUS_OK,
        VERIFY_OK_PATTERN,
    };

    pub(crate) fn ok(seq: u8) -> Vec<u8> {
        status(seq, STATUS_OK, 0x00)
    }

    pub(crate) fn status(seq: u8, status: u8, detail: u8) -> Vec<u8> {
        let mut buf = vec![0u8; FRAME_SIZE];
        buf[..4].copy_from_slice(&[MARKER, ADDRESS, 0x00, seq]);
        buf[5] = status;
        buf[6] = detail;
        buf
    }

    pub(crate) fn version(seq: u8, text: &str) -> Vec<u8> {
        let mut buf = ok(seq);
        buf[8..8 + text.len()].copy_from_slice(text.as_bytes());
        buf
    }

    fn notification(pattern: [u8; 7]) -> Vec<u8> {
        let mut buf = vec![0u8; FRAME_SIZE];
        buf[..7].copy_from_slice(&pattern);
        buf
    }

    pub(crate) fn erase_done() -> Vec<u8> {
        notification(ERASE_DONE_PATTERN)
    }

    pub(crate) fn verify_ok() -> Vec<u8> {
        notification(VERIFY_OK_PATTERN)
    }

    pub(crate) fn chunk_ack(index: u16) -> Vec<u8> {
        let mut buf = notification(CHUNK_ACK_PATTERN);
        buf[7..9].copy_from_slice(&index.to_le_bytes());
        buf
    }
}
