//! Error types for devflash.

use std::io;
use thiserror::Error;

/// Result type for devflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for devflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (firmware files, host resources).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// USB stack error while opening or claiming a device.
    #[cfg(feature = "native")]
    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    /// A single outbound transfer failed.
    #[error("failed to write: {0}")]
    TransportWrite(String),

    /// A single inbound transfer failed or returned a short frame.
    #[error("failed to read: {0}")]
    TransportRead(String),

    /// The device answered, but not with what the command expects.
    #[error("{context}: {}", hex(bytes))]
    ProtocolMismatch {
        /// What was being validated.
        context: String,
        /// The offending raw bytes.
        bytes: Vec<u8>,
    },

    /// A response carried an unexpected sequence number.
    #[error("stale response: expected sequence {expected:#04x}, got {actual:#04x}")]
    SequenceMismatch {
        /// Sequence number the session expected.
        expected: u8,
        /// Sequence number found in the frame.
        actual: u8,
    },

    /// Device or operation not supported.
    #[error("Unsupported: {0}")]
    NotSupported(String),

    /// A value was missing or malformed, or an operation ran out of order.
    #[error("Internal state: {0}")]
    InternalState(String),

    /// The firmware image cannot be sent.
    #[error("Invalid firmware: {0}")]
    InvalidFirmware(String),

    /// The embedding application requested interruption.
    #[error("Interrupted")]
    Interrupted,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A multi-step operation failed in the named phase.
    #[error("{phase}: {source}")]
    Phase {
        /// Phase that was running.
        phase: String,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Build a [`Error::ProtocolMismatch`] from a context and raw bytes.
    pub fn mismatch(context: impl Into<String>, bytes: &[u8]) -> Self {
        Self::ProtocolMismatch {
            context: context.into(),
            bytes: bytes.to_vec(),
        }
    }

    /// Wrap this error with the name of the phase that produced it.
    #[must_use]
    pub fn in_phase(self, phase: impl Into<String>) -> Self {
        Self::Phase {
            phase: phase.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through any phase context.
    pub fn root(&self) -> &Self {
        match self {
            Self::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this is a single-transfer failure that a retry may cure.
    pub fn is_transport(&self) -> bool {
        matches!(
            self.root(),
            Self::TransportWrite(_) | Self::TransportRead(_)
        )
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("0x{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_display_includes_bytes() {
        let err = Error::mismatch("unexpected status", &[0x00, 0x12]);
        assert_eq!(err.to_string(), "unexpected status: 0x00 0x12");
    }

    #[test]
    fn test_phase_wraps_and_root_unwraps() {
        let err = Error::TransportRead("timed out".into())
            .in_phase("erase")
            .in_phase("partition 1");
        assert_eq!(
            err.to_string(),
            "partition 1: erase: failed to read: timed out"
        );
        assert!(matches!(err.root(), Error::TransportRead(_)));
        assert!(err.is_transport());
    }

    #[test]
    fn test_protocol_errors_are_not_transport() {
        assert!(!Error::mismatch("x", &[]).is_transport());
        assert!(
            !Error::SequenceMismatch {
                expected: 1,
                actual: 2
            }
            .is_transport()
        );
        assert!(Error::TransportWrite("stall".into()).is_transport());
    }
}
