//! Camera bars updated over the bulk TLV protocol.

pub mod device;

use crate::protocol::upd::MAX_PAYLOAD;
use crate::retry::RetryPolicy;
use std::time::Duration;

pub use device::UpdDevice;

/// Timeout of every bulk transfer except the end-transfer reply.
pub const BULK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Timeout for the end-transfer reply, sent once the device has hashed the image.
pub const HASH_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after the last command while the device validates the image.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Protocol tuning for a camera session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdConfig {
    /// Firmware bytes per data packet.
    pub payload_size: usize,
    /// Timeout of ordinary bulk transfers.
    pub bulk_timeout: Duration,
    /// Timeout of the end-transfer reply.
    pub hash_timeout: Duration,
    /// Retry policy of the init handshake.
    pub init_retry: RetryPolicy,
    /// Pause after UNINIT.
    pub settle_delay: Duration,
}

impl Default for UpdConfig {
    fn default() -> Self {
        Self {
            payload_size: MAX_PAYLOAD,
            bulk_timeout: BULK_TIMEOUT,
            hash_timeout: HASH_TIMEOUT,
            init_retry: RetryPolicy::new(5, Duration::from_secs(1)),
            settle_delay: SETTLE_DELAY,
        }
    }
}

impl UpdConfig {
    /// Set the init retry policy.
    #[must_use]
    pub fn with_init_retry(mut self, retry: RetryPolicy) -> Self {
        self.init_retry = retry;
        self
    }

    /// Set the pause after UNINIT.
    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}
