//! # devflash
//!
//! Firmware update client for USB headset docks and camera bars.
//!
//! This crate drives two small vendor protocols over USB:
//!
//! - **GNP**: 63-byte HID reports with sequence-numbered request/response
//!   commands, windowed chunk streaming and a CRC-checked partition write
//! - **UPD**: command/length/value packets over a bulk endpoint pair with an
//!   MD5-checked end of transfer
//!
//! ## Supported Devices
//!
//! - Headset docks exposing a HID interface (GNP)
//! - Camera bars exposing the vendor update interface (UPD)
//!
//! ## Features
//!
//! - `native` (default): USB access through `nusb`
//! - `serde`: serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use devflash::{DeviceOptions, FirmwareImage};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("dock.bin")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let devices = devflash::detect_devices();
//!         let selected = devflash::device::select_device(&devices, None)?;
//!         let mut device = devflash::device::open_device(&selected, &DeviceOptions::default())?;
//!
//!         device.probe()?;
//!         device.open()?;
//!         println!("running {:?}", device.setup()?);
//!         device.write_firmware(&image, &mut |step, current, total| {
//!             println!("{step}: {current}/{total}");
//!         })?;
//!         device.close()?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod image;
pub mod protocol;
pub mod retry;
pub mod target;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker polled between device commands.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use transport::native::NusbBackend;
pub use {
    device::{DetectedDevice, detect_devices, detect_supported_devices, parse_device_id},
    error::{Error, Result},
    image::FirmwareImage,
    retry::RetryPolicy,
    target::gnp::{GnpConfig, GnpDevice, GnpWriteOptions},
    target::upd::{UpdConfig, UpdDevice},
    target::{DeviceFamily, DeviceOptions, FirmwareDevice, SessionState},
    transport::{DeviceDescriptor, Transport, UsbBackend},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_interrupt_without_checker() {
        // Library tests never register a checker.
        assert!(!is_interrupted_requested());
    }

    #[test]
    fn test_reexports() {
        let options = DeviceOptions::default();
        assert_eq!(options.gnp.preload_count, 100);
        assert_eq!(options.gnp_write.partitions, vec![1]);
        assert_eq!(DeviceFamily::from_name("gnp"), Some(DeviceFamily::Gnp));
    }
}
