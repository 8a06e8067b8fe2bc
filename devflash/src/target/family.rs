//! Device family abstraction.
//!
//! Every supported device is driven through the same [`FirmwareDevice`]
//! lifecycle, so the CLI can update a dock or a camera without knowing which
//! protocol sits underneath.

use super::gnp::{GnpConfig, GnpDevice, GnpWriteOptions};
use super::upd::{UpdConfig, UpdDevice};
use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::transport::{DeviceDescriptor, UsbBackend};
use std::fmt;

/// Supported device families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DeviceFamily {
    /// Headset docks speaking the GN interrupt protocol over HID reports.
    Gnp,
    /// Camera bars speaking the bulk update protocol.
    Upd,
}

impl DeviceFamily {
    /// Short lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gnp => "gnp",
            Self::Upd => "upd",
        }
    }

    /// One-line description for listings.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Gnp => "HID interrupt protocol (headset dock)",
            Self::Upd => "bulk update protocol (camera bar)",
        }
    }

    /// Parse a family from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "gnp" | "dock" => Some(Self::Gnp),
            "upd" | "camera" => Some(Self::Upd),
            _ => None,
        }
    }

    /// Create a device driver for this family around an opened backend.
    ///
    /// The returned device is in [`SessionState::Detected`]; call
    /// [`FirmwareDevice::probe`] next.
    pub fn create_device<B: UsbBackend + 'static>(
        &self,
        backend: B,
        options: &DeviceOptions,
    ) -> Box<dyn FirmwareDevice> {
        match self {
            Self::Gnp => Box::new(
                GnpDevice::new(backend, options.gnp.clone())
                    .with_write_options(options.gnp_write.clone()),
            ),
            Self::Upd => Box::new(UpdDevice::new(backend, options.upd.clone())),
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gnp => write!(f, "GNP"),
            Self::Upd => write!(f, "UPD"),
        }
    }
}

/// Per-family settings used when creating a device.
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    /// Dock protocol tuning.
    pub gnp: GnpConfig,
    /// Dock partitions and version triplet.
    pub gnp_write: GnpWriteOptions,
    /// Camera protocol tuning.
    pub upd: UpdConfig,
}

/// Where a device session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Found on the bus, nothing checked yet.
    Detected,
    /// The protocol interface was located.
    Probed,
    /// The interface is claimed and commands may be sent.
    Open,
    /// The interface was released.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detected => write!(f, "detected"),
            Self::Probed => write!(f, "probed"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Session state with ordering checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    state: SessionState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: SessionState::Detected,
        }
    }
}

impl Lifecycle {
    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Fail with [`Error::InternalState`] unless the session is in `expected`.
    pub fn require(&self, expected: SessionState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InternalState(format!(
                "cannot {operation}: device is {}, expected {expected}",
                self.state
            )))
        }
    }

    /// Move to `state`.
    pub fn set(&mut self, state: SessionState) {
        self.state = state;
    }
}

/// Lifecycle of a device being updated.
///
/// Calls must follow `probe`, `open`, then any number of `setup` and
/// `write_firmware`, then `close`. Out-of-order calls fail with
/// [`Error::InternalState`] without touching the device.
pub trait FirmwareDevice {
    /// Family of this device.
    fn family(&self) -> DeviceFamily;

    /// Descriptor of the underlying USB device.
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Current session state.
    fn state(&self) -> SessionState;

    /// Locate the protocol interface.
    fn probe(&mut self) -> Result<()>;

    /// Claim the protocol interface.
    fn open(&mut self) -> Result<()>;

    /// Read the running firmware version, if the family can report one.
    fn setup(&mut self) -> Result<Option<String>>;

    /// Write `image` to the device.
    ///
    /// `progress` receives a step name, the current position and the total.
    fn write_firmware(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()>;

    /// Release the protocol interface.
    fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockBackend;

    #[test]
    fn test_family_from_name() {
        assert_eq!(DeviceFamily::from_name("GNP"), Some(DeviceFamily::Gnp));
        assert_eq!(DeviceFamily::from_name("camera"), Some(DeviceFamily::Upd));
        assert_eq!(DeviceFamily::from_name("serial"), None);
    }

    #[test]
    fn test_lifecycle_require() {
        let mut lifecycle = Lifecycle::default();
        assert!(lifecycle.require(SessionState::Detected, "probe").is_ok());
        let err = lifecycle
            .require(SessionState::Open, "write")
            .unwrap_err();
        assert!(err.to_string().contains("device is detected"));
        lifecycle.set(SessionState::Open);
        assert_eq!(lifecycle.state(), SessionState::Open);
    }

    #[test]
    fn test_create_device_by_family() {
        let options = DeviceOptions::default();
        let dock = DeviceFamily::Gnp.create_device(MockBackend::hid_dock(), &options);
        assert_eq!(dock.family(), DeviceFamily::Gnp);
        assert_eq!(dock.state(), SessionState::Detected);

        let camera = DeviceFamily::Upd.create_device(MockBackend::camera_bar(), &options);
        assert_eq!(camera.family(), DeviceFamily::Upd);
        assert_eq!(camera.descriptor().vendor_id, 0x046D);
    }
}
