//! Device families and their update protocols.

pub mod family;
pub mod gnp;
pub mod upd;

pub use family::{DeviceFamily, DeviceOptions, FirmwareDevice, Lifecycle, SessionState};
