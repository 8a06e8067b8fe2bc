//! Device discovery and classification.
//!
//! A device is classified from its USB IDs and its interface layout: docks
//! expose a HID interface, camera bars a vendor interface with the update
//! subclass and protocol.

use crate::error::{Error, Result};
use crate::protocol::upd::{INTERFACE_PROTOCOL, INTERFACE_SUBCLASS};
use crate::target::DeviceFamily;
#[cfg(feature = "native")]
use crate::target::{DeviceOptions, FirmwareDevice};
use crate::transport::{CLASS_HID, CLASS_VENDOR, DeviceDescriptor};
use log::warn;

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// Vendors whose devices speak one of the supported protocols.
///
/// An empty product list matches every product of the vendor.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceFamily)] = &[
    (0x0B0E, &[], DeviceFamily::Gnp),
    (0x046D, &[], DeviceFamily::Upd),
];

/// Family registered for a vendor and product, before looking at interfaces.
#[must_use]
pub fn family_from_vid_pid(vid: u16, pid: u16) -> Option<DeviceFamily> {
    KNOWN_USB_DEVICES
        .iter()
        .find(|(known_vid, pids, _)| vid == *known_vid && (pids.is_empty() || pids.contains(&pid)))
        .map(|(_, _, family)| *family)
}

/// Classify a device by IDs and interface layout.
///
/// The UPD interface signature is specific enough to stand on its own; a
/// HID interface only counts on a known dock vendor.
pub fn classify(descriptor: &DeviceDescriptor) -> Option<DeviceFamily> {
    let has_update_interface = descriptor
        .interfaces
        .iter()
        .any(|i| {
            i.class == CLASS_VENDOR
                && i.subclass == INTERFACE_SUBCLASS
                && i.protocol == INTERFACE_PROTOCOL
        });
    if has_update_interface {
        return Some(DeviceFamily::Upd);
    }

    match family_from_vid_pid(descriptor.vendor_id, descriptor.product_id) {
        Some(DeviceFamily::Gnp) if descriptor.find_interface(CLASS_HID).is_some() => {
            Some(DeviceFamily::Gnp)
        },
        _ => None,
    }
}

/// An attached device with its classification.
#[derive(Debug, Clone)]
pub struct DetectedDevice {
    /// What the host reports about the device.
    pub descriptor: DeviceDescriptor,
    /// Protocol family, if supported.
    pub family: Option<DeviceFamily>,
}

impl DetectedDevice {
    /// Classify `descriptor`.
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        let family = classify(&descriptor);
        Self { descriptor, family }
    }

    /// Whether a supported protocol was recognised.
    pub fn is_supported(&self) -> bool {
        self.family.is_some()
    }

    /// `vid:pid` followed by the product string, if any.
    pub fn label(&self) -> String {
        match &self.descriptor.product {
            Some(product) => format!("{} {product}", self.descriptor.id_string()),
            None => self.descriptor.id_string(),
        }
    }

    /// Whether this is the device `vid:pid`.
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.descriptor.vendor_id == vendor_id && self.descriptor.product_id == product_id
    }
}

/// Parse a `vid:pid` pair of hexadecimal IDs, e.g. `0b0e:245d`.
pub fn parse_device_id(text: &str) -> Result<(u16, u16)> {
    let (vid, pid) = text
        .split_once(':')
        .ok_or_else(|| Error::Config(format!("invalid device id '{text}', expected VID:PID")))?;
    let parse = |part: &str| {
        let part = part
            .trim()
            .trim_start_matches("0x");
        u16::from_str_radix(part, 16)
            .map_err(|_| Error::Config(format!("invalid hexadecimal id '{part}' in '{text}'")))
    };
    Ok((parse(vid)?, parse(pid)?))
}

/// List every attached USB device with its classification.
#[cfg(feature = "native")]
pub fn detect_devices() -> Vec<DetectedDevice> {
    match crate::transport::native::list_devices() {
        Ok(devices) => devices
            .into_iter()
            .map(|descriptor| {
                let detected = DetectedDevice::new(descriptor);
                trace!(
                    "Found USB device {} on bus {} ({:?})",
                    detected.label(),
                    detected.descriptor.bus_id,
                    detected.family
                );
                detected
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate USB devices: {e}");
            Vec::new()
        },
    }
}

/// Without native USB support there is nothing to list.
#[cfg(not(feature = "native"))]
pub fn detect_devices() -> Vec<DetectedDevice> {
    Vec::new()
}

/// Attached devices that speak a supported protocol.
pub fn detect_supported_devices() -> Vec<DetectedDevice> {
    detect_devices()
        .into_iter()
        .filter(DetectedDevice::is_supported)
        .collect()
}

/// Pick the device to update.
///
/// With `id` set, the device with that `vid:pid` is required; otherwise the
/// first supported device wins.
pub fn select_device(
    devices: &[DetectedDevice],
    id: Option<(u16, u16)>,
) -> Result<DetectedDevice> {
    if let Some((vid, pid)) = id {
        let device = devices
            .iter()
            .find(|d| d.matches(vid, pid))
            .ok_or_else(|| {
                Error::NotSupported(format!("no device {vid:04x}:{pid:04x} attached"))
            })?;
        if !device.is_supported() {
            return Err(Error::NotSupported(format!(
                "{} does not expose a supported update interface",
                device.label()
            )));
        }
        return Ok(device.clone());
    }

    let mut supported = devices
        .iter()
        .filter(|d| d.is_supported());
    let first = supported
        .next()
        .ok_or_else(|| Error::NotSupported("no supported device found".into()))?;
    if supported
        .next()
        .is_some()
    {
        warn!("Several supported devices attached, using {}", first.label());
    }
    Ok(first.clone())
}

/// Open `device` and create its driver.
#[cfg(feature = "native")]
pub fn open_device(
    device: &DetectedDevice,
    options: &DeviceOptions,
) -> Result<Box<dyn FirmwareDevice>> {
    let family = device
        .family
        .ok_or_else(|| Error::NotSupported(format!("{} is not supported", device.label())))?;
    let backend = crate::transport::native::NusbBackend::open_by_id(
        device.descriptor.vendor_id,
        device.descriptor.product_id,
    )?;
    info!("Opened {} as {family}", device.label());
    Ok(family.create_device(backend, options))
}
