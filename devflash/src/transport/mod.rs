//! USB transport abstraction.
//!
//! The protocol engines never touch a USB stack directly. They talk to a
//! [`Transport`], which performs exactly one transfer per call, and the
//! transport in turn drives a [`UsbBackend`] that executes the transfer.
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------+     +-------------------------+
//! |  GNP command engine     |     |  UPD update sequence    |
//! +------------+------------+     +------------+------------+
//!              |                               |
//!              v                               v
//! +------------+------------+     +------------+------------+
//! | HidReportTransport      |     | BulkTransport           |
//! | SET_REPORT / intr IN    |     | bulk OUT / bulk IN      |
//! +------------+------------+     +------------+------------+
//!              |                               |
//!              +---------------+---------------+
//!                              v
//!                 +------------+------------+
//!                 |   UsbBackend trait      |
//!                 +------------+------------+
//!                              |
//!               +--------------+-------------+
//!               v                            v
//!        NusbBackend (nusb)          MockBackend (tests)
//! ```
//!
//! Transports never retry and never look inside a frame. Any failure is
//! reported as [`Error::TransportWrite`] or [`Error::TransportRead`] so the
//! retry layer above can decide what to do with it.

#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "native")]
pub mod native;

use crate::error::{Error, Result};
use log::debug;
use std::time::Duration;

/// HID class code.
pub const CLASS_HID: u8 = 0x03;

/// Vendor-specific class code.
pub const CLASS_VENDOR: u8 = 0xFF;

/// HID SET_REPORT request.
pub const HID_SET_REPORT: u8 = 0x09;

/// wValue for SET_REPORT: output report, report ID 5.
pub const HID_REPORT_VALUE: u16 = 0x0205;

/// Interrupt IN endpoint of the dock's HID interface.
pub const HID_INTERRUPT_IN: u8 = 0x81;

/// Direction of an endpoint, from bit 7 of its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

/// Endpoint transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// Control endpoint.
    Control,
    /// Isochronous endpoint.
    Isochronous,
    /// Bulk endpoint.
    Bulk,
    /// Interrupt endpoint.
    Interrupt,
}

/// One endpoint of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint address including the direction bit.
    pub address: u8,
    /// Transfer type.
    pub transfer_type: TransferType,
    /// Maximum packet size in bytes.
    pub max_packet_size: usize,
}

impl EndpointInfo {
    /// Direction encoded in the address.
    pub fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// One interface (alternate setting 0) of the active configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Interface number.
    pub number: u8,
    /// Interface class.
    pub class: u8,
    /// Interface subclass.
    pub subclass: u8,
    /// Interface protocol.
    pub protocol: u8,
    /// Endpoints in descriptor order. May be empty when only a device
    /// listing was available.
    pub endpoints: Vec<EndpointInfo>,
}

/// What the host knows about an attached device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// USB vendor ID.
    pub vendor_id: u16,
    /// USB product ID.
    pub product_id: u16,
    /// Bus identifier.
    pub bus_id: String,
    /// Device address on the bus.
    pub address: u8,
    /// Manufacturer string, if the device reports one.
    pub manufacturer: Option<String>,
    /// Product string, if the device reports one.
    pub product: Option<String>,
    /// Serial number, if the device reports one.
    pub serial: Option<String>,
    /// Interfaces of the active configuration.
    pub interfaces: Vec<InterfaceInfo>,
}

impl DeviceDescriptor {
    /// First interface of the given class.
    pub fn find_interface(&self, class: u8) -> Option<&InterfaceInfo> {
        self.interfaces
            .iter()
            .find(|i| i.class == class)
    }

    /// Short `vid:pid` label.
    pub fn id_string(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Type of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    /// Standard request.
    Standard,
    /// Class request.
    Class,
    /// Vendor request.
    Vendor,
}

/// Recipient of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// The device.
    Device,
    /// An interface.
    Interface,
    /// An endpoint.
    Endpoint,
    /// Something else.
    Other,
}

/// Setup packet of a control OUT transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    /// Request type.
    pub control_type: ControlType,
    /// Request recipient.
    pub recipient: Recipient,
    /// bRequest.
    pub request: u8,
    /// wValue.
    pub value: u16,
    /// wIndex.
    pub index: u16,
}

/// The device I/O substrate.
///
/// Implementations execute single transfers with the given timeout and
/// report failure; they never retry.
pub trait UsbBackend {
    /// Descriptor of the device behind this backend.
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Claim an interface, detaching any kernel driver.
    fn claim_interface(&mut self, number: u8) -> Result<()>;

    /// Release a claimed interface.
    fn release_interface(&mut self, number: u8) -> Result<()>;

    /// Control OUT transfer on a claimed interface.
    fn control_out(
        &mut self,
        interface: u8,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()>;

    /// Interrupt IN transfer; returns bytes received.
    fn interrupt_in(
        &mut self,
        interface: u8,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Bulk OUT transfer; returns bytes sent.
    fn bulk_out(
        &mut self,
        interface: u8,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Bulk IN transfer; returns bytes received.
    fn bulk_in(
        &mut self,
        interface: u8,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;
}

impl<B: UsbBackend + ?Sized> UsbBackend for Box<B> {
    fn descriptor(&self) -> &DeviceDescriptor {
        (**self).descriptor()
    }

    fn claim_interface(&mut self, number: u8) -> Result<()> {
        (**self).claim_interface(number)
    }

    fn release_interface(&mut self, number: u8) -> Result<()> {
        (**self).release_interface(number)
    }

    fn control_out(
        &mut self,
        interface: u8,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        (**self).control_out(interface, request, data, timeout)
    }

    fn interrupt_in(
        &mut self,
        interface: u8,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        (**self).interrupt_in(interface, endpoint, buf, timeout)
    }

    fn bulk_out(
        &mut self,
        interface: u8,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        (**self).bulk_out(interface, endpoint, data, timeout)
    }

    fn bulk_in(
        &mut self,
        interface: u8,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        (**self).bulk_in(interface, endpoint, buf, timeout)
    }
}

/// A single-attempt send/receive channel to a device.
pub trait Transport {
    /// Send `data` in one transfer.
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Receive one transfer into `buf`; returns the number of bytes.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}

fn write_failed(e: &Error) -> Error {
    debug!("Transfer to device failed: {e}");
    match e {
        Error::TransportWrite(msg) => Error::TransportWrite(msg.clone()),
        other => Error::TransportWrite(other.to_string()),
    }
}

fn read_failed(e: &Error) -> Error {
    debug!("Transfer from device failed: {e}");
    match e {
        Error::TransportRead(msg) => Error::TransportRead(msg.clone()),
        other => Error::TransportRead(other.to_string()),
    }
}

/// HID report channel: SET_REPORT to send, interrupt IN to receive.
///
/// Every receive must yield exactly one full report.
#[derive(Debug)]
pub struct HidReportTransport<B: UsbBackend> {
    backend: B,
    interface: u8,
    endpoint_in: u8,
}

impl<B: UsbBackend> HidReportTransport<B> {
    /// Create a transport on an already claimed HID interface.
    pub fn new(backend: B, interface: u8) -> Self {
        Self {
            backend,
            interface,
            endpoint_in: HID_INTERRUPT_IN,
        }
    }

    /// Interface number in use.
    pub fn interface(&self) -> u8 {
        self.interface
    }

    /// Borrow the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutably borrow the backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Give the backend back.
    pub fn into_backend(self) -> B {
        self.backend
    }
}

impl<B: UsbBackend> Transport for HidReportTransport<B> {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        let request = ControlRequest {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request: HID_SET_REPORT,
            value: HID_REPORT_VALUE,
            index: u16::from(self.interface),
        };
        self.backend
            .control_out(self.interface, request, data, timeout)
            .map_err(|e| write_failed(&e))
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let n = self
            .backend
            .interrupt_in(self.interface, self.endpoint_in, buf, timeout)
            .map_err(|e| read_failed(&e))?;
        if n != buf.len() {
            let e = Error::TransportRead(format!(
                "expected {} bytes, got {n}",
                buf.len()
            ));
            return Err(read_failed(&e));
        }
        Ok(n)
    }
}

/// Bulk endpoint pair channel.
#[derive(Debug)]
pub struct BulkTransport<B: UsbBackend> {
    backend: B,
    interface: u8,
    endpoint_out: u8,
    endpoint_in: u8,
}

impl<B: UsbBackend> BulkTransport<B> {
    /// Create a transport on an already claimed interface.
    pub fn new(backend: B, interface: u8, endpoint_out: u8, endpoint_in: u8) -> Self {
        Self {
            backend,
            interface,
            endpoint_out,
            endpoint_in,
        }
    }

    /// Interface number in use.
    pub fn interface(&self) -> u8 {
        self.interface
    }

    /// Mutably borrow the backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Give the backend back.
    pub fn into_backend(self) -> B {
        self.backend
    }
}

impl<B: UsbBackend> Transport for BulkTransport<B> {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        let n = self
            .backend
            .bulk_out(self.interface, self.endpoint_out, data, timeout)
            .map_err(|e| write_failed(&e))?;
        if n != data.len() {
            let e = Error::TransportWrite(format!("sent {n} of {} bytes", data.len()));
            return Err(write_failed(&e));
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.backend
            .bulk_in(self.interface, self.endpoint_in, buf, timeout)
            .map_err(|e| read_failed(&e))
    }
}
