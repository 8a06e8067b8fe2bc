//! Native USB backend built on `nusb`.

use super::{
    ControlRequest, ControlType, DeviceDescriptor, EndpointInfo, InterfaceInfo, Recipient,
    TransferType, UsbBackend,
};
use crate::error::{Error, Result};
use log::{debug, trace};
use nusb::MaybeFuture;
use nusb::descriptors::TransferType as NusbTransferType;
use nusb::transfer::{
    Buffer, Bulk, BulkOrInterrupt, ControlOut, ControlType as NusbControlType, In, Interrupt, Out,
    Recipient as NusbRecipient,
};
use std::collections::HashMap;
use std::time::Duration;

/// A device opened through the operating system's USB stack.
pub struct NusbBackend {
    device: nusb::Device,
    descriptor: DeviceDescriptor,
    interfaces: HashMap<u8, nusb::Interface>,
}

impl std::fmt::Debug for NusbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NusbBackend")
            .field("descriptor", &self.descriptor)
            .field("claimed", &self.interfaces.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Describe every attached device without opening it.
///
/// Interfaces are listed without endpoints; those are only known once a
/// device is opened.
pub fn list_devices() -> Result<Vec<DeviceDescriptor>> {
    let devices = nusb::list_devices()
        .wait()?
        .map(|info| describe(&info))
        .collect();
    Ok(devices)
}

fn describe(info: &nusb::DeviceInfo) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
        bus_id: info
            .bus_id()
            .to_string(),
        address: info.device_address(),
        manufacturer: info
            .manufacturer_string()
            .map(str::to_string),
        product: info
            .product_string()
            .map(str::to_string),
        serial: info
            .serial_number()
            .map(str::to_string),
        interfaces: info
            .interfaces()
            .map(|i| InterfaceInfo {
                number: i.interface_number(),
                class: i.class(),
                subclass: i.subclass(),
                protocol: i.protocol(),
                endpoints: Vec::new(),
            })
            .collect(),
    }
}

fn transfer_type(t: NusbTransferType) -> TransferType {
    match t {
        NusbTransferType::Control => TransferType::Control,
        NusbTransferType::Isochronous => TransferType::Isochronous,
        NusbTransferType::Bulk => TransferType::Bulk,
        NusbTransferType::Interrupt => TransferType::Interrupt,
    }
}

impl NusbBackend {
    /// Open the first device matching `vendor_id` and `product_id`.
    pub fn open_by_id(vendor_id: u16, product_id: u16) -> Result<Self> {
        let info = nusb::list_devices()
            .wait()?
            .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
            .ok_or_else(|| {
                Error::NotSupported(format!(
                    "no device {vendor_id:04x}:{product_id:04x} attached"
                ))
            })?;
        Self::open(&info)
    }

    /// Open a listed device and read its active configuration.
    pub fn open(info: &nusb::DeviceInfo) -> Result<Self> {
        let device = info.open().wait()?;
        let mut descriptor = describe(info);

        let config = device
            .active_configuration()
            .map_err(|e| Error::NotSupported(format!("no active configuration: {e}")))?;
        descriptor.interfaces = config
            .interface_alt_settings()
            .filter(|alt| alt.alternate_setting() == 0)
            .map(|alt| InterfaceInfo {
                number: alt.interface_number(),
                class: alt.class(),
                subclass: alt.subclass(),
                protocol: alt.protocol(),
                endpoints: alt
                    .endpoints()
                    .map(|ep| EndpointInfo {
                        address: ep.address(),
                        transfer_type: transfer_type(ep.transfer_type()),
                        max_packet_size: ep.max_packet_size(),
                    })
                    .collect(),
            })
            .collect();

        debug!(
            "Opened {} on bus {} address {}",
            descriptor.id_string(),
            descriptor.bus_id,
            descriptor.address
        );

        Ok(Self {
            device,
            descriptor,
            interfaces: HashMap::new(),
        })
    }

    fn interface(&self, number: u8) -> Result<&nusb::Interface> {
        self.interfaces
            .get(&number)
            .ok_or_else(|| Error::InternalState(format!("interface {number} is not claimed")))
    }
}

fn transfer_in<T: BulkOrInterrupt>(
    interface: &nusb::Interface,
    endpoint: u8,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize> {
    let mut ep = interface.endpoint::<T, In>(endpoint)?;
    let packet = ep
        .max_packet_size()
        .max(1);
    let requested = buf
        .len()
        .div_ceil(packet)
        * packet;
    let mut request = Buffer::new(requested);
    request.set_requested_len(requested);
    ep.submit(request);

    let Some(completion) = ep.wait_next_complete(timeout) else {
        ep.cancel_all();
        let _ = ep.wait_next_complete(Duration::from_millis(100));
        return Err(Error::TransportRead(format!(
            "timed out after {} ms",
            timeout.as_millis()
        )));
    };
    completion
        .status
        .map_err(|e| Error::TransportRead(e.to_string()))?;

    let n = completion
        .buffer
        .len()
        .min(buf.len());
    buf[..n].copy_from_slice(&completion.buffer[..n]);
    trace!("IN 0x{endpoint:02x}: {n} bytes");
    Ok(n)
}

fn transfer_out<T: BulkOrInterrupt>(
    interface: &nusb::Interface,
    endpoint: u8,
    data: &[u8],
    timeout: Duration,
) -> Result<usize> {
    let mut ep = interface.endpoint::<T, Out>(endpoint)?;
    ep.submit(Buffer::from(data.to_vec()));

    let Some(completion) = ep.wait_next_complete(timeout) else {
        ep.cancel_all();
        let _ = ep.wait_next_complete(Duration::from_millis(100));
        return Err(Error::TransportWrite(format!(
            "timed out after {} ms",
            timeout.as_millis()
        )));
    };
    completion
        .status
        .map_err(|e| Error::TransportWrite(e.to_string()))?;
    trace!("OUT 0x{endpoint:02x}: {} bytes", completion.actual_len);
    Ok(completion.actual_len)
}

impl UsbBackend for NusbBackend {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn claim_interface(&mut self, number: u8) -> Result<()> {
        if self.interfaces.contains_key(&number) {
            return Ok(());
        }
        let interface = self
            .device
            .detach_and_claim_interface(number)
            .wait()?;
        debug!("Claimed interface {number}");
        self.interfaces.insert(number, interface);
        Ok(())
    }

    fn release_interface(&mut self, number: u8) -> Result<()> {
        if self.interfaces.remove(&number).is_some() {
            debug!("Released interface {number}");
        }
        Ok(())
    }

    fn control_out(
        &mut self,
        interface: u8,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let control_type = match request.control_type {
            ControlType::Standard => NusbControlType::Standard,
            ControlType::Class => NusbControlType::Class,
            ControlType::Vendor => NusbControlType::Vendor,
        };
        let recipient = match request.recipient {
            Recipient::Device => NusbRecipient::Device,
            Recipient::Interface => NusbRecipient::Interface,
            Recipient::Endpoint => NusbRecipient::Endpoint,
            Recipient::Other => NusbRecipient::Other,
        };
        trace!("SET 0x{:02x} value 0x{:04x}: {data:02x?}", request.request, request.value);
        self.interface(interface)?
            .control_out(
                ControlOut {
                    control_type,
                    recipient,
                    request: request.request,
                    value: request.value,
                    index: request.index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(|e| Error::TransportWrite(e.to_string()))
    }

    fn interrupt_in(
        &mut self,
        interface: u8,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        transfer_in::<Interrupt>(self.interface(interface)?, endpoint, buf, timeout)
    }

    fn bulk_out(
        &mut self,
        interface: u8,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        transfer_out::<Bulk>(self.interface(interface)?, endpoint, data, timeout)
    }

    fn bulk_in(
        &mut self,
        interface: u8,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        transfer_in::<Bulk>(self.interface(interface)?, endpoint, buf, timeout)
    }
}
