//! Scripted USB backend for unit tests.

use super::{
    ControlRequest, DeviceDescriptor, EndpointInfo, InterfaceInfo, TransferType, UsbBackend,
    CLASS_HID, CLASS_VENDOR,
};
use crate::error::{Error, Result};
use crate::protocol::upd;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    reads: VecDeque<std::result::Result<Vec<u8>, String>>,
    fail_writes: usize,
    control_writes: Vec<(ControlRequest, Vec<u8>)>,
    bulk_writes: Vec<Vec<u8>>,
    read_timeouts: Vec<Duration>,
    claimed: Vec<u8>,
    released: Vec<u8>,
}

/// Backend whose reads come from a script and whose writes are recorded.
///
/// Clones share state, so a test can keep a handle after moving the backend
/// into a device.
#[derive(Debug, Clone)]
pub(crate) struct MockBackend {
    descriptor: DeviceDescriptor,
    state: Rc<RefCell<MockState>>,
}

impl MockBackend {
    pub(crate) fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            state: Rc::default(),
        }
    }

    /// A dock exposing one HID interface with interrupt IN 0x81.
    pub(crate) fn hid_dock() -> Self {
        Self::new(DeviceDescriptor {
            vendor_id: 0x0B0E,
            product_id: 0x245D,
            bus_id: "1".into(),
            address: 4,
            manufacturer: Some("GN Audio".into()),
            product: Some("Test Dock".into()),
            serial: Some("0001".into()),
            interfaces: vec![InterfaceInfo {
                number: 3,
                class: CLASS_HID,
                subclass: 0,
                protocol: 0,
                endpoints: vec![EndpointInfo {
                    address: 0x81,
                    transfer_type: TransferType::Interrupt,
                    max_packet_size: 64,
                }],
            }],
        })
    }

    /// A camera bar exposing the vendor update interface.
    pub(crate) fn camera_bar() -> Self {
        Self::new(DeviceDescriptor {
            vendor_id: 0x046D,
            product_id: 0x0893,
            bus_id: "2".into(),
            address: 7,
            manufacturer: Some("Logitech".into()),
            product: Some("Test Camera".into()),
            serial: None,
            interfaces: vec![
                InterfaceInfo {
                    number: 0,
                    class: 0x0E,
                    subclass: 1,
                    protocol: 0,
                    endpoints: Vec::new(),
                },
                InterfaceInfo {
                    number: 4,
                    class: CLASS_VENDOR,
                    subclass: upd::INTERFACE_SUBCLASS,
                    protocol: upd::INTERFACE_PROTOCOL,
                    endpoints: vec![
                        EndpointInfo {
                            address: 0x01,
                            transfer_type: TransferType::Bulk,
                            max_packet_size: 512,
                        },
                        EndpointInfo {
                            address: 0x82,
                            transfer_type: TransferType::Bulk,
                            max_packet_size: 512,
                        },
                    ],
                },
            ],
        })
    }

    pub(crate) fn push_read(&mut self, data: Vec<u8>) {
        self.state
            .borrow_mut()
            .reads
            .push_back(Ok(data));
    }

    pub(crate) fn push_read_error(&mut self, message: &str) {
        self.state
            .borrow_mut()
            .reads
            .push_back(Err(message.to_string()));
    }

    pub(crate) fn fail_next_writes(&mut self, count: usize) {
        self.state
            .borrow_mut()
            .fail_writes = count;
    }

    pub(crate) fn control_writes(&self) -> Vec<(ControlRequest, Vec<u8>)> {
        self.state
            .borrow()
            .control_writes
            .clone()
    }

    /// Payloads of all control writes, in order.
    pub(crate) fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.control_writes()
            .into_iter()
            .map(|(_, data)| data)
            .collect()
    }

    pub(crate) fn bulk_writes(&self) -> Vec<Vec<u8>> {
        self.state
            .borrow()
            .bulk_writes
            .clone()
    }

    pub(crate) fn read_timeouts(&self) -> Vec<Duration> {
        self.state
            .borrow()
            .read_timeouts
            .clone()
    }

    pub(crate) fn pending_reads(&self) -> usize {
        self.state
            .borrow()
            .reads
            .len()
    }

    pub(crate) fn claimed(&self) -> Vec<u8> {
        self.state
            .borrow()
            .claimed
            .clone()
    }

    pub(crate) fn released(&self) -> Vec<u8> {
        self.state
            .borrow()
            .released
            .clone()
    }

    fn take_write_failure(&self) -> bool {
        let mut state = self.state.borrow_mut();
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            true
        } else {
            false
        }
    }

    fn next_read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut state = self.state.borrow_mut();
        state.read_timeouts.push(timeout);
        match state.reads.pop_front() {
            Some(Ok(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            },
            Some(Err(message)) => Err(Error::TransportRead(message)),
            None => Err(Error::TransportRead("timed out".into())),
        }
    }
}

impl UsbBackend for MockBackend {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn claim_interface(&mut self, number: u8) -> Result<()> {
        self.state
            .borrow_mut()
            .claimed
            .push(number);
        Ok(())
    }

    fn release_interface(&mut self, number: u8) -> Result<()> {
        self.state
            .borrow_mut()
            .released
            .push(number);
        Ok(())
    }

    fn control_out(
        &mut self,
        _interface: u8,
        request: ControlRequest,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<()> {
        if self.take_write_failure() {
            return Err(Error::TransportWrite("pipe stalled".into()));
        }
        self.state
            .borrow_mut()
            .control_writes
            .push((request, data.to_vec()));
        Ok(())
    }

    fn interrupt_in(
        &mut self,
        _interface: u8,
        _endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.next_read(buf, timeout)
    }

    fn bulk_out(
        &mut self,
        _interface: u8,
        _endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize> {
        if self.take_write_failure() {
            return Err(Error::TransportWrite("pipe stalled".into()));
        }
        self.state
            .borrow_mut()
            .bulk_writes
            .push(data.to_vec());
        Ok(data.len())
    }

    fn bulk_in(
        &mut self,
        _interface: u8,
        _endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.next_read(buf, timeout)
    }
}
