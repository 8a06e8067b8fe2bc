//! Camera bar driver.
//!
//! ## Update Sequence
//!
//! ```text
//! Host                                   Camera
//!   |-- INIT -------------------------------->|   retried until idle
//!   |<------------------------------ ACK -----|
//!   |-- START_TRANSFER (size) --------------->|
//!   |<------------------------------ ACK -----|
//!   |-- DATA_TRANSFER (<= 8184 bytes) ------->|   once per block
//!   |<------------------------------ ACK -----|
//!   |-- END_TRANSFER (flags, MD5) ----------->|   device hashes the image
//!   |<------------------------------ ACK -----|
//!   |-- UNINIT ------------------------------>|
//!   |                                         |   validates and reboots
//! ```
//!
//! Every command is answered by an `ACK` packet whose payload starts with
//! the command being acknowledged.

use super::UpdConfig;
use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::protocol::upd::{
    self, CameraVersion, ChecksumType, INTERFACE_PROTOCOL, INTERFACE_SUBCLASS, MAX_PACKET_SIZE,
    Packet, UpdCommand,
};
use crate::target::family::{DeviceFamily, FirmwareDevice, Lifecycle, SessionState};
use crate::transport::{BulkTransport, CLASS_VENDOR, DeviceDescriptor, Transport, UsbBackend};
use log::{debug, info, trace, warn};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpdateInterface {
    number: u8,
    endpoint_out: u8,
    endpoint_in: u8,
}

/// A camera bar updated over its vendor bulk interface.
pub struct UpdDevice<B: UsbBackend> {
    descriptor: DeviceDescriptor,
    config: UpdConfig,
    lifecycle: Lifecycle,
    interface: Option<UpdateInterface>,
    version: Option<CameraVersion>,
    backend: Option<B>,
    transport: Option<BulkTransport<B>>,
    interrupted: fn() -> bool,
}

impl<B: UsbBackend> UpdDevice<B> {
    /// Wrap a backend. Nothing is sent until [`FirmwareDevice::open`].
    pub fn new(backend: B, config: UpdConfig) -> Self {
        Self {
            descriptor: backend
                .descriptor()
                .clone(),
            config,
            lifecycle: Lifecycle::default(),
            interface: None,
            version: None,
            backend: Some(backend),
            transport: None,
            interrupted: crate::is_interrupted_requested,
        }
    }

    /// Version read by the host from the camera's extension unit.
    #[must_use]
    pub fn with_version(mut self, version: CameraVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Replace the interruption check consulted between data packets.
    #[must_use]
    pub fn with_interrupt_check(mut self, check: fn() -> bool) -> Self {
        self.interrupted = check;
        self
    }

    /// Update interface number and endpoints found by `probe`.
    pub fn endpoints(&self) -> Option<(u8, u8, u8)> {
        self.interface
            .map(|i| (i.number, i.endpoint_out, i.endpoint_in))
    }

    fn transport(&mut self, operation: &str) -> Result<&mut BulkTransport<B>> {
        self.lifecycle
            .require(SessionState::Open, operation)?;
        self.transport
            .as_mut()
            .ok_or_else(|| Error::InternalState(format!("cannot {operation}: no session")))
    }

    fn send_command(&mut self, packet: &Packet, timeout: Duration) -> Result<()> {
        let bulk_timeout = self.config.bulk_timeout;
        let transport = self.transport("send command")?;
        let data = packet.build();
        trace!("UPD -> {} ({} bytes)", packet.command(), data.len());
        transport.send(&data, bulk_timeout)?;

        let mut reply = vec![0u8; MAX_PACKET_SIZE];
        let n = transport.receive(&mut reply, timeout)?;
        trace!("UPD <- {:02x?}", &reply[..n.min(12)]);
        upd::check_ack(&reply[..n], packet.command())
    }

    fn send_data(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        let chunks = image.chunks(self.config.payload_size)?;
        let total = chunks.len();
        let timeout = self.config.bulk_timeout;

        for chunk in &chunks {
            if (self.interrupted)() {
                return Err(Error::Interrupted);
            }
            let packet = Packet::new(UpdCommand::DataTransfer, chunk.data.to_vec())?;
            let index = chunk.index;
            self.send_command(&packet, timeout)
                .map_err(|e| e.in_phase(format!("failed to send data packet 0x{index:x}")))?;
            progress("device-write-blocks", chunk.index + 1, total);
        }
        Ok(())
    }
}

impl<B: UsbBackend> FirmwareDevice for UpdDevice<B> {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Upd
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    fn probe(&mut self) -> Result<()> {
        self.lifecycle
            .require(SessionState::Detected, "probe")?;
        let info = self
            .descriptor
            .interfaces
            .iter()
            .find(|i| {
                i.class == CLASS_VENDOR
                    && i.subclass == INTERFACE_SUBCLASS
                    && i.protocol == INTERFACE_PROTOCOL
            })
            .ok_or_else(|| Error::NotSupported("cannot find update interface".into()))?;
        let [out, input, ..] = info.endpoints.as_slice() else {
            return Err(Error::NotSupported(format!(
                "update interface {} has {} endpoints, expected 2",
                info.number,
                info.endpoints.len()
            )));
        };
        let interface = UpdateInterface {
            number: info.number,
            endpoint_out: out.address,
            endpoint_in: input.address,
        };
        debug!(
            "{}: update interface {} OUT 0x{:02x} IN 0x{:02x}",
            self.descriptor.id_string(),
            interface.number,
            interface.endpoint_out,
            interface.endpoint_in
        );
        self.interface = Some(interface);
        self.lifecycle
            .set(SessionState::Probed);
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        self.lifecycle
            .require(SessionState::Probed, "open")?;
        let interface = self
            .interface
            .ok_or_else(|| Error::InternalState("cannot open: no interface".into()))?;
        let mut backend = self
            .backend
            .take()
            .ok_or_else(|| Error::InternalState("cannot open: backend in use".into()))?;

        if let Err(e) = backend.claim_interface(interface.number) {
            self.backend = Some(backend);
            return Err(Error::NotSupported(format!(
                "failed to claim interface 0x{:02x}: {e}",
                interface.number
            )));
        }

        self.transport = Some(BulkTransport::new(
            backend,
            interface.number,
            interface.endpoint_out,
            interface.endpoint_in,
        ));
        self.lifecycle
            .set(SessionState::Open);
        Ok(())
    }

    fn setup(&mut self) -> Result<Option<String>> {
        self.lifecycle
            .require(SessionState::Open, "read version")?;
        Ok(self
            .version
            .map(|v| v.to_string()))
    }

    fn write_firmware(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        self.lifecycle
            .require(SessionState::Open, "write firmware")?;
        let bulk_timeout = self.config.bulk_timeout;

        // Init is refused until the device is idle.
        progress("init", 0, 1);
        let retry = self.config.init_retry;
        retry
            .run("UPD init", || {
                self.send_command(&Packet::empty(UpdCommand::Init), bulk_timeout)
            })
            .map_err(|e| {
                e.in_phase("failed to write init transfer packet: please reboot the device")
            })?;

        info!("Sending {} bytes", image.len());
        let size = upd::start_transfer_payload(image.len() as u64);
        self.send_command(&Packet::new(UpdCommand::StartTransfer, size)?, bulk_timeout)
            .map_err(|e| e.in_phase("failed to write start transfer packet"))?;
        progress("init", 1, 1);

        self.send_data(image, progress)?;

        progress("end-transfer", 0, 1);
        let digest = image.md5_base64();
        debug!("Image MD5 {digest}");
        let end = upd::end_transfer_payload(true, false, ChecksumType::Md5, &digest);
        let hash_timeout = self.config.hash_timeout;
        self.send_command(&Packet::new(UpdCommand::EndTransfer, end)?, hash_timeout)
            .map_err(|e| e.in_phase("failed to write end transfer packet"))?;
        progress("end-transfer", 1, 1);

        progress("uninit", 0, 1);
        if let Err(e) = self.send_command(&Packet::empty(UpdCommand::Uninit), bulk_timeout) {
            warn!("Ignoring failed finish transfer packet: {e}");
        }
        progress("uninit", 1, 1);

        // The device validates the image and reboots on its own.
        progress("verify", 0, 1);
        thread::sleep(self.config.settle_delay);
        progress("verify", 1, 1);
        info!("Image handed over to {}", self.descriptor.id_string());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.lifecycle
            .require(SessionState::Open, "close")?;
        let transport = self
            .transport
            .take()
            .ok_or_else(|| Error::InternalState("cannot close: no session".into()))?;
        let interface = transport.interface();
        let mut backend = transport.into_backend();
        let released = backend.release_interface(interface);
        self.backend = Some(backend);
        self.lifecycle
            .set(SessionState::Closed);

        released.map_err(|e| {
            Error::NotSupported(format!(
                "failed to release interface 0x{interface:02x}: {e}"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::transport::mock::MockBackend;

    fn ack(command: UpdCommand) -> Vec<u8> {
        Packet::new(UpdCommand::Ack, command.code().to_le_bytes().to_vec())
            .unwrap()
            .build()
    }

    fn reply(command: UpdCommand) -> Vec<u8> {
        Packet::empty(command).build()
    }

    fn config() -> UpdConfig {
        UpdConfig::default()
            .with_init_retry(RetryPolicy::new(5, Duration::ZERO))
            .with_settle_delay(Duration::ZERO)
    }

    fn opened(backend: &MockBackend) -> UpdDevice<MockBackend> {
        let mut device = UpdDevice::new(backend.clone(), config()).with_interrupt_check(|| false);
        device.probe().unwrap();
        device.open().unwrap();
        device
    }

    fn script_update(backend: &mut MockBackend, data_packets: usize) {
        backend.push_read(ack(UpdCommand::Init));
        backend.push_read(ack(UpdCommand::StartTransfer));
        for _ in 0..data_packets {
            backend.push_read(ack(UpdCommand::DataTransfer));
        }
        backend.push_read(ack(UpdCommand::EndTransfer));
        backend.push_read(ack(UpdCommand::Uninit));
    }

    fn header(packet: &[u8]) -> (u32, u32) {
        (
            u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]),
            u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]),
        )
    }

    #[test]
    fn test_probe_finds_update_interface() {
        let mut device = UpdDevice::new(MockBackend::camera_bar(), config());
        device.probe().unwrap();
        assert_eq!(device.endpoints(), Some((4, 0x01, 0x82)));
    }

    #[test]
    fn test_probe_rejects_dock() {
        let mut device = UpdDevice::new(MockBackend::hid_dock(), config());
        assert!(matches!(device.probe(), Err(Error::NotSupported(_))));
    }

    #[test]
    fn test_full_update() {
        let mut backend = MockBackend::camera_bar();
        script_update(&mut backend, 2);
        let mut device = opened(&backend);
        let image = FirmwareImage::from_bytes(vec![0x3C; 10_000]).unwrap();
        let mut steps = Vec::new();

        device
            .write_firmware(&image, &mut |step, done, total| {
                steps.push((step.to_string(), done, total));
            })
            .unwrap();

        let writes = backend.bulk_writes();
        let headers: Vec<(u32, u32)> = writes
            .iter()
            .map(|w| header(w))
            .collect();
        assert_eq!(
            headers,
            vec![
                (0xCC01, 0),
                (0xCC02, 8),
                (0xCC03, 8184),
                (0xCC03, 10_000 - 8184),
                (0xCC04, 12 + 24),
                (0xCC05, 0),
            ]
        );
        assert_eq!(&writes[1][8..], &10_000u64.to_le_bytes());
        assert_eq!(&writes[4][8..20], &[1, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(&writes[4][20..], image.md5_base64().as_bytes());

        // End-transfer waits longer than the other replies.
        let timeouts = backend.read_timeouts();
        assert_eq!(timeouts[4], Duration::from_secs(30));
        assert_eq!(timeouts[0], Duration::from_secs(1));

        assert!(steps.contains(&("device-write-blocks".to_string(), 2, 2)));
        assert_eq!(
            steps
                .last()
                .map(|s| s.0.as_str()),
            Some("verify")
        );
    }

    #[test]
    fn test_init_retried_until_idle() {
        let mut backend = MockBackend::camera_bar();
        backend.push_read(reply(UpdCommand::Nack));
        backend.push_read(reply(UpdCommand::Timeout));
        script_update(&mut backend, 1);
        let mut device = opened(&backend);
        let image = FirmwareImage::from_bytes(vec![1; 16]).unwrap();

        device
            .write_firmware(&image, &mut |_, _, _| {})
            .unwrap();
        let inits = backend
            .bulk_writes()
            .iter()
            .filter(|w| header(w).0 == 0xCC01)
            .count();
        assert_eq!(inits, 3);
    }

    #[test]
    fn test_init_exhausted_asks_for_reboot() {
        let mut backend = MockBackend::camera_bar();
        for _ in 0..5 {
            backend.push_read(reply(UpdCommand::Nack));
        }
        let mut device = opened(&backend);
        let image = FirmwareImage::from_bytes(vec![1; 16]).unwrap();

        let err = device
            .write_firmware(&image, &mut |_, _, _| {})
            .unwrap_err();
        assert!(err.to_string().contains("please reboot the device"));
        assert!(err.to_string().contains("NACK"));
        assert_eq!(backend.bulk_writes().len(), 5);
    }

    #[test]
    fn test_data_packet_failure_names_index() {
        let mut backend = MockBackend::camera_bar();
        backend.push_read(ack(UpdCommand::Init));
        backend.push_read(ack(UpdCommand::StartTransfer));
        backend.push_read(ack(UpdCommand::DataTransfer));
        backend.push_read(ack(UpdCommand::StartTransfer));
        let mut device = opened(&backend);
        let image = FirmwareImage::from_bytes(vec![1; 8184 * 2]).unwrap();

        let err = device
            .write_firmware(&image, &mut |_, _, _| {})
            .unwrap_err();
        assert!(err.to_string().starts_with("failed to send data packet 0x1"));
        assert!(matches!(err.root(), Error::ProtocolMismatch { .. }));
    }

    #[test]
    fn test_uninit_failure_is_ignored() {
        let mut backend = MockBackend::camera_bar();
        backend.push_read(ack(UpdCommand::Init));
        backend.push_read(ack(UpdCommand::StartTransfer));
        backend.push_read(ack(UpdCommand::DataTransfer));
        backend.push_read(ack(UpdCommand::EndTransfer));
        let mut device = opened(&backend);
        let image = FirmwareImage::from_bytes(vec![1; 16]).unwrap();

        device
            .write_firmware(&image, &mut |_, _, _| {})
            .unwrap();
    }

    #[test]
    fn test_setup_reports_supplied_version() {
        let backend = MockBackend::camera_bar();
        let mut device = UpdDevice::new(backend, config())
            .with_version(upd::camera_version_from_xu([0x02, 0x01, 0x10, 0x00]));
        device.probe().unwrap();
        device.open().unwrap();
        assert_eq!(device.setup().unwrap().as_deref(), Some("1.2.16"));
    }

    #[test]
    fn test_lifecycle_close() {
        let backend = MockBackend::camera_bar();
        let mut device = opened(&backend);
        device.close().unwrap();
        assert_eq!(backend.claimed(), vec![4]);
        assert_eq!(backend.released(), vec![4]);
        assert!(matches!(device.setup(), Err(Error::InternalState(_))));
    }

    #[test]
    fn test_interrupted_between_packets() {
        let mut backend = MockBackend::camera_bar();
        backend.push_read(ack(UpdCommand::Init));
        backend.push_read(ack(UpdCommand::StartTransfer));
        let mut device = opened(&backend).with_interrupt_check(|| true);
        let image = FirmwareImage::from_bytes(vec![1; 16]).unwrap();

        assert!(matches!(
            device.write_firmware(&image, &mut |_, _, _| {}),
            Err(Error::Interrupted)
        ));
        assert_eq!(backend.bulk_writes().len(), 2);
    }
}
