//! Headset dock driver.

use super::engine::CommandEngine;
use super::writer::FirmwareWriter;
use super::{GnpConfig, GnpWriteOptions};
use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::target::family::{DeviceFamily, FirmwareDevice, Lifecycle, SessionState};
use crate::transport::{CLASS_HID, DeviceDescriptor, HidReportTransport, UsbBackend};
use log::{debug, info};

/// A dock updated over its HID interface.
pub struct GnpDevice<B: UsbBackend> {
    descriptor: DeviceDescriptor,
    config: GnpConfig,
    write_options: GnpWriteOptions,
    lifecycle: Lifecycle,
    interface: Option<u8>,
    version: Option<String>,
    backend: Option<B>,
    engine: Option<CommandEngine<HidReportTransport<B>>>,
}

impl<B: UsbBackend> GnpDevice<B> {
    /// Wrap a backend. Nothing is sent until [`FirmwareDevice::open`].
    pub fn new(backend: B, config: GnpConfig) -> Self {
        Self {
            descriptor: backend
                .descriptor()
                .clone(),
            config,
            write_options: GnpWriteOptions::default(),
            lifecycle: Lifecycle::default(),
            interface: None,
            version: None,
            backend: Some(backend),
            engine: None,
        }
    }

    /// Set partitions and version triplet used by `write_firmware`.
    #[must_use]
    pub fn with_write_options(mut self, options: GnpWriteOptions) -> Self {
        self.write_options = options;
        self
    }

    /// HID interface found by `probe`.
    pub fn interface(&self) -> Option<u8> {
        self.interface
    }

    /// Version read by the last `setup`.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn engine(&mut self, operation: &str) -> Result<&mut CommandEngine<HidReportTransport<B>>> {
        self.lifecycle
            .require(SessionState::Open, operation)?;
        self.engine
            .as_mut()
            .ok_or_else(|| Error::InternalState(format!("cannot {operation}: no session")))
    }

    /// Ask the dock to boot the image held in serial flash.
    pub fn boot_from_serial_flash(&mut self) -> Result<()> {
        info!("Requesting boot from serial flash");
        self.engine("boot from serial flash")?
            .write_dfu_from_squif()
    }
}

impl<B: UsbBackend> FirmwareDevice for GnpDevice<B> {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Gnp
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
        let interface = self
            .descriptor
            .find_interface(CLASS_HID)
            .ok_or_else(|| Error::NotSupported("cannot find HID interface".into()))?;
        debug!(
            "{}: HID interface {}",
            self.descriptor.id_string(),
            interface.number
        );
        self.interface = Some(interface.number);
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

        if let Err(e) = backend.claim_interface(interface) {
            self.backend = Some(backend);
            return Err(Error::NotSupported(format!(
                "failed to claim interface 0x{interface:02x}: {e}"
            )));
        }

        let transport = HidReportTransport::new(backend, interface);
        self.engine = Some(CommandEngine::new(transport, self.config.clone()));
        self.lifecycle
            .set(SessionState::Open);
        Ok(())
    }

    fn setup(&mut self) -> Result<Option<String>> {
        let version = self
            .engine("read version")?
            .read_version()?;
        self.version = Some(version.clone());
        Ok(Some(version))
    }

    fn write_firmware(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        let options = self.write_options.clone();
        let engine = self.engine("write firmware")?;
        FirmwareWriter::new(engine).write(image, &options, progress)
    }

    fn close(&mut self) -> Result<()> {
        self.lifecycle
            .require(SessionState::Open, "close")?;
        let engine = self
            .engine
            .take()
            .ok_or_else(|| Error::InternalState("cannot close: no session".into()))?;
        let transport = engine.into_transport();
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
