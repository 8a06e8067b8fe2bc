//! Request/response engine for the GN interrupt protocol.
//!
//! Each command is one frame sent with SET_REPORT followed by one 63-byte
//! response on the interrupt endpoint. Requests carry the engine's expected
//! sequence number; the matching response must echo it, and only then does
//! the counter advance.
//!
//! The send and the receive are retried independently. A response carrying
//! a stale sequence number counts as a failed receive, so the next attempt
//! reads the following frame instead of resending the request.

use super::GnpConfig;
use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::protocol::gnp::{
    self, CHUNK_ACK_PATTERN, Command, CommandFrame, ERASE_DONE_PATTERN, FRAME_SIZE,
    VERIFY_OK_PATTERN,
};
use crate::protocol::sequence::SequenceTracker;
use crate::transport::Transport;
use log::{debug, info, trace};
use std::time::Duration;

/// Command engine over a single-attempt transport.
pub struct CommandEngine<T: Transport> {
    transport: T,
    sequence: SequenceTracker,
    config: GnpConfig,
    interrupted: fn() -> bool,
}

impl<T: Transport> std::fmt::Debug for CommandEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEngine")
            .field("sequence", &self.sequence)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> CommandEngine<T> {
    /// Create an engine whose sequence counter starts at zero.
    pub fn new(transport: T, config: GnpConfig) -> Self {
        Self {
            transport,
            sequence: SequenceTracker::new(0),
            config,
            interrupted: crate::is_interrupted_requested,
        }
    }

    /// Replace the interruption check consulted between chunks.
    #[must_use]
    pub fn with_interrupt_check(mut self, check: fn() -> bool) -> Self {
        self.interrupted = check;
        self
    }

    /// Start the sequence counter at `value`.
    #[must_use]
    pub fn with_sequence(mut self, value: u8) -> Self {
        self.sequence = SequenceTracker::new(value);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &GnpConfig {
        &self.config
    }

    /// Sequence number the next request will carry.
    pub fn expected_sequence(&self) -> u8 {
        self.sequence.expected()
    }

    /// Borrow the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Give the transport back.
    pub fn into_transport(self) -> T {
        self.transport
    }

    pub(crate) fn check_interrupted(&self) -> Result<()> {
        if (self.interrupted)() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    fn send_frame(&mut self, frame: &CommandFrame) -> Result<()> {
        let data = frame.build();
        let timeout = self.config.send_timeout;
        let transport = &mut self.transport;
        trace!("GNP -> {:02x?}", &data[..gnp::HEADER_SIZE]);
        self.config
            .retry
            .run(&format!("send {}", frame.command()), || transport.send(&data, timeout))
    }

    fn receive_sequenced(&mut self, command: Command) -> Result<[u8; FRAME_SIZE]> {
        let timeout = self.config.receive_timeout;
        let transport = &mut self.transport;
        let sequence = &mut self.sequence;
        let buf = self
            .config
            .retry
            .run(&format!("receive {command} response"), || {
                let mut buf = [0u8; FRAME_SIZE];
                transport.receive(&mut buf, timeout)?;
                let actual = gnp::sequence(&buf).unwrap_or_default();
                sequence.accept(actual)?;
                Ok(buf)
            })?;
        trace!("GNP <- {:02x?}", &buf[..gnp::HEADER_SIZE]);
        Ok(buf)
    }

    fn receive_notification(&mut self, timeout: Duration, what: &str) -> Result<[u8; FRAME_SIZE]> {
        let transport = &mut self.transport;
        self.config
            .retry
            .run(&format!("receive {what} notification"), || {
                let mut buf = [0u8; FRAME_SIZE];
                transport.receive(&mut buf, timeout)?;
                Ok(buf)
            })
    }

    fn transact(&mut self, frame: &CommandFrame) -> Result<[u8; FRAME_SIZE]> {
        self.send_frame(frame)?;
        self.receive_sequenced(frame.command())
    }

    fn write_command(&mut self, frame: &CommandFrame) -> Result<()> {
        let response = self.transact(frame)?;
        gnp::check_status(&response, frame.command())
    }

    /// Read the running firmware version.
    ///
    /// The status byte is part of the version payload here and is not checked.
    pub fn read_version(&mut self) -> Result<String> {
        let frame = CommandFrame::read_version(self.expected_sequence());
        let response = self.transact(&frame)?;
        let version = gnp::version_string(&response)?;
        debug!("Device reports version {version}");
        Ok(version)
    }

    /// Select the flash partition the next update targets.
    pub fn write_partition(&mut self, partition: u8) -> Result<()> {
        debug!("Selecting partition {partition}");
        let frame = CommandFrame::write_partition(self.expected_sequence(), partition);
        self.write_command(&frame)
    }

    /// Start the update.
    pub fn start(&mut self) -> Result<()> {
        let frame = CommandFrame::start(self.expected_sequence());
        self.write_command(&frame)
    }

    /// Wait for the device to report the partition erased.
    pub fn wait_erase_done(&mut self) -> Result<()> {
        info!("Waiting for flash erase");
        let buf = self.receive_notification(self.config.erase_timeout, "erase")?;
        gnp::expect_pattern(&buf, &ERASE_DONE_PATTERN, "erase")
    }

    /// Announce the image CRC, chunk count and acknowledgment window.
    pub fn write_crc(&mut self, crc: u32, total_chunks: u16, preload_count: u16) -> Result<()> {
        debug!("Announcing CRC 0x{crc:08x}, {total_chunks} chunks, window {preload_count}");
        let frame =
            CommandFrame::write_crc(self.expected_sequence(), crc, total_chunks, preload_count);
        self.write_command(&frame)
    }

    /// Send a single chunk. Chunks are not acknowledged individually.
    pub fn write_chunk(&mut self, index: u16, data: &[u8]) -> Result<()> {
        let frame = CommandFrame::write_chunk(index, data)?;
        self.send_frame(&frame)
    }

    fn wait_chunk_ack(&mut self, index: u16) -> Result<()> {
        let buf = self.receive_notification(self.config.long_timeout, "chunk acknowledgment")?;
        gnp::expect_pattern(&buf, &CHUNK_ACK_PATTERN, "chunk acknowledgment")?;
        match gnp::echoed_chunk_index(&buf) {
            Some(echoed) if echoed == index => Ok(()),
            _ => Err(Error::mismatch(
                format!("acknowledgment does not match chunk {index}"),
                &buf[gnp::HEADER_SIZE..gnp::HEADER_SIZE + 2],
            )),
        }
    }

    /// Stream the whole image in chunks.
    ///
    /// After every chunk whose index is a multiple of the configured window
    /// the device must acknowledge that chunk by index before streaming
    /// continues. `progress` receives the chunks sent so far and the total.
    pub fn write_chunks(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let chunks = image.chunks(self.config.chunk_size)?;
        let total = chunks.len();
        let window = usize::from(self.config.preload_count.max(1));

        for chunk in &chunks {
            self.check_interrupted()?;
            let index = u16::try_from(chunk.index).map_err(|_| {
                Error::InvalidFirmware(format!("chunk index {} exceeds 16 bits", chunk.index))
            })?;
            self.write_chunk(index, chunk.data)
                .map_err(|e| e.in_phase(format!("chunk {index}")))?;
            if chunk.index % window == 0 {
                trace!("Waiting for acknowledgment of chunk {index}");
                self.wait_chunk_ack(index)?;
            }
            progress(chunk.index + 1, total);
        }
        Ok(())
    }

    /// Wait for the device to report the written image verified.
    pub fn read_verify_status(&mut self) -> Result<()> {
        let buf = self.receive_notification(self.config.long_timeout, "verify")?;
        gnp::expect_pattern(&buf, &VERIFY_OK_PATTERN, "verify")
    }

    /// Commit the version triplet of the new image.
    pub fn write_version(&mut self, version: [u8; 3]) -> Result<()> {
        debug!(
            "Committing version {}.{}.{}",
            version[0], version[1], version[2]
        );
        let frame = CommandFrame::write_version(self.expected_sequence(), version);
        self.write_command(&frame)
    }

    /// Ask the device to boot the image held in serial flash.
    pub fn write_dfu_from_squif(&mut self) -> Result<()> {
        let frame = CommandFrame::dfu_from_squif(self.expected_sequence());
        self.write_command(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::transport::HidReportTransport;
    use crate::transport::mock::MockBackend;

    fn fast_config() -> GnpConfig {
        GnpConfig::default().with_retry(RetryPolicy::default().with_delay(Duration::ZERO))
    }

    fn engine(backend: &MockBackend) -> CommandEngine<HidReportTransport<MockBackend>> {
        CommandEngine::new(HidReportTransport::new(backend.clone(), 3), fast_config())
            .with_interrupt_check(|| false)
    }

    #[test]
    fn test_read_version() {
        let mut backend = MockBackend::hid_dock();
        backend.push_read(testutil::version(0, "v1.0"));
        let mut engine = engine(&backend);

        assert_eq!(engine.read_version().unwrap(), "v1.0");
        assert_eq!(engine.expected_sequence(), 1);
        assert_eq!(
            &backend.sent_frames()[0][..7],
            &[0x05, 0x08, 0x00, 0x00, 0x46, 0x02, 0x03]
        );
    }

    #[test]
    fn test_read_version_empty_string() {
        let mut backend = MockBackend::hid_dock();
        backend.push_read(testutil::ok(0));
        let mut engine = engine(&backend);

        assert!(matches!(engine.read_version(), Err(Error::InternalState(_))));
    }

    #[test]
    fn test_write_partition_rejected() {
        let mut backend = MockBackend::hid_dock();
        backend.push_read(testutil::status(0, 0x00, 0x42));
        let mut engine = engine(&backend);

        match engine.write_partition(1).unwrap_err() {
            Error::ProtocolMismatch { bytes, .. } => assert_eq!(bytes, vec![0x00, 0x42]),
            other => panic!("unexpected error: {other:?}"),
        }
        // The response itself matched, so the counter still moved on.
        assert_eq!(engine.expected_sequence(), 1);
    }

    #[test]
    fn test_requests_carry_expected_sequence() {
        let mut backend = MockBackend::hid_dock();
        backend.push_read(testutil::ok(5));
        backend.push_read(testutil::ok(6));
        let mut engine = engine(&backend).with_sequence(5);

        engine.write_partition(2).unwrap();
        engine.start().unwrap();

        let frames = backend.sent_frames();
        assert_eq!(frames[0][3], 5);
        assert_eq!(frames[1][3], 6);
        assert_eq!(engine.expected_sequence(), 7);
    }

    #[test]
    fn test_stale_response_is_skipped() {
        let mut backend = MockBackend::hid_dock();
        backend.push_read(testutil::ok(0x06));
        backend.push_read(testutil::ok(0x07));
        let mut engine = engine(&backend).with_sequence(7);

        engine.start().unwrap();
        assert_eq!(engine.expected_sequence(), 8);
        // One request, two reads.
        assert_eq!(backend.sent_frames().len(), 1);
        assert_eq!(backend.pending_reads(), 0);
    }

    #[test]
    fn test_persistent_sequence_mismatch_fails() {
        let mut backend = MockBackend::hid_dock();
        for _ in 0..3 {
            backend.push_read(testutil::ok(0x09));
        }
        let mut engine = engine(&backend).with_sequence(7);

        let err = engine.start().unwrap_err();
        assert!(matches!(
            err,
            Error::SequenceMismatch {
                expected: 7,
                actual: 9
            }
        ));
        assert_eq!(engine.expected_sequence(), 7);
    }

    #[test]
    fn test_send_retries_transient_failure() {
        let mut backend = MockBackend::hid_dock();
        backend.fail_next_writes(2);
        backend.push_read(testutil::ok(0));
        let mut engine = engine(&backend);

        engine.start().unwrap();
        assert_eq!(backend.sent_frames().len(), 1);
    }

    #[test]
    fn test_send_gives_up_after_budget() {
        let mut backend = MockBackend::hid_dock();
        backend.fail_next_writes(3);
        let mut engine = engine(&backend);

        assert!(matches!(engine.start(), Err(Error::TransportWrite(_))));
        assert!(backend.read_timeouts().is_empty());
    }

    #[test]
    fn test_receive_retries_read_error() {
        let mut backend = MockBackend::hid_dock();
        backend.push_read_error("babble");
        backend.push_read(testutil::ok(0));
        let mut engine = engine(&backend);

        engine.start().unwrap();
    }

    #[test]
    fn test_erase_uses_long_timeout() {
        let mut backend = MockBackend::hid_dock();
        backend.push_read(testutil::erase_done());
        let mut engine = engine(&backend);

        engine.wait_erase_done().unwrap();
        assert_eq!(backend.read_timeouts(), vec![Duration::from_secs(60)]);
    }

    #[test]
    fn test_erase_wrong_notification() {
        let mut backend = MockBackend::hid_dock();
        backend.push_read(testutil::verify_ok());
        let mut engine = engine(&backend);

        assert!(matches!(
            engine.wait_erase_done(),
            Err(Error::ProtocolMismatch { .. })
        ));
    }

    #[test]
    fn test_write_chunks_waits_at_window_boundaries() {
        let mut backend = MockBackend::hid_dock();
        backend.push_read(testutil::chunk_ack(0));
        backend.push_read(testutil::chunk_ack(100));
        backend.push_read(testutil::chunk_ack(200));
        let mut engine = engine(&backend);
        let image = FirmwareImage::from_bytes(vec![0x5A; 250 * 52]).unwrap();
        let mut last = (0, 0);

        engine
            .write_chunks(&image, &mut |done, total| last = (done, total))
            .unwrap();

        assert_eq!(last, (250, 250));
        assert_eq!(backend.sent_frames().len(), 250);
        assert_eq!(backend.read_timeouts().len(), 3);
        assert_eq!(backend.pending_reads(), 0);
    }

    #[test]
    fn test_write_chunks_frames() {
        let mut backend = MockBackend::hid_dock();
        backend.push_read(testutil::chunk_ack(0));
        let mut engine = engine(&backend);
        let image = FirmwareImage::from_bytes(vec![0x11; 60]).unwrap();

        engine
            .write_chunks(&image, &mut |_, _| {})
            .unwrap();

        let frames = backend.sent_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..11], &[0x05, 0x08, 0x00, 0x00, 0x3E, 0x0F, 0x19, 0, 0, 52, 0]);
        assert_eq!(&frames[1][7..11], &[1, 0, 8, 0]);
        assert_eq!(frames[1][4], 8 + 10);
    }

    #[test]
    fn test_write_chunks_wrong_echo() {
        let mut backend = MockBackend::hid_dock();
        backend.push_read(testutil::chunk_ack(1));
        let mut engine = engine(&backend);
        let image = FirmwareImage::from_bytes(vec![0x11; 10]).unwrap();

        assert!(matches!(
            engine.write_chunks(&image, &mut |_, _| {}),
            Err(Error::ProtocolMismatch { .. })
        ));
    }

    #[test]
    fn test_write_chunks_interrupted() {
        let backend = MockBackend::hid_dock();
        let mut engine = engine(&backend).with_interrupt_check(|| true);
        let image = FirmwareImage::from_bytes(vec![0x11; 10]).unwrap();

        assert!(matches!(
            engine.write_chunks(&image, &mut |_, _| {}),
            Err(Error::Interrupted)
        ));
        assert!(backend.sent_frames().is_empty());
    }

    #[test]
    fn test_verify_and_version() {
        let mut backend = MockBackend::hid_dock();
        backend.push_read(testutil::verify_ok());
        backend.push_read(testutil::ok(0));
        let mut engine = engine(&backend);

        engine.read_verify_status().unwrap();
        engine.write_version([1, 2, 3]).unwrap();
        assert_eq!(
            &backend.sent_frames()[0][..10],
            &[0x05, 0x08, 0x00, 0x00, 0x89, 0x0F, 0x1E, 1, 2, 3]
        );
    }

    #[test]
    fn test_dfu_from_squif() {
        let mut backend = MockBackend::hid_dock();
        backend.push_read(testutil::ok(0));
        let mut engine = engine(&backend);

        engine.write_dfu_from_squif().unwrap();
        assert_eq!(backend.sent_frames()[0][6], 0x1D);
    }
}
