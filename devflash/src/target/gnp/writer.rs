//! Partition update sequence for GN interrupt-protocol docks.
//!
//! One pass over a partition walks these phases in order, aborting at the
//! first failure:
//!
//! ```text
//! SelectPartition -> Erasing -> SendCrc -> StreamChunks -> Verifying -> CommitVersion -> Done
//! ```
//!
//! Errors are wrapped with the phase that produced them so the caller can
//! tell an erase timeout from a rejected CRC.

use super::engine::CommandEngine;
use super::GnpWriteOptions;
use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::protocol::crc;
use crate::transport::Transport;
use log::info;
use std::fmt;

/// Where a partition write currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePhase {
    /// Selecting the target partition and starting the update.
    SelectPartition,
    /// Waiting for the erase to finish.
    Erasing,
    /// Announcing the image CRC.
    SendCrc,
    /// Streaming chunks.
    StreamChunks,
    /// Waiting for verification.
    Verifying,
    /// Committing the version triplet.
    CommitVersion,
    /// Finished.
    Done,
}

impl WritePhase {
    /// The phase that follows this one.
    pub fn next(self) -> Self {
        match self {
            Self::SelectPartition => Self::Erasing,
            Self::Erasing => Self::SendCrc,
            Self::SendCrc => Self::StreamChunks,
            Self::StreamChunks => Self::Verifying,
            Self::Verifying => Self::CommitVersion,
            Self::CommitVersion | Self::Done => Self::Done,
        }
    }
}

impl fmt::Display for WritePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelectPartition => write!(f, "select partition"),
            Self::Erasing => write!(f, "erase"),
            Self::SendCrc => write!(f, "send CRC"),
            Self::StreamChunks => write!(f, "write chunks"),
            Self::Verifying => write!(f, "verify"),
            Self::CommitVersion => write!(f, "commit version"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Drives one or more partition passes through a [`CommandEngine`].
pub struct FirmwareWriter<'a, T: Transport> {
    engine: &'a mut CommandEngine<T>,
    phase: WritePhase,
}

impl<'a, T: Transport> FirmwareWriter<'a, T> {
    /// Create a writer on an open engine.
    pub fn new(engine: &'a mut CommandEngine<T>) -> Self {
        Self {
            engine,
            phase: WritePhase::SelectPartition,
        }
    }

    /// Phase reached so far.
    pub fn phase(&self) -> WritePhase {
        self.phase
    }

    /// Write `image` to every partition in `options`, in order.
    ///
    /// The version triplet is required up front; nothing is sent to the
    /// device without it. `progress` receives a step name, the current
    /// position and the total.
    pub fn write(
        &mut self,
        image: &FirmwareImage,
        options: &GnpWriteOptions,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        let version = options
            .version
            .ok_or_else(|| Error::InternalState("firmware version triplet is required".into()))?;
        if options.partitions.is_empty() {
            return Err(Error::InternalState("no partition selected".into()));
        }

        let chunk_size = self.engine.config().chunk_size;
        let total_chunks = u16::try_from(image.chunk_count(chunk_size)).map_err(|_| {
            Error::InvalidFirmware(format!(
                "image of {} bytes needs more than {} chunks",
                image.len(),
                u16::MAX
            ))
        })?;
        let crc = crc::swap_halves(image.crc32());

        for &partition in &options.partitions {
            self.phase = WritePhase::SelectPartition;
            info!(
                "Writing {} bytes to partition {partition} ({total_chunks} chunks)",
                image.len()
            );
            self.write_partition(partition, image, crc, total_chunks, version, progress)
                .map_err(|e| e.in_phase(format!("partition {partition}: {}", self.phase)))?;
        }
        Ok(())
    }

    fn enter(&mut self, phase: WritePhase) -> Result<()> {
        self.engine.check_interrupted()?;
        self.phase = phase;
        Ok(())
    }

    fn write_partition(
        &mut self,
        partition: u8,
        image: &FirmwareImage,
        crc: u32,
        total_chunks: u16,
        version: [u8; 3],
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        self.enter(WritePhase::SelectPartition)?;
        self.engine.write_partition(partition)?;
        self.engine.start()?;

        self.enter(self.phase.next())?;
        progress("erase", 0, 1);
        self.engine.wait_erase_done()?;
        progress("erase", 1, 1);

        self.enter(self.phase.next())?;
        let preload_count = self.engine.config().preload_count;
        self.engine
            .write_crc(crc, total_chunks, preload_count)?;

        self.enter(self.phase.next())?;
        self.engine
            .write_chunks(image, &mut |done, total| progress("write", done, total))?;

        self.enter(self.phase.next())?;
        progress("verify", 0, 1);
        self.engine.read_verify_status()?;
        progress("verify", 1, 1);

        self.enter(self.phase.next())?;
        self.engine.write_version(version)?;

        self.phase = WritePhase::Done;
        info!("Partition {partition} written");
        Ok(())
    }
}
