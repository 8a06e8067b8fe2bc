//! Firmware image handling.
//!
//! A [`FirmwareImage`] is the opaque payload handed to a device writer. It is
//! immutable once loaded; writers borrow it and slice it into [`Chunk`]s.

use crate::error::{Error, Result};
use crate::protocol::crc;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use log::debug;
use md5::{Digest, Md5};
use std::fs;
use std::path::Path;

/// Raw firmware bytes to be written to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

/// One bounded slice of a firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Zero-based chunk index.
    pub index: usize,
    /// Byte offset of this chunk within the image.
    pub offset: usize,
    /// Chunk payload.
    pub data: &'a [u8],
}

impl FirmwareImage {
    /// Wrap an in-memory image. Empty images are rejected.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Result<Self> {
        let data = data.into();
        if data.is_empty() {
            return Err(Error::InvalidFirmware("image is empty".into()));
        }
        Ok(Self { data })
    }

    /// Read an image from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        debug!("Loaded {} ({} bytes)", path.display(), data.len());
        Self::from_bytes(data)
    }

    /// Image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always `false`; empty images cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of chunks of `chunk_size` needed to cover the image.
    pub fn chunk_count(&self, chunk_size: usize) -> usize {
        if chunk_size == 0 {
            return 0;
        }
        self.data.len().div_ceil(chunk_size)
    }

    /// Split the image into consecutive chunks of at most `chunk_size` bytes.
    ///
    /// Chunks are yielded in index order starting at 0 and cover the image
    /// exactly once. Only the last chunk may be shorter.
    pub fn chunks(&self, chunk_size: usize) -> Result<Vec<Chunk<'_>>> {
        if chunk_size == 0 {
            return Err(Error::InternalState("chunk size must be non-zero".into()));
        }
        Ok(self
            .data
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, data)| Chunk {
                index,
                offset: index * chunk_size,
                data,
            })
            .collect())
    }

    /// CRC-32 of the whole image.
    pub fn crc32(&self) -> u32 {
        crc::crc32(&self.data)
    }

    /// Base64 encoded MD5 digest of the whole image.
    pub fn md5_base64(&self) -> String {
        let digest = Md5::digest(&self.data);
        BASE64.encode(digest)
    }
}

impl TryFrom<Vec<u8>> for FirmwareImage {
    type Error = Error;

    fn try_from(data: Vec<u8>) -> Result<Self> {
        Self::from_bytes(data)
    }
}
