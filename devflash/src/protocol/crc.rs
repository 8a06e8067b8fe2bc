//! Checksums used by the update protocols.

/// CRC-32 (ISO-HDLC, as used by zlib and Ethernet) of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Exchange the upper and lower 16-bit halves of a CRC.
///
/// The dock's bootloader compares against the CRC in this word order.
pub fn swap_halves(crc: u32) -> u32 {
    crc.rotate_left(16)
}
