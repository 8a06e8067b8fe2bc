//! Wire protocols.
//!
//! Pure encode/decode logic with no I/O: the interrupt-protocol frame codec
//! and sequence tracking used by headset docks, the bulk TLV codec used by
//! camera bars, and the checksums both rely on.

pub mod crc;
pub mod gnp;
pub mod sequence;
pub mod upd;
