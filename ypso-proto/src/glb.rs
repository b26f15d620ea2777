//! Self-checking 8-byte value codec.
//!
//! Several pump characteristics (TBR, settings, history counts) carry a
//! 32-bit integer followed by its bitwise complement, both little-endian.
//! A mismatch between the two halves means the value was corrupted in
//! transit and must not be acted on.

use thiserror::Error;

/// Sentinel the pump stores in unprogrammed setting slots.
pub const UNPROGRAMMED: i32 = -1;

/// Integrity check on the value/complement pair failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("self-check value corrupt")]
pub struct GlbCorrupt;

/// Encode `value` as `value_LE ‖ (!value)_LE`.
pub fn encode(value: i32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&value.to_le_bytes());
    out[4..].copy_from_slice(&(!value).to_le_bytes());
    out
}

/// Decode the first 8 bytes of `bytes`, checking value against complement.
pub fn decode(bytes: &[u8]) -> Result<i32, GlbCorrupt> {
    if bytes.len() < 8 {
        return Err(GlbCorrupt);
    }
    let value = u32::from_le_bytes(bytes[..4].try_into().unwrap());
    let complement = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if value ^ complement != 0xFFFF_FFFF {
        return Err(GlbCorrupt);
    }
    Ok(value as i32)
}

/// Scan every 8-byte window and return the first value that decodes.
///
/// Some decrypted responses embed the value at an offset that varies by
/// firmware; the complement makes a false positive effectively impossible.
pub fn find_in(bytes: &[u8]) -> Option<i32> {
    bytes
        .windows(8)
        .find_map(|window| decode(window).ok())
}
