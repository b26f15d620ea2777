//! Pump authentication password.
//!
//! The pump accepts a 16-byte MD5 of its own MAC address concatenated
//! with a fixed salt, written to the auth characteristic with an
//! acknowledged write. The pump needs a short settle delay afterwards
//! before it accepts further operations.

use std::time::Duration;

use md5::{Digest, Md5};

/// Salt appended to the 6 MAC bytes before hashing.
pub const AUTH_SALT: [u8; 10] = [0x4F, 0xC2, 0x45, 0x4D, 0x9B, 0x81, 0x59, 0xA4, 0x93, 0xBB];

/// Settle time after a successful password write.
pub const AUTH_SETTLE: Duration = Duration::from_millis(200);

/// Compute the authentication password for a pump MAC.
pub fn auth_password(mac: &[u8; 6]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(mac);
    hasher.update(AUTH_SALT);
    hasher.finalize().into()
}
