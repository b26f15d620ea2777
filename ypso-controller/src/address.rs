//! MAC and BT-address derivation from the pump serial.
//!
//! The pump's MAC is its serial number (modulo the 8-digit rollover)
//! behind a fixed `EC:2A:F0` OUI. The relay wants the same six bytes
//! rather than the display string.

/// Display MAC for a decimal serial, e.g. `10175983` → `EC:2A:F0:02:AF:6F`.
pub fn mac_from_serial(serial: u64) -> String {
    let mut n = serial;
    if n > 10_000_000 {
        n -= 10_000_000;
    }
    format!(
        "EC:2A:F0:{:02X}:{:02X}:{:02X}",
        (n >> 16) & 0xFF,
        (n >> 8) & 0xFF,
        n & 0xFF
    )
}

/// The six raw address bytes sent to the relay.
pub fn bt_address_bytes(serial: u64) -> [u8; 6] {
    let n = serial % 10_000_000;
    [
        0xEC,
        0x2A,
        0xF0,
        ((n >> 16) & 0xFF) as u8,
        ((n >> 8) & 0xFF) as u8,
        (n & 0xFF) as u8,
    ]
}

/// Parse a colon-separated MAC into its six bytes.
pub fn parse_mac(mac: &str) -> Option<[u8; 6]> {
    let mut bytes = [0u8; 6];
    let mut parts = mac.split(':');
    for byte in &mut bytes {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(bytes)
}
