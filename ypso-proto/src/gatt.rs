//! GATT characteristic UUIDs exposed by the pump.
//!
//! All vendor characteristics share the `669a0c20-0008-969e-e211-` prefix;
//! only the trailing 48 bits differ. Device information (serial, firmware,
//! manufacturer, model) uses the Bluetooth SIG 16-bit assigned numbers.

use uuid::Uuid;

/// Advertised device names start with this prefix followed by the
/// decimal serial number.
pub const DEVICE_NAME_PREFIX: &str = "YpsoPump_";

// Plaintext characteristics
pub const CHAR_AUTH_PASSWORD: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbeb2147bc5);
pub const CHAR_MASTER_VERSION: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbeb0147bc5);
pub const CHAR_BOLUS_NOTIFICATION: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbee58b7bc5);

// Encrypted command/response characteristics
pub const CHAR_SYSTEM_DATE: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbedc3b7bc5);
pub const CHAR_SYSTEM_TIME: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbedd3b7bc5);
pub const CHAR_BOLUS_START_STOP: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbee18b7bc5);
pub const CHAR_BOLUS_STATUS: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbee28b7bc5);
pub const CHAR_TBR_START_STOP: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbee38b7bc5);
pub const CHAR_SYSTEM_STATUS: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbee48b7bc5);
pub const CHAR_SECURITY_STATUS: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbee08b7bc5);
pub const CHAR_SETTING_ID: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbeb3147bc5);
pub const CHAR_SETTING_VALUE: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbeb4147bc5);

/// Continuation frames of every multi-frame encrypted response are read
/// from this characteristic, whatever characteristic the first frame
/// came from.
pub const CHAR_EXTENDED_READ: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcff000000ff);

// Key exchange (plaintext carriers)
pub const CHAR_KEY_READ: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcff0000000a);
pub const CHAR_KEY_WRITE: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcff0000000b);

// History streams: count (read), index (write), value (read)
pub const CHAR_EVENTS_COUNT: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbecb3b7bc5);
pub const CHAR_EVENTS_INDEX: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbecc3b7bc5);
pub const CHAR_EVENTS_VALUE: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbecd3b7bc5);
pub const CHAR_ALERTS_COUNT: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbec83b7bc5);
pub const CHAR_ALERTS_INDEX: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbec93b7bc5);
pub const CHAR_ALERTS_VALUE: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbeca3b7bc5);
pub const CHAR_SYSTEM_HISTORY_COUNT: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbece3b7bc5);
pub const CHAR_SYSTEM_HISTORY_INDEX: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbecf3b7bc5);
pub const CHAR_SYSTEM_HISTORY_VALUE: Uuid = Uuid::from_u128(0x669a0c20_0008_969e_e211_fcbed03b7bc5);

// Bluetooth SIG device information characteristics (read plain)
pub const CHAR_SERIAL_NUMBER: Uuid = Uuid::from_u128(0x00002a25_0000_1000_8000_00805f9b34fb);
pub const CHAR_FIRMWARE_REVISION: Uuid = Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb);
pub const CHAR_MANUFACTURER_NAME: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);
pub const CHAR_MODEL_NUMBER: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_characteristics_share_prefix() {
        for uuid in [
            CHAR_AUTH_PASSWORD,
            CHAR_SYSTEM_STATUS,
            CHAR_BOLUS_START_STOP,
            CHAR_EXTENDED_READ,
            CHAR_KEY_READ,
            CHAR_EVENTS_COUNT,
        ] {
            assert!(uuid.to_string().starts_with("669a0c20-0008-969e-e211-"));
        }
    }
}
