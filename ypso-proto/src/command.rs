//! Builders for the pump's command payloads.
//!
//! These produce the raw bytes written to a characteristic before the
//! CRC trailer and encryption are applied. Dose amounts are carried as
//! centi-units (hundredths of an insulin unit) throughout.

use thiserror::Error;

use crate::glb;

/// Largest bolus the pump accepts, in centi-units (25.00 U).
pub const MAX_BOLUS_CENTI: u32 = 2500;

/// Highest TBR percentage the pump accepts.
pub const MAX_TBR_PERCENT: u32 = 200;

/// Longest TBR duration in minutes (24 h), always a multiple of 15.
pub const MAX_TBR_DURATION_MIN: u32 = 1440;

// Setting slot indices
pub const SETTING_ACTIVE_PROGRAM: i32 = 1;
pub const PROGRAM_A_SELECTOR: i32 = 3;
pub const PROGRAM_B_SELECTOR: i32 = 10;
pub const PROGRAM_A_BASE_INDEX: i32 = 14;
pub const PROGRAM_B_BASE_INDEX: i32 = 38;
pub const BASAL_SLOTS: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("invalid calendar date {year:04}-{month:02}-{day:02}")]
    InvalidDate { year: u16, month: u8, day: u8 },
    #[error("invalid time of day {hour:02}:{minute:02}:{second:02}")]
    InvalidTime { hour: u8, minute: u8, second: u8 },
}

/// Which of the two bolus delivery blocks a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BolusKind {
    /// Immediate delivery; the pump calls this type 1.
    Fast = 1,
    /// Extended or combo delivery over a duration; type 2.
    Extended = 2,
}

/// Build the 13-byte bolus start command.
///
/// A zero duration selects a fast bolus (the immediate part is implied
/// by the total and zeroed on the wire); any other duration selects an
/// extended/combo bolus. Totals clamp to `1..=MAX_BOLUS_CENTI` and the
/// immediate part clamps to the total.
pub fn bolus_start_payload(total_centi: u32, duration_min: u32, immediate_centi: u32) -> [u8; 13] {
    let total = total_centi.clamp(1, MAX_BOLUS_CENTI);
    let (kind, immediate) = if duration_min == 0 {
        (BolusKind::Fast, 0)
    } else {
        (BolusKind::Extended, immediate_centi.min(total))
    };

    let mut out = [0u8; 13];
    out[..4].copy_from_slice(&total.to_le_bytes());
    out[4..8].copy_from_slice(&duration_min.to_le_bytes());
    out[8..12].copy_from_slice(&immediate.to_le_bytes());
    out[12] = kind as u8;
    out
}

/// Build the 13-byte cancel command for one bolus block: all zeros with
/// the type selector in the last byte.
pub fn bolus_cancel_payload(kind: BolusKind) -> [u8; 13] {
    let mut out = [0u8; 13];
    out[12] = kind as u8;
    out
}

/// Build the 16-byte TBR command: self-checked percent followed by
/// self-checked duration.
///
/// Percent is raw (25 means 25%) and clamps to `0..=200`; the duration
/// clamps to `0..=1440` and snaps down to the pump's 15-minute grid.
/// Cancelling a TBR is `tbr_payload(100, 0)`.
pub fn tbr_payload(percent: u32, duration_min: u32) -> [u8; 16] {
    let percent = percent.min(MAX_TBR_PERCENT);
    let duration = duration_min.min(MAX_TBR_DURATION_MIN) / 15 * 15;

    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&glb::encode(percent as i32));
    out[8..].copy_from_slice(&glb::encode(duration as i32));
    out
}

/// Build the 4-byte date payload. Written before the time payload.
pub fn date_sync_payload(year: u16, month: u8, day: u8) -> Result<[u8; 4], CommandError> {
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(CommandError::InvalidDate { year, month, day });
    }
    let mut out = [0u8; 4];
    out[..2].copy_from_slice(&year.to_le_bytes());
    out[2] = month;
    out[3] = day;
    Ok(out)
}

/// Build the 3-byte time payload. Written after the date succeeds.
pub fn time_sync_payload(hour: u8, minute: u8, second: u8) -> Result<[u8; 3], CommandError> {
    if hour > 23 || minute > 59 || second > 59 {
        return Err(CommandError::InvalidTime { hour, minute, second });
    }
    Ok([hour, minute, second])
}

/// Self-checked setting or history index payload.
pub fn setting_index_payload(index: i32) -> [u8; 8] {
    glb::encode(index)
}

/// Setting slot for hour `hour` (0..23) of basal program A or B.
pub fn basal_slot_index(base: i32, hour: usize) -> i32 {
    base + hour as i32
}

/// Convert a raw basal/setting value to units per hour; the pump stores
/// `-1` in slots that were never programmed.
pub fn basal_rate_from_raw(raw: i32) -> f64 {
    if raw == glb::UNPROGRAMMED {
        0.0
    } else {
        f64::from(raw) / 100.0
    }
}

/// Convert insulin units to the centi-unit wire representation.
pub fn units_to_centi(units: f64) -> u32 {
    (units * 100.0).round().max(0.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_bolus_two_units() {
        let payload = bolus_start_payload(units_to_centi(2.0), 0, 0);
        assert_eq!(
            payload,
            [0xC8, 0x00, 0x00, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0x01]
        );

        let framed = crate::crc::append_crc(&payload);
        assert_eq!(framed.len(), 15);
    }

    #[test]
    fn extended_bolus_keeps_immediate_part() {
        let payload = bolus_start_payload(500, 120, 200);
        assert_eq!(u32::from_le_bytes(payload[..4].try_into().unwrap()), 500);
        assert_eq!(u32::from_le_bytes(payload[4..8].try_into().unwrap()), 120);
        assert_eq!(u32::from_le_bytes(payload[8..12].try_into().unwrap()), 200);
        assert_eq!(payload[12], 2);
    }

    #[test]
    fn bolus_clamps() {
        let payload = bolus_start_payload(9000, 60, 9000);
        assert_eq!(
            u32::from_le_bytes(payload[..4].try_into().unwrap()),
            MAX_BOLUS_CENTI
        );
        assert_eq!(
            u32::from_le_bytes(payload[8..12].try_into().unwrap()),
            MAX_BOLUS_CENTI
        );

        let payload = bolus_start_payload(0, 0, 0);
        assert_eq!(u32::from_le_bytes(payload[..4].try_into().unwrap()), 1);
    }

    #[test]
    fn cancel_is_zeroes_plus_type() {
        let payload = bolus_cancel_payload(BolusKind::Fast);
        assert_eq!(&payload[..12], &[0u8; 12]);
        assert_eq!(payload[12], 0x01);
        assert_eq!(bolus_cancel_payload(BolusKind::Extended)[12], 0x02);
    }

    #[test]
    fn tbr_fifty_percent_half_hour() {
        assert_eq!(
            tbr_payload(50, 30),
            [
                0x32, 0x00, 0x00, 0x00, 0xCD, 0xFF, 0xFF, 0xFF, //
                0x1E, 0x00, 0x00, 0x00, 0xE1, 0xFF, 0xFF, 0xFF,
            ]
        );
    }

    #[test]
    fn tbr_clamps_and_snaps() {
        let payload = tbr_payload(250, 44);
        assert_eq!(crate::glb::decode(&payload[..8]), Ok(200));
        assert_eq!(crate::glb::decode(&payload[8..]), Ok(30));
    }

    #[test]
    fn date_and_time_validation() {
        assert_eq!(date_sync_payload(2024, 6, 15), Ok([0xE8, 0x07, 6, 15]));
        assert!(date_sync_payload(2024, 13, 1).is_err());
        assert!(date_sync_payload(2024, 0, 1).is_err());
        assert_eq!(time_sync_payload(23, 59, 59), Ok([23, 59, 59]));
        assert!(time_sync_payload(24, 0, 0).is_err());
    }

    #[test]
    fn basal_rate_normalization() {
        assert_eq!(basal_rate_from_raw(125), 1.25);
        assert_eq!(basal_rate_from_raw(-1), 0.0);
        assert_eq!(basal_rate_from_raw(0), 0.0);
    }

    #[test]
    fn program_slot_indices() {
        assert_eq!(basal_slot_index(PROGRAM_A_BASE_INDEX, 0), 14);
        assert_eq!(basal_slot_index(PROGRAM_A_BASE_INDEX, 23), 37);
        assert_eq!(basal_slot_index(PROGRAM_B_BASE_INDEX, 23), 61);
    }
}
