//! Parsers for the pump's decrypted status responses.

use thiserror::Error;

use crate::crc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("response too short: got {got} bytes, need {need}")]
    TooShort { need: usize, got: usize },
}

/// What the pump is currently delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Stopped,
    Basal,
    Tbr,
    FastBolus,
    ExtendedBolus,
    BolusAndBasal,
    Priming,
    Paused,
    Unknown(u8),
}

impl From<u8> for DeliveryMode {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Self::Stopped,
            1 => Self::Basal,
            2 => Self::Tbr,
            3 => Self::FastBolus,
            4 => Self::ExtendedBolus,
            5 => Self::BolusAndBasal,
            6 => Self::Priming,
            7 => Self::Paused,
            other => Self::Unknown(other),
        }
    }
}

/// 6-byte System Status response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemStatus {
    pub mode: DeliveryMode,
    /// Remaining reservoir insulin in units.
    pub insulin_units: f64,
    /// Battery charge, 0..=100.
    pub battery_percent: u8,
}

impl SystemStatus {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < 6 {
            return Err(ParseError::TooShort { need: 6, got: data.len() });
        }
        let centi = u32::from_le_bytes(data[1..5].try_into().unwrap());
        Ok(Self {
            mode: DeliveryMode::from(data[0]),
            insulin_units: f64::from(centi) / 100.0,
            battery_percent: data[5],
        })
    }
}

/// State byte of a bolus block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BolusState {
    Idle,
    Delivering,
    Cancelled,
    Completed,
    Unknown(u8),
}

impl BolusState {
    /// Delivery is over; anything that is neither idle nor delivering.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Idle | Self::Delivering)
    }
}

impl From<u8> for BolusState {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Delivering,
            3 => Self::Cancelled,
            4 => Self::Completed,
            other => Self::Unknown(other),
        }
    }
}

/// Fast-bolus block of the Bolus Status response (first 13 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BolusBlock {
    pub state: BolusState,
    pub sequence: u32,
    pub injected_centi: u32,
    pub total_centi: u32,
}

/// Extended/combo block, present only when the pump sends all 42 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedBolusBlock {
    pub state: BolusState,
    pub sequence: u32,
    pub injected_centi: u32,
    pub total_centi: u32,
    pub fast_part_injected_centi: u32,
    pub fast_part_total_centi: u32,
    pub actual_duration_min: u32,
    pub total_duration_min: u32,
}

/// Bolus Status response: fast block, then an optional extended block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BolusStatus {
    pub fast: BolusBlock,
    /// Extended-block state byte, when the response carried one.
    pub extended_state: Option<BolusState>,
    pub extended: Option<ExtendedBolusBlock>,
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
}

impl BolusStatus {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < 13 {
            return Err(ParseError::TooShort { need: 13, got: data.len() });
        }

        let fast = BolusBlock {
            state: BolusState::from(data[0]),
            sequence: read_u32(data, 1),
            injected_centi: read_u32(data, 5),
            total_centi: read_u32(data, 9),
        };

        let extended_state = (data.len() >= 14).then(|| BolusState::from(data[13]));
        let extended = match extended_state {
            Some(state) if data[13] != 0 && data.len() >= 42 => Some(ExtendedBolusBlock {
                state,
                sequence: read_u32(data, 14),
                injected_centi: read_u32(data, 18),
                total_centi: read_u32(data, 22),
                fast_part_injected_centi: read_u32(data, 26),
                fast_part_total_centi: read_u32(data, 30),
                actual_duration_min: read_u32(data, 34),
                total_duration_min: read_u32(data, 38),
            }),
            _ => None,
        };

        Ok(Self { fast, extended_state, extended })
    }
}

/// Plaintext bolus progress notification (10 bytes, never encrypted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BolusNotification {
    pub fast_state: BolusState,
    pub fast_sequence: u32,
    pub slow_state: BolusState,
    pub slow_sequence: u32,
}

impl BolusNotification {
    /// Parse a notification frame. 12-byte frames may carry a checksum
    /// trailer, which is stripped when it verifies.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let data = if data.len() == 12 && crc::verify_crc(data) {
            &data[..10]
        } else {
            data
        };
        if data.len() < 10 {
            return Err(ParseError::TooShort { need: 10, got: data.len() });
        }
        Ok(Self {
            fast_state: BolusState::from(data[0]),
            fast_sequence: read_u32(data, 1),
            slow_state: BolusState::from(data[5]),
            slow_sequence: read_u32(data, 6),
        })
    }
}
