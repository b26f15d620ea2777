//! History entry parsing and event-code mapping.
//!
//! The pump stamps history with seconds since its own epoch of
//! 2000-01-01T00:00:00Z; timestamps are shifted to Unix time on parse.

use crate::status::ParseError;

/// Seconds between the Unix epoch and the pump epoch (Jan 1 2000 UTC).
pub const PUMP_EPOCH_OFFSET_SECS: u64 = 946_684_800;

/// One 17-byte history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    pub type_code: u8,
    pub value1: u16,
    pub value2: u16,
    pub value3: u16,
    pub sequence: u32,
    pub index: u16,
}

impl HistoryEntry {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < 17 {
            return Err(ParseError::TooShort { need: 17, got: data.len() });
        }
        let pump_ts = u32::from_le_bytes(data[..4].try_into().unwrap());
        Ok(Self {
            timestamp: u64::from(pump_ts) + PUMP_EPOCH_OFFSET_SECS,
            type_code: data[4],
            value1: u16::from_le_bytes(data[5..7].try_into().unwrap()),
            value2: u16::from_le_bytes(data[7..9].try_into().unwrap()),
            value3: u16::from_le_bytes(data[9..11].try_into().unwrap()),
            sequence: u32::from_le_bytes(data[11..15].try_into().unwrap()),
            index: u16::from_le_bytes(data[15..17].try_into().unwrap()),
        })
    }

    /// Map this entry's type code to a named event, if the code is known.
    pub fn event(&self) -> Option<HistoryEvent> {
        let units = f64::from(self.value1) / 100.0;
        Some(match self.type_code {
            1 => HistoryEvent::FastBolusRunning { units },
            2 => HistoryEvent::FastBolusCompleted { units },
            3 => HistoryEvent::FastBolusCancelled { units },
            9 => HistoryEvent::TbrRunning {
                percent: self.value1,
                duration_min: self.value2,
            },
            10 => HistoryEvent::TbrCompleted {
                percent: self.value1,
                duration_min: self.value2,
            },
            32 => HistoryEvent::TbrCancelled {
                percent: self.value1,
                duration_min: self.value2,
            },
            100 => HistoryEvent::BatteryAlert,
            101 => HistoryEvent::ReservoirAlert,
            104 => HistoryEvent::OcclusionAlert,
            105 => HistoryEvent::AutoStopWarning,
            106 => HistoryEvent::AutoStop,
            _ => return None,
        })
    }
}

/// Named events decoded from the Events history stream. Codes outside
/// this set are ignored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistoryEvent {
    FastBolusRunning { units: f64 },
    FastBolusCompleted { units: f64 },
    FastBolusCancelled { units: f64 },
    TbrRunning { percent: u16, duration_min: u16 },
    TbrCompleted { percent: u16, duration_min: u16 },
    TbrCancelled { percent: u16, duration_min: u16 },
    BatteryAlert,
    ReservoirAlert,
    OcclusionAlert,
    AutoStopWarning,
    AutoStop,
}
