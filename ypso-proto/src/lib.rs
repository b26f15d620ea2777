//! YpsoPump wire protocol - codecs, command payloads, and response parsing
//!
//! Pure data crate: everything here operates on byte slices and owns no
//! BLE or async machinery. The layers above (`ypso-ble`, `ypso-controller`)
//! compose these codecs into encrypted command/response pipelines.

pub mod command;
pub mod crc;
pub mod frame;
pub mod gatt;
pub mod glb;
pub mod history;
pub mod status;

pub use command::{
    bolus_cancel_payload, bolus_start_payload, date_sync_payload, setting_index_payload,
    tbr_payload, time_sync_payload, BolusKind, CommandError,
};
pub use crc::{append_crc, crc16, verify_crc};
pub use frame::{assemble, chunk, total_frames, FrameError, MAX_PER_FRAME};
pub use glb::{GlbCorrupt, UNPROGRAMMED};
pub use history::{HistoryEntry, HistoryEvent, PUMP_EPOCH_OFFSET_SECS};
pub use status::{
    BolusBlock, BolusNotification, BolusState, BolusStatus, DeliveryMode, ExtendedBolusBlock,
    ParseError, SystemStatus,
};
