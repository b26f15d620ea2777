//! YpsoPump command controller.
//!
//! Orchestrates the BLE protocol layer into a safe high-level surface:
//! one mutex-guarded connect-on-demand episode per command, bounded
//! retry for dose-changing operations, relay-mediated key renewal when
//! the pump rotates its session key, and an event stream derived from
//! status snapshots, bolus notifications and history deltas.

pub mod address;
pub mod controller;
pub mod events;
pub mod relay;

pub use address::{bt_address_bytes, mac_from_serial, parse_mac};
pub use controller::{
    BasalProgram, BolusOutcome, ConnectionState, ControllerError, PumpController, POLL_INTERVAL,
};
pub use events::{EventBus, EventProcessor, PumpEvent};
pub use relay::{KeyExchangeReply, KeyExchangeRequest, RelayClient, RelayError};
