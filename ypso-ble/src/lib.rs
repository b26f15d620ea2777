//! YpsoPump BLE protocol layer.
//!
//! Sits between the raw GATT client and the command controller: MD5
//! authentication, the 1+19-byte multi-frame transport, and the
//! encrypted command/response pipelines for every pump characteristic.
//! All BLE access goes through the [`PumpLink`] facade so the pipelines
//! run unchanged against [`fake::FakePump`] in tests.

pub mod auth;
pub mod btle;
pub mod channel;
pub mod fake;
pub mod link;
pub mod ops;

pub use auth::{auth_password, AUTH_SALT};
pub use btle::{scan_for_pumps, BtlePumpLink, DiscoveredPump};
pub use channel::{ChannelError, PumpChannel};
pub use link::{LinkError, Notification, NotificationStream, PumpLink};
pub use ops::{DeviceInfo, HistoryStream};
