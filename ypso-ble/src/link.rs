//! Abstract GATT client facade.
//!
//! The protocol layer only needs five primitives: read, acknowledged
//! write, unacknowledged write, subscribe, and a notification stream.
//! Implementations must preserve write ordering within one connection.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("not connected")]
    NotConnected,
    #[error("characteristic {0} not present on device")]
    CharacteristicMissing(Uuid),
    #[error("bluetooth transport: {0}")]
    Transport(String),
    #[error("timed out during {0}")]
    Timeout(&'static str),
}

/// A value pushed by the device on a subscribed characteristic.
#[derive(Debug, Clone)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

pub type NotificationStream = BoxStream<'static, Notification>;

/// Narrow async facade over a connected GATT client.
#[async_trait]
pub trait PumpLink: Send + Sync {
    async fn connect(&self) -> Result<(), LinkError>;
    async fn disconnect(&self) -> Result<(), LinkError>;
    async fn is_connected(&self) -> bool;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, LinkError>;

    /// Write and wait for the link-layer acknowledgment.
    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), LinkError>;

    async fn write_no_response(&self, characteristic: Uuid, payload: &[u8])
        -> Result<(), LinkError>;

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), LinkError>;

    /// Stream of notifications across all subscribed characteristics.
    async fn notifications(&self) -> Result<NotificationStream, LinkError>;
}
