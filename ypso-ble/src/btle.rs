//! btleplug-backed implementation of [`PumpLink`].
//!
//! Connects directly to a stored MAC without a discovery scan; the only
//! scanning entry point is [`scan_for_pumps`], used during initial
//! pairing to find `YpsoPump_<serial>` advertisements.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ypso_proto::gatt::DEVICE_NAME_PREFIX;

use crate::link::{LinkError, Notification, NotificationStream, PumpLink};

/// How long `connect` keeps looking for the peripheral to appear.
const CONNECT_DISCOVERY_WINDOW: Duration = Duration::from_secs(10);

impl From<btleplug::Error> for LinkError {
    fn from(err: btleplug::Error) -> Self {
        LinkError::Transport(err.to_string())
    }
}

/// A pump found during the pairing scan.
#[derive(Debug, Clone)]
pub struct DiscoveredPump {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Decimal serial parsed from the advertised name suffix.
    pub serial: Option<u64>,
}

async fn default_adapter() -> Result<Adapter, LinkError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| LinkError::Transport("no bluetooth adapter found".into()))
}

/// Scan for advertising pumps. Only used for initial pairing.
pub async fn scan_for_pumps(duration: Duration) -> Result<Vec<DiscoveredPump>, LinkError> {
    let adapter = default_adapter().await?;
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let mut pumps = Vec::new();
    for peripheral in adapter.peripherals().await? {
        if let Some(props) = peripheral.properties().await? {
            let name = props.local_name.unwrap_or_default();
            if !name.starts_with(DEVICE_NAME_PREFIX) {
                continue;
            }
            let serial = name[DEVICE_NAME_PREFIX.len()..].parse().ok();
            pumps.push(DiscoveredPump {
                name,
                address: peripheral.address().to_string(),
                rssi: props.rssi,
                serial,
            });
        }
    }

    adapter.stop_scan().await?;
    info!(found = pumps.len(), "pump scan finished");
    Ok(pumps)
}

/// Platform GATT client bound to one pump address.
pub struct BtlePumpLink {
    adapter: Adapter,
    address: BDAddr,
    peripheral: Mutex<Option<Peripheral>>,
}

impl BtlePumpLink {
    /// Bind to a pump MAC like `EC:2A:F0:02:AF:6F`.
    pub async fn new(address: &str) -> Result<Self, LinkError> {
        let address = BDAddr::from_str_delim(address)
            .map_err(|e| LinkError::Transport(format!("invalid address: {e}")))?;
        Ok(Self {
            adapter: default_adapter().await?,
            address,
            peripheral: Mutex::new(None),
        })
    }

    async fn locate(&self) -> Result<Peripheral, LinkError> {
        // The peripheral is usually already known to the adapter from
        // pairing; fall back to a short filtered discovery if not.
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address() == self.address {
                return Ok(peripheral);
            }
        }

        debug!(address = %self.address, "peripheral not cached, discovering");
        self.adapter.start_scan(ScanFilter::default()).await?;
        let deadline = tokio::time::Instant::now() + CONNECT_DISCOVERY_WINDOW;
        let found = loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let hit = self
                .adapter
                .peripherals()
                .await?
                .into_iter()
                .find(|p| p.address() == self.address);
            if let Some(peripheral) = hit {
                break Some(peripheral);
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
        };
        self.adapter.stop_scan().await?;
        found.ok_or(LinkError::Timeout("peripheral discovery"))
    }

    async fn connected_peripheral(&self) -> Result<Peripheral, LinkError> {
        self.peripheral
            .lock()
            .await
            .clone()
            .ok_or(LinkError::NotConnected)
    }

    async fn characteristic(
        peripheral: &Peripheral,
        uuid: Uuid,
    ) -> Result<Characteristic, LinkError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(LinkError::CharacteristicMissing(uuid))
    }
}

#[async_trait]
impl PumpLink for BtlePumpLink {
    async fn connect(&self) -> Result<(), LinkError> {
        let mut slot = self.peripheral.lock().await;
        if let Some(peripheral) = slot.as_ref() {
            if peripheral.is_connected().await.unwrap_or(false) {
                return Ok(());
            }
        }

        let peripheral = self.locate().await?;
        peripheral.connect().await?;
        peripheral.discover_services().await?;
        info!(address = %self.address, "connected");
        *slot = Some(peripheral);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        if let Some(peripheral) = self.peripheral.lock().await.take() {
            if let Err(err) = peripheral.disconnect().await {
                warn!(%err, "disconnect failed");
            }
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.peripheral.lock().await.as_ref() {
            Some(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, LinkError> {
        let peripheral = self.connected_peripheral().await?;
        let target = Self::characteristic(&peripheral, characteristic).await?;
        Ok(peripheral.read(&target).await?)
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), LinkError> {
        let peripheral = self.connected_peripheral().await?;
        let target = Self::characteristic(&peripheral, characteristic).await?;
        Ok(peripheral.write(&target, payload, WriteType::WithResponse).await?)
    }

    async fn write_no_response(
        &self,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        let peripheral = self.connected_peripheral().await?;
        let target = Self::characteristic(&peripheral, characteristic).await?;
        Ok(peripheral
            .write(&target, payload, WriteType::WithoutResponse)
            .await?)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), LinkError> {
        let peripheral = self.connected_peripheral().await?;
        let target = Self::characteristic(&peripheral, characteristic).await?;
        Ok(peripheral.subscribe(&target).await?)
    }

    async fn notifications(&self) -> Result<NotificationStream, LinkError> {
        let peripheral = self.connected_peripheral().await?;
        let stream = peripheral.notifications().await?;
        Ok(stream
            .map(|n| Notification {
                characteristic: n.uuid,
                value: n.value,
            })
            .boxed())
    }
}
