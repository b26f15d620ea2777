//! Per-command operations on a [`PumpChannel`].
//!
//! Each method implements one characteristic contract: which UUID to
//! hit, whether the payload carries a CRC trailer, and whether values
//! are wrapped in the self-checking 8-byte codec.

use futures::StreamExt;
use tracing::debug;

use ypso_proto::command::{
    bolus_cancel_payload, bolus_start_payload, date_sync_payload, setting_index_payload,
    tbr_payload, time_sync_payload, BolusKind,
};
use ypso_proto::gatt::{
    CHAR_ALERTS_COUNT, CHAR_ALERTS_INDEX, CHAR_ALERTS_VALUE, CHAR_BOLUS_NOTIFICATION,
    CHAR_BOLUS_START_STOP, CHAR_BOLUS_STATUS, CHAR_EVENTS_COUNT, CHAR_EVENTS_INDEX,
    CHAR_EVENTS_VALUE, CHAR_FIRMWARE_REVISION, CHAR_KEY_READ, CHAR_KEY_WRITE,
    CHAR_MANUFACTURER_NAME, CHAR_MASTER_VERSION, CHAR_MODEL_NUMBER, CHAR_SECURITY_STATUS,
    CHAR_SERIAL_NUMBER, CHAR_SETTING_ID, CHAR_SETTING_VALUE, CHAR_SYSTEM_DATE,
    CHAR_SYSTEM_HISTORY_COUNT, CHAR_SYSTEM_HISTORY_INDEX, CHAR_SYSTEM_HISTORY_VALUE,
    CHAR_SYSTEM_STATUS, CHAR_SYSTEM_TIME, CHAR_TBR_START_STOP,
};
use ypso_proto::frame::chunk;
use ypso_proto::{glb, BolusNotification, BolusStatus, HistoryEntry, SystemStatus};

use crate::channel::{ChannelError, PumpChannel};
use crate::link::PumpLink;

/// One of the pump's three history streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryStream {
    Events,
    Alerts,
    /// Entry layout of this stream is not characterized; entries are
    /// surfaced raw.
    System,
}

impl HistoryStream {
    fn count_char(self) -> uuid::Uuid {
        match self {
            Self::Events => CHAR_EVENTS_COUNT,
            Self::Alerts => CHAR_ALERTS_COUNT,
            Self::System => CHAR_SYSTEM_HISTORY_COUNT,
        }
    }

    fn index_char(self) -> uuid::Uuid {
        match self {
            Self::Events => CHAR_EVENTS_INDEX,
            Self::Alerts => CHAR_ALERTS_INDEX,
            Self::System => CHAR_SYSTEM_HISTORY_INDEX,
        }
    }

    fn value_char(self) -> uuid::Uuid {
        match self {
            Self::Events => CHAR_EVENTS_VALUE,
            Self::Alerts => CHAR_ALERTS_VALUE,
            Self::System => CHAR_SYSTEM_HISTORY_VALUE,
        }
    }
}

/// Plain-read device identity snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: String,
    pub firmware: String,
    pub manufacturer: String,
    pub model: String,
    pub master_version: Vec<u8>,
}

impl<L: PumpLink> PumpChannel<L> {
    /// Read and parse System Status. A successful decrypt also imports
    /// the pump's reboot counter into the session.
    pub async fn read_system_status(&mut self) -> Result<Option<SystemStatus>, ChannelError> {
        match self.read_response(CHAR_SYSTEM_STATUS, true).await? {
            Some(data) => Ok(Some(SystemStatus::parse(&data)?)),
            None => Ok(None),
        }
    }

    /// Start a bolus. Zero duration delivers fast; otherwise extended.
    pub async fn start_bolus(
        &mut self,
        total_centi: u32,
        duration_min: u32,
        immediate_centi: u32,
    ) -> Result<(), ChannelError> {
        let payload = bolus_start_payload(total_centi, duration_min, immediate_centi);
        self.send_command(CHAR_BOLUS_START_STOP, &payload, true).await
    }

    /// Cancel the fast or extended bolus block.
    pub async fn cancel_bolus(&mut self, kind: BolusKind) -> Result<(), ChannelError> {
        let payload = bolus_cancel_payload(kind);
        self.send_command(CHAR_BOLUS_START_STOP, &payload, true).await
    }

    pub async fn read_bolus_status(&mut self) -> Result<Option<BolusStatus>, ChannelError> {
        match self.read_response(CHAR_BOLUS_STATUS, true).await? {
            Some(data) => Ok(Some(BolusStatus::parse(&data)?)),
            None => Ok(None),
        }
    }

    /// Start a temporary basal rate. No CRC; both values self-checked.
    pub async fn start_tbr(&mut self, percent: u32, duration_min: u32) -> Result<(), ChannelError> {
        let payload = tbr_payload(percent, duration_min);
        self.send_command(CHAR_TBR_START_STOP, &payload, false).await
    }

    /// Cancelling a TBR is returning to 100% for zero minutes.
    pub async fn cancel_tbr(&mut self) -> Result<(), ChannelError> {
        self.start_tbr(100, 0).await
    }

    /// Write the pump date. Must precede [`Self::sync_time`].
    pub async fn sync_date(&mut self, year: u16, month: u8, day: u8) -> Result<(), ChannelError> {
        let payload = date_sync_payload(year, month, day)?;
        self.send_command(CHAR_SYSTEM_DATE, &payload, true).await
    }

    pub async fn sync_time(&mut self, hour: u8, minute: u8, second: u8) -> Result<(), ChannelError> {
        let payload = time_sync_payload(hour, minute, second)?;
        self.send_command(CHAR_SYSTEM_TIME, &payload, true).await
    }

    /// Select a setting slot, then read its self-checked value. The
    /// value may sit at any offset in the decrypted response.
    pub async fn read_setting(&mut self, index: i32) -> Result<Option<i32>, ChannelError> {
        self.send_command(CHAR_SETTING_ID, &setting_index_payload(index), false)
            .await?;
        match self.read_response(CHAR_SETTING_VALUE, false).await? {
            Some(data) => glb::find_in(&data)
                .map(Some)
                .ok_or(ChannelError::Glb(ypso_proto::GlbCorrupt)),
            None => Ok(None),
        }
    }

    /// Select a setting slot, then write its value: two sequential
    /// encrypted multi-frame writes.
    pub async fn write_setting(&mut self, index: i32, value: i32) -> Result<(), ChannelError> {
        self.send_command(CHAR_SETTING_ID, &setting_index_payload(index), false)
            .await?;
        self.send_command(CHAR_SETTING_VALUE, &glb::encode(value), false)
            .await
    }

    /// Number of entries in a history stream.
    pub async fn history_count(&mut self, stream: HistoryStream) -> Result<Option<i32>, ChannelError> {
        match self.read_response(stream.count_char(), false).await? {
            Some(data) => glb::find_in(&data)
                .map(Some)
                .ok_or(ChannelError::Glb(ypso_proto::GlbCorrupt)),
            None => Ok(None),
        }
    }

    /// Select the entry subsequently returned by [`Self::read_history_entry`].
    pub async fn select_history_entry(
        &mut self,
        stream: HistoryStream,
        index: i32,
    ) -> Result<(), ChannelError> {
        self.send_command(stream.index_char(), &setting_index_payload(index), false)
            .await
    }

    pub async fn read_history_entry(
        &mut self,
        stream: HistoryStream,
    ) -> Result<Option<HistoryEntry>, ChannelError> {
        match self.read_response(stream.value_char(), true).await? {
            Some(data) => Ok(Some(HistoryEntry::parse(&data)?)),
            None => Ok(None),
        }
    }

    /// Raw security-status payload; not interpreted.
    pub async fn read_security_status(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        let raw = self.read_response(CHAR_SECURITY_STATUS, false).await?;
        if let Some(raw) = &raw {
            debug!(len = raw.len(), "security status");
        }
        Ok(raw)
    }

    /// Plain reads of the standard device-information characteristics.
    pub async fn read_device_info(&mut self) -> Result<DeviceInfo, ChannelError> {
        let text = |raw: Vec<u8>| String::from_utf8_lossy(&raw).trim().to_string();
        Ok(DeviceInfo {
            serial: text(self.link().read(CHAR_SERIAL_NUMBER).await?),
            firmware: text(self.link().read(CHAR_FIRMWARE_REVISION).await?),
            manufacturer: text(self.link().read(CHAR_MANUFACTURER_NAME).await?),
            model: text(self.link().read(CHAR_MODEL_NUMBER).await?),
            master_version: self.link().read(CHAR_MASTER_VERSION).await?,
        })
    }

    /// Subscribe to the plaintext bolus notification characteristic and
    /// return the parsed notification stream. Frames that fail to parse
    /// are dropped.
    pub async fn bolus_notifications(
        &self,
    ) -> Result<futures::stream::BoxStream<'static, BolusNotification>, ChannelError> {
        self.link().subscribe(CHAR_BOLUS_NOTIFICATION).await?;
        let stream = self.link().notifications().await?;
        Ok(stream
            .filter_map(|notification| async move {
                if notification.characteristic != CHAR_BOLUS_NOTIFICATION {
                    return None;
                }
                BolusNotification::parse(&notification.value).ok()
            })
            .boxed())
    }

    /// Read the 64-byte pairing block: 32-byte challenge, then the
    /// pump's raw X25519 public key. Plaintext characteristic.
    pub async fn read_key_material(&mut self) -> Result<([u8; 32], [u8; 32]), ChannelError> {
        let raw = self.link().read(CHAR_KEY_READ).await?;
        if raw.len() < 64 {
            return Err(ChannelError::Link(crate::link::LinkError::Transport(
                format!("key read returned {} bytes, expected 64", raw.len()),
            )));
        }
        let challenge: [u8; 32] = raw[..32].try_into().unwrap();
        let pump_public: [u8; 32] = raw[32..64].try_into().unwrap();
        Ok((challenge, pump_public))
    }

    /// Multi-frame write of the relay-encrypted key block. Plaintext
    /// carrier: frames but no session encryption.
    pub async fn write_key_payload(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        for frame in chunk(payload)? {
            self.link().write(CHAR_KEY_WRITE, &frame).await?;
        }
        Ok(())
    }
}
