//! Connect-on-demand command controller.
//!
//! Every pump operation runs as an episode behind one async mutex:
//! connect, authenticate, load the session, force a status read (which
//! also resyncs counters), run the command block, then disconnect. A
//! decrypt failure inside the episode means the pump rotated the
//! session key; the controller performs exactly one relay-mediated
//! renewal per command invocation before giving up. Dose-changing
//! commands additionally get a bounded transport-retry wrapper, which
//! is safe because their loss means the pump never saw them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use data_encoding::HEXLOWER;
use futures::future::BoxFuture;
use futures::StreamExt;
use rand_core::{OsRng, RngCore};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use ypso_ble::{ChannelError, DeviceInfo, HistoryStream, PumpChannel, PumpLink};
use ypso_crypto::{CryptoError, DeviceKeyPair, PumpCryptor};
use ypso_proto::command::{
    basal_rate_from_raw, basal_slot_index, units_to_centi, BolusKind, BASAL_SLOTS,
    PROGRAM_A_BASE_INDEX, PROGRAM_A_SELECTOR, PROGRAM_B_BASE_INDEX, PROGRAM_B_SELECTOR,
    SETTING_ACTIVE_PROGRAM,
};
use ypso_proto::gatt::DEVICE_NAME_PREFIX;
use ypso_proto::{BolusState, HistoryEntry, SystemStatus};
use ypso_store::{keys, Store, StoreError};

use crate::address::{bt_address_bytes, mac_from_serial, parse_mac};
use crate::events::{event_from_history, EventBus, EventProcessor, PumpEvent};
use crate::relay::{KeyExchangeRequest, RelayClient};

const STATUS_READ_ATTEMPTS: u32 = 3;
const STATUS_RETRY_DELAY: Duration = Duration::from_millis(500);
const DISCONNECT_SETTLE: Duration = Duration::from_millis(300);
const RENEWAL_PAUSE: Duration = Duration::from_secs(1);
const CRITICAL_ATTEMPTS: u32 = 3;
const CRITICAL_BACKOFF_STEP: Duration = Duration::from_secs(2);
const KEY_READ_ATTEMPTS: u32 = 5;
const KEY_READ_RETRY_DELAY: Duration = Duration::from_secs(1);
const KEY_EXCHANGE_SETTLE: Duration = Duration::from_millis(500);
const BOLUS_TERMINAL_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_FAILURE_ALERT: u32 = 3;

/// Cadence of the background status/history poll.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("pump is not paired")]
    NotPaired,
    #[error("no session key stored; key exchange required")]
    KeyMissing,
    #[error("session key rejected by the pump")]
    KeyDead,
    #[error("pump authentication failed")]
    AuthFailed,
    #[error("stored pump address is invalid")]
    BadStoredAddress,
    #[error("relay url not configured")]
    RelayNotConfigured,
    #[error("relay key exchange failed: {0}")]
    Relay(String),
    #[error("renewed key failed validation")]
    KeyValidationFailed,
    #[error("pump transport: {0}")]
    Transport(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Channel(ChannelError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ChannelError> for ControllerError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::AuthFailed => Self::AuthFailed,
            // A decrypt failure anywhere in the pipelines means the pump
            // has rotated the session key.
            ChannelError::DecryptFailed => Self::KeyDead,
            ChannelError::NoCryptor => Self::KeyMissing,
            other => Self::Channel(other),
        }
    }
}

impl From<CryptoError> for ControllerError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::KeyMissing => Self::KeyMissing,
            CryptoError::DecryptFailed => Self::KeyDead,
            CryptoError::Store(e) => Self::Store(e),
        }
    }
}

/// Transient failures the critical-retry wrapper may swallow. Key death
/// and timeouts are never retried blindly.
fn is_transient(err: &ControllerError) -> bool {
    matches!(
        err,
        ControllerError::Transport(_)
            | ControllerError::Channel(ChannelError::Link(_))
            | ControllerError::Channel(ChannelError::SyncFailed)
    )
}

/// Externally observable controller state.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    NotPaired,
    Disconnected,
    Scanning,
    Connecting,
    Initializing,
    AwaitingUserConfirmation { message: String, code: Option<String> },
    Ready,
    NeedsKeyExchange,
    Recovering { attempt: u32 },
    Error { message: String, cause: Option<String> },
}

/// The two programmable basal profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasalProgram {
    A,
    B,
}

impl BasalProgram {
    /// Value of the active-program setting slot selecting this program.
    pub fn selector(self) -> i32 {
        match self {
            Self::A => PROGRAM_A_SELECTOR,
            Self::B => PROGRAM_B_SELECTOR,
        }
    }

    pub fn base_index(self) -> i32 {
        match self {
            Self::A => PROGRAM_A_BASE_INDEX,
            Self::B => PROGRAM_B_BASE_INDEX,
        }
    }

    pub fn from_selector(selector: i32) -> Option<Self> {
        match selector {
            PROGRAM_A_SELECTOR => Some(Self::A),
            PROGRAM_B_SELECTOR => Some(Self::B),
            _ => None,
        }
    }
}

/// Result of a delivered (or cancelled) bolus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BolusOutcome {
    pub requested_units: f64,
    pub state: BolusState,
    /// From the follow-up bolus status read, when the pump answered it.
    pub delivered_units: Option<f64>,
}

#[derive(Default)]
struct HistoryMarks {
    events: Option<i32>,
    alerts: Option<i32>,
}

struct Inner<L> {
    channel: Mutex<PumpChannel<L>>,
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    processor: Arc<std::sync::Mutex<EventProcessor>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    messages: broadcast::Sender<String>,
    status_cache: std::sync::Mutex<Option<SystemStatus>>,
    history_marks: Arc<std::sync::Mutex<HistoryMarks>>,
    needs_renewal: AtomicBool,
    renewal_in_progress: AtomicBool,
    integrity_token: std::sync::Mutex<Option<String>>,
}

/// High-level pump command surface. Cheap to clone; all clones share
/// the same command mutex and streams.
pub struct PumpController<L: PumpLink> {
    inner: Arc<Inner<L>>,
}

impl<L: PumpLink> Clone for PumpController<L> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

/// Identity helper: pins the closure to the block signature the episode
/// runner expects so inference picks the higher-ranked lifetime.
fn cmd<L, T, F>(block: F) -> F
where
    L: PumpLink,
    F: for<'a> Fn(&'a mut PumpChannel<L>, SystemStatus) -> BoxFuture<'a, Result<T, ControllerError>>
        + Send
        + Sync,
{
    block
}

/// Best-effort disconnect when a command future is dropped mid-flight.
///
/// Cancellation can abandon a command at any suspension point, after
/// the link was connected but before the episode's own disconnect ran.
/// Dropping the guard spawns that disconnect instead; [`Self::disarm`]
/// marks it done once the normal path has disconnected itself.
struct DisconnectGuard<L: PumpLink + 'static> {
    link: Arc<L>,
    /// Whether to skip the disconnect on drop (set once the normal
    /// path has already disconnected).
    committed: bool,
}

impl<L: PumpLink + 'static> DisconnectGuard<L> {
    fn new(link: Arc<L>) -> Self {
        Self { link, committed: false }
    }

    fn disarm(&mut self) {
        self.committed = true;
    }
}

impl<L: PumpLink + 'static> Drop for DisconnectGuard<L> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Drop cannot await, so the disconnect runs as a background
        // task; the link is the only resource an abandoned command can
        // leak.
        warn!("command dropped mid-episode, disconnecting in the background");
        let link = Arc::clone(&self.link);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = link.disconnect().await;
            });
        }
    }
}

impl<L: PumpLink + 'static> PumpController<L> {
    pub fn new(link: L, store: Arc<dyn Store>) -> Self {
        let initial = match store.get_string(keys::DEVICE_MAC) {
            Ok(Some(_)) => match store.get_bytes(keys::SHARED_KEY) {
                Ok(Some(_)) => ConnectionState::Ready,
                _ => ConnectionState::NeedsKeyExchange,
            },
            _ => ConnectionState::NotPaired,
        };
        let (state_tx, state_rx) = watch::channel(initial);
        let (messages, _) = broadcast::channel(32);

        Self {
            inner: Arc::new(Inner {
                channel: Mutex::new(PumpChannel::new(link)),
                store,
                events: Arc::new(EventBus::new()),
                processor: Arc::new(std::sync::Mutex::new(EventProcessor::new())),
                state_tx,
                state_rx,
                messages,
                status_cache: std::sync::Mutex::new(None),
                history_marks: Arc::new(std::sync::Mutex::new(HistoryMarks::default())),
                needs_renewal: AtomicBool::new(false),
                renewal_in_progress: AtomicBool::new(false),
                integrity_token: std::sync::Mutex::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state_rx.borrow().clone()
    }

    /// Replay of recent events plus a live receiver.
    pub fn subscribe_events(&self) -> (Vec<PumpEvent>, broadcast::Receiver<PumpEvent>) {
        self.inner.events.subscribe()
    }

    /// Short human-readable progress/failure strings.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<String> {
        self.inner.messages.subscribe()
    }

    pub fn cached_status(&self) -> Option<SystemStatus> {
        *self.inner.status_cache.lock().unwrap()
    }

    pub fn needs_key_exchange(&self) -> bool {
        self.inner.needs_renewal.load(Ordering::SeqCst)
    }

    pub fn renewal_in_progress(&self) -> bool {
        self.inner.renewal_in_progress.load(Ordering::SeqCst)
    }

    /// Attestation token passed through to the relay on the next key
    /// exchange. Opaque to this engine.
    pub fn set_integrity_token(&self, token: Option<String>) {
        *self.inner.integrity_token.lock().unwrap() = token;
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.inner.state_tx.send(state);
    }

    fn message(&self, text: impl Into<String>) {
        let _ = self.inner.messages.send(text.into());
    }

    fn signal_needs_key_exchange(&self) {
        self.inner.needs_renewal.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::NeedsKeyExchange);
        self.inner.events.emit(PumpEvent::NeedsKeyExchange);
        self.message("Pump session expired, key exchange required");
    }

    // ------------------------------------------------------------------
    // Pairing
    // ------------------------------------------------------------------

    /// Record the pump identity and run the initial key exchange.
    pub async fn pair(&self, serial: u64) -> Result<(), ControllerError> {
        let store = &self.inner.store;
        store.put_string(keys::DEVICE_MAC, &mac_from_serial(serial))?;
        store.put_string(keys::DEVICE_NAME, &format!("{DEVICE_NAME_PREFIX}{serial}"))?;
        store.put_u64(keys::DEVICE_SERIAL, serial)?;
        self.exchange_key().await
    }

    /// Run the relay-mediated key exchange and validate the new session.
    pub async fn exchange_key(&self) -> Result<(), ControllerError> {
        let mut channel = self.inner.channel.lock().await;
        let mut guard = DisconnectGuard::new(channel.link_handle());
        self.set_state(ConnectionState::Connecting);
        self.inner.renewal_in_progress.store(true, Ordering::SeqCst);
        let result = self.renew_key(&mut channel).await;
        self.inner.renewal_in_progress.store(false, Ordering::SeqCst);
        let _ = channel.disconnect().await;
        guard.disarm();
        tokio::time::sleep(DISCONNECT_SETTLE).await;

        match &result {
            Ok(()) => {
                self.inner.needs_renewal.store(false, Ordering::SeqCst);
                self.inner.processor.lock().unwrap().reset();
                self.inner.events.emit(PumpEvent::KeyRenewed);
                self.set_state(ConnectionState::Ready);
            }
            Err(err) => {
                warn!(%err, "key exchange failed");
                self.signal_needs_key_exchange();
            }
        }
        result
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Current pump status (delivery mode, reservoir, battery).
    pub async fn status(&self) -> Result<SystemStatus, ControllerError> {
        self.run_command(
            false,
            cmd(|_channel: &mut PumpChannel<L>, status| Box::pin(async move { Ok(status) })),
        )
        .await
    }

    /// Deliver a bolus and follow it to its terminal state.
    ///
    /// Zero `duration_min` is a fast bolus; otherwise extended/combo
    /// with `immediate_units` delivered up front.
    pub async fn deliver_bolus(
        &self,
        units: f64,
        duration_min: u32,
        immediate_units: f64,
    ) -> Result<BolusOutcome, ControllerError> {
        let total_centi = units_to_centi(units);
        let immediate_centi = units_to_centi(immediate_units);
        let kind = if duration_min == 0 { BolusKind::Fast } else { BolusKind::Extended };
        let bus = Arc::clone(&self.inner.events);
        let processor = Arc::clone(&self.inner.processor);

        let result = self
            .run_command(
                true,
                cmd(move |channel: &mut PumpChannel<L>, _status| {
                    let bus = Arc::clone(&bus);
                    let processor = Arc::clone(&processor);
                    Box::pin(async move {
                        // Subscribe before the start command so the
                        // first transition cannot be missed.
                        let mut notifications = channel.bolus_notifications().await?;
                        channel
                            .start_bolus(total_centi, duration_min, immediate_centi)
                            .await?;

                        let wait = async {
                            while let Some(notification) = notifications.next().await {
                                let events = processor
                                    .lock()
                                    .unwrap()
                                    .on_bolus_notification(&notification);
                                bus.emit_all(events);
                                let state = match kind {
                                    BolusKind::Fast => notification.fast_state,
                                    BolusKind::Extended => notification.slow_state,
                                };
                                if state.is_terminal() {
                                    return Some(state);
                                }
                            }
                            None
                        };
                        let state = match tokio::time::timeout(BOLUS_TERMINAL_TIMEOUT, wait).await {
                            Ok(Some(state)) => state,
                            Ok(None) | Err(_) => {
                                return Err(ControllerError::Timeout("bolus terminal state"))
                            }
                        };

                        let delivered = channel.read_bolus_status().await?.map(|status| match kind {
                            BolusKind::Fast => f64::from(status.fast.injected_centi) / 100.0,
                            BolusKind::Extended => status
                                .extended
                                .map(|block| f64::from(block.injected_centi) / 100.0)
                                .unwrap_or(0.0),
                        });

                        Ok(BolusOutcome {
                            requested_units: f64::from(total_centi) / 100.0,
                            state,
                            delivered_units: delivered,
                        })
                    })
                }),
            )
            .await;

        match &result {
            Ok(outcome) => match outcome.state {
                BolusState::Completed => self.inner.events.emit(PumpEvent::BolusCompleted {
                    units: outcome.delivered_units.unwrap_or(outcome.requested_units),
                }),
                BolusState::Cancelled => self.inner.events.emit(PumpEvent::BolusCancelled {
                    delivered_units: outcome.delivered_units.unwrap_or(0.0),
                }),
                _ => {}
            },
            Err(ControllerError::Timeout(_)) => {
                self.message("Bolus timed out, check the pump");
            }
            Err(_) => {}
        }
        result
    }

    /// Cancel the fast or extended bolus; returns delivered units when
    /// the pump reports them.
    pub async fn cancel_bolus(&self, kind: BolusKind) -> Result<Option<f64>, ControllerError> {
        let delivered = self
            .run_command(
                true,
                cmd(move |channel: &mut PumpChannel<L>, _status| {
                    Box::pin(async move {
                        channel.cancel_bolus(kind).await?;
                        let delivered = channel.read_bolus_status().await?.map(|status| match kind {
                            BolusKind::Fast => f64::from(status.fast.injected_centi) / 100.0,
                            BolusKind::Extended => status
                                .extended
                                .map(|block| f64::from(block.injected_centi) / 100.0)
                                .unwrap_or(0.0),
                        });
                        Ok(delivered)
                    })
                }),
            )
            .await?;

        self.inner.events.emit(PumpEvent::BolusCancelled {
            delivered_units: delivered.unwrap_or(0.0),
        });
        Ok(delivered)
    }

    /// Start a temporary basal rate.
    pub async fn set_tbr(&self, percent: u32, duration_min: u32) -> Result<(), ControllerError> {
        self.run_command(
            true,
            cmd(move |channel: &mut PumpChannel<L>, _status| {
                Box::pin(async move { Ok(channel.start_tbr(percent, duration_min).await?) })
            }),
        )
        .await?;
        self.inner.events.emit(PumpEvent::TbrStarted {
            percent: Some(percent as u16),
            duration_min: Some(duration_min as u16),
        });
        Ok(())
    }

    pub async fn cancel_tbr(&self) -> Result<(), ControllerError> {
        self.run_command(
            true,
            cmd(|channel: &mut PumpChannel<L>, _status| {
                Box::pin(async move { Ok(channel.cancel_tbr().await?) })
            }),
        )
        .await?;
        self.inner.events.emit(PumpEvent::TbrCancelled);
        Ok(())
    }

    /// Write the pump clock: date first, then time.
    pub async fn sync_clock(
        &self,
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
    ) -> Result<(), ControllerError> {
        self.run_command(
            true,
            cmd(move |channel: &mut PumpChannel<L>, _status| {
                Box::pin(async move {
                    channel.sync_date(year, month, day).await?;
                    channel.sync_time(hour, minute, second).await?;
                    Ok(())
                })
            }),
        )
        .await
    }

    /// Read all 24 hourly rates of one basal program, in units per hour.
    pub async fn read_basal_program(
        &self,
        program: BasalProgram,
    ) -> Result<Vec<f64>, ControllerError> {
        self.run_command(
            false,
            cmd(move |channel: &mut PumpChannel<L>, _status| {
                Box::pin(async move {
                    let mut rates = Vec::with_capacity(BASAL_SLOTS);
                    for hour in 0..BASAL_SLOTS {
                        let index = basal_slot_index(program.base_index(), hour);
                        let raw = channel.read_setting(index).await?.ok_or_else(|| {
                            ControllerError::Transport("setting read returned nothing".into())
                        })?;
                        rates.push(basal_rate_from_raw(raw));
                    }
                    Ok(rates)
                })
            }),
        )
        .await
    }

    /// Program all 24 hourly rates of one basal program.
    pub async fn write_basal_program(
        &self,
        program: BasalProgram,
        rates: &[f64],
    ) -> Result<(), ControllerError> {
        let slots: Vec<i32> = rates.iter().map(|rate| units_to_centi(*rate) as i32).collect();
        self.run_command(
            false,
            cmd(move |channel: &mut PumpChannel<L>, _status| {
                let slots = slots.clone();
                Box::pin(async move {
                    for (hour, value) in slots.iter().enumerate().take(BASAL_SLOTS) {
                        let index = basal_slot_index(program.base_index(), hour);
                        channel.write_setting(index, *value).await?;
                    }
                    Ok(())
                })
            }),
        )
        .await
    }

    /// Which basal program the pump is running, when recognized.
    pub async fn active_program(&self) -> Result<Option<BasalProgram>, ControllerError> {
        let selector = self
            .run_command(
                false,
                cmd(|channel: &mut PumpChannel<L>, _status| {
                    Box::pin(async move { Ok(channel.read_setting(SETTING_ACTIVE_PROGRAM).await?) })
                }),
            )
            .await?;
        Ok(selector.and_then(BasalProgram::from_selector))
    }

    pub async fn set_active_program(&self, program: BasalProgram) -> Result<(), ControllerError> {
        self.run_command(
            false,
            cmd(move |channel: &mut PumpChannel<L>, _status| {
                Box::pin(async move {
                    Ok(channel
                        .write_setting(SETTING_ACTIVE_PROGRAM, program.selector())
                        .await?)
                })
            }),
        )
        .await
    }

    /// Fetch up to `limit` most recent entries of a history stream.
    pub async fn fetch_history(
        &self,
        stream: HistoryStream,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>, ControllerError> {
        self.run_command(
            false,
            cmd(move |channel: &mut PumpChannel<L>, _status| {
                Box::pin(async move {
                    let count = channel.history_count(stream).await?.unwrap_or(0);
                    let from = count.saturating_sub(limit as i32).max(0);
                    let mut entries = Vec::new();
                    for index in from..count {
                        channel.select_history_entry(stream, index).await?;
                        if let Some(entry) = channel.read_history_entry(stream).await? {
                            entries.push(entry);
                        }
                    }
                    Ok(entries)
                })
            }),
        )
        .await
    }

    /// Serial, firmware, manufacturer and model strings, read plain.
    pub async fn device_info(&self) -> Result<DeviceInfo, ControllerError> {
        self.run_command(
            false,
            cmd(|channel: &mut PumpChannel<L>, _status| {
                Box::pin(async move {
                    // Read but don't interpret; useful in debug traces.
                    if let Err(err) = channel.read_security_status().await {
                        debug!(%err, "security status read failed");
                    }
                    Ok(channel.read_device_info().await?)
                })
            }),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    /// One polling episode: status (events fall out of the processor)
    /// plus Events/Alerts history deltas.
    pub async fn poll(&self) -> Result<(), ControllerError> {
        let bus = Arc::clone(&self.inner.events);
        let marks = Arc::clone(&self.inner.history_marks);
        self.run_command(
            false,
            cmd(move |channel: &mut PumpChannel<L>, _status| {
                let bus = Arc::clone(&bus);
                let marks = Arc::clone(&marks);
                Box::pin(async move {
                    let events_count =
                        channel.history_count(HistoryStream::Events).await?.unwrap_or(0);
                    let alerts_count =
                        channel.history_count(HistoryStream::Alerts).await?.unwrap_or(0);
                    let (last_events, last_alerts) = {
                        let marks = marks.lock().unwrap();
                        (marks.events, marks.alerts)
                    };

                    for (stream, last, count) in [
                        (HistoryStream::Events, last_events, events_count),
                        (HistoryStream::Alerts, last_alerts, alerts_count),
                    ] {
                        // First poll only records the baseline.
                        let Some(last) = last else { continue };
                        for index in last..count {
                            channel.select_history_entry(stream, index).await?;
                            let Some(entry) = channel.read_history_entry(stream).await? else {
                                continue;
                            };
                            if let Some(event) = entry.event() {
                                bus.emit(event_from_history(event));
                            }
                        }
                    }

                    let mut marks = marks.lock().unwrap();
                    marks.events = Some(events_count);
                    marks.alerts = Some(alerts_count);
                    Ok(())
                })
            }),
        )
        .await
    }

    /// Spawn the 60-second poller. Polls only while the controller is
    /// idle in `Ready`; repeated failures raise a user message but never
    /// trigger automatic reconnects.
    pub fn spawn_poller(&self) -> tokio::task::JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut failures = 0u32;
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                if *controller.inner.state_rx.borrow() != ConnectionState::Ready {
                    continue;
                }
                match controller.poll().await {
                    Ok(()) => failures = 0,
                    Err(err) => {
                        failures += 1;
                        warn!(%err, failures, "status poll failed");
                        if failures == POLL_FAILURE_ALERT {
                            controller
                                .message("Pump has been unreachable for several polls");
                        }
                    }
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Episode machinery
    // ------------------------------------------------------------------

    fn device_mac(&self) -> Result<[u8; 6], ControllerError> {
        let mac = self
            .inner
            .store
            .get_string(keys::DEVICE_MAC)?
            .ok_or(ControllerError::NotPaired)?;
        parse_mac(&mac).ok_or(ControllerError::BadStoredAddress)
    }

    fn device_serial(&self) -> Result<u64, ControllerError> {
        if let Some(serial) = self.inner.store.get_u64(keys::DEVICE_SERIAL)? {
            return Ok(serial);
        }
        let name = self
            .inner
            .store
            .get_string(keys::DEVICE_NAME)?
            .ok_or(ControllerError::NotPaired)?;
        name.strip_prefix(DEVICE_NAME_PREFIX)
            .and_then(|suffix| suffix.parse().ok())
            .ok_or(ControllerError::NotPaired)
    }

    fn device_id(&self) -> Result<String, ControllerError> {
        if let Some(id) = self.inner.store.get_string(keys::DEVICE_ID)? {
            return Ok(id);
        }
        let mut raw = [0u8; 16];
        OsRng.fill_bytes(&mut raw);
        let id = HEXLOWER.encode(&raw);
        self.inner.store.put_string(keys::DEVICE_ID, &id)?;
        Ok(id)
    }

    fn update_status(&self, status: &SystemStatus) {
        *self.inner.status_cache.lock().unwrap() = Some(*status);
        let events = self.inner.processor.lock().unwrap().on_status(status);
        self.inner.events.emit_all(events);
    }

    /// Forced status read with a short transient-retry window. A decrypt
    /// failure is key death and aborts immediately.
    async fn status_with_retry(
        &self,
        channel: &mut PumpChannel<L>,
    ) -> Result<SystemStatus, ControllerError> {
        for attempt in 1..=STATUS_READ_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(STATUS_RETRY_DELAY).await;
            }
            match channel.read_system_status().await? {
                Some(status) => return Ok(status),
                None if channel.last_decrypt_failed() => return Err(ControllerError::KeyDead),
                None => debug!(attempt, "status read empty"),
            }
        }
        Err(ControllerError::Transport("status read failed".into()))
    }

    async fn episode<T, F>(
        &self,
        channel: &mut PumpChannel<L>,
        block: &F,
    ) -> Result<T, ControllerError>
    where
        F: for<'a> Fn(
                &'a mut PumpChannel<L>,
                SystemStatus,
            ) -> BoxFuture<'a, Result<T, ControllerError>>
            + Send
            + Sync,
    {
        self.set_state(ConnectionState::Connecting);
        let result = self.episode_body(channel, block).await;

        // Always leave disconnected, give the pump its settle time.
        let _ = channel.disconnect().await;
        tokio::time::sleep(DISCONNECT_SETTLE).await;
        self.set_state(ConnectionState::Disconnected);
        result
    }

    async fn episode_body<T, F>(
        &self,
        channel: &mut PumpChannel<L>,
        block: &F,
    ) -> Result<T, ControllerError>
    where
        F: for<'a> Fn(
                &'a mut PumpChannel<L>,
                SystemStatus,
            ) -> BoxFuture<'a, Result<T, ControllerError>>
            + Send
            + Sync,
    {
        channel.connect().await?;
        self.set_state(ConnectionState::Initializing);

        let mac = self.device_mac()?;
        channel.authenticate(&mac).await?;

        let cryptor = PumpCryptor::from_store(Arc::clone(&self.inner.store))?
            .ok_or(ControllerError::KeyMissing)?;
        channel.install_cryptor(cryptor);
        channel.mark_counters_unsynced();

        let status = self.status_with_retry(channel).await?;
        self.update_status(&status);

        block(channel, status).await
    }

    /// Run a command invocation: episode, at most one key renewal, and
    /// the transport-retry loop for critical commands.
    async fn run_command<T, F>(&self, critical: bool, block: F) -> Result<T, ControllerError>
    where
        T: Send,
        F: for<'a> Fn(
                &'a mut PumpChannel<L>,
                SystemStatus,
            ) -> BoxFuture<'a, Result<T, ControllerError>>
            + Send
            + Sync,
    {
        let mut channel = self.inner.channel.lock().await;
        // Dropping this future at any suspension point must still close
        // the link; the mutex guard alone only covers the lock.
        let mut guard = DisconnectGuard::new(channel.link_handle());
        let attempts = if critical { CRITICAL_ATTEMPTS } else { 1 };
        let mut attempt = 1u32;
        let mut renewed = false;

        let result = loop {
            match self.episode(&mut channel, &block).await {
                Ok(value) => break Ok(value),
                Err(ControllerError::KeyDead) if !renewed => {
                    renewed = true;
                    self.inner.needs_renewal.store(true, Ordering::SeqCst);
                    warn!("pump rejected the session key, renewing via relay");
                    tokio::time::sleep(RENEWAL_PAUSE).await;

                    self.inner.renewal_in_progress.store(true, Ordering::SeqCst);
                    let renewal = self.renew_key(&mut channel).await;
                    self.inner.renewal_in_progress.store(false, Ordering::SeqCst);

                    match renewal {
                        Ok(()) => {
                            self.inner.needs_renewal.store(false, Ordering::SeqCst);
                            self.inner.processor.lock().unwrap().reset();
                            self.inner.events.emit(PumpEvent::KeyRenewed);
                            tokio::time::sleep(RENEWAL_PAUSE).await;
                            // Retry the episode once with the new key.
                            continue;
                        }
                        Err(err) => break Err(err),
                    }
                }
                Err(err) if critical && attempt < attempts && is_transient(&err) => {
                    attempt += 1;
                    warn!(%err, attempt, "transient failure, retrying command");
                    self.set_state(ConnectionState::Recovering { attempt });
                    tokio::time::sleep(CRITICAL_BACKOFF_STEP * (attempt - 1)).await;
                }
                Err(err) => break Err(err),
            }
        };

        // The renewal path can exit with the link still up; episodes
        // already closed theirs.
        let _ = channel.disconnect().await;
        guard.disarm();

        match &result {
            Ok(_) => self.set_state(ConnectionState::Ready),
            Err(
                ControllerError::KeyMissing
                | ControllerError::KeyDead
                | ControllerError::KeyValidationFailed
                | ControllerError::RelayNotConfigured
                | ControllerError::Relay(_),
            ) => {
                self.signal_needs_key_exchange();
            }
            Err(err) => {
                self.set_state(ConnectionState::Error {
                    message: err.to_string(),
                    cause: None,
                });
            }
        }
        result
    }

    /// Relay-mediated key renewal. Assumes the command mutex is held;
    /// leaves the link connected for the caller to reuse or close.
    async fn renew_key(&self, channel: &mut PumpChannel<L>) -> Result<(), ControllerError> {
        let store = &self.inner.store;
        let relay_url = store
            .get_string(keys::RELAY_URL)?
            .ok_or(ControllerError::RelayNotConfigured)?;
        let serial = self.device_serial()?;
        let mac = self.device_mac()?;
        let keypair = DeviceKeyPair::load_or_generate(store.as_ref())?;
        let device_id = self.device_id()?;

        channel.connect().await?;
        channel.authenticate(&mac).await?;
        tokio::time::sleep(KEY_EXCHANGE_SETTLE).await;

        let mut material = None;
        for attempt in 1..=KEY_READ_ATTEMPTS {
            match channel.read_key_material().await {
                Ok(found) => {
                    material = Some(found);
                    break;
                }
                Err(err) if attempt < KEY_READ_ATTEMPTS => {
                    warn!(%err, attempt, "key material read failed");
                    tokio::time::sleep(KEY_READ_RETRY_DELAY).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
        let (challenge, pump_public) =
            material.ok_or(ControllerError::Timeout("pump key material"))?;

        let relay = RelayClient::new(relay_url.as_str())
            .map_err(|err| ControllerError::Relay(err.to_string()))?;
        let integrity_token = self.inner.integrity_token.lock().unwrap().clone();
        let reply = relay
            .key_exchange(&KeyExchangeRequest {
                challenge,
                pump_public_key: pump_public,
                app_public_key: keypair.public_bytes(),
                bt_address: bt_address_bytes(serial),
                device_id,
                integrity_token,
            })
            .await
            .map_err(|err| ControllerError::Relay(err.to_string()))?;
        info!(bytes = reply.encrypted_bytes.len(), "relay returned encrypted key block");

        // The relay round-trip may have outlived the auth window.
        channel.authenticate(&mac).await?;
        tokio::time::sleep(KEY_EXCHANGE_SETTLE).await;

        channel.write_key_payload(&reply.encrypted_bytes).await?;

        let shared = keypair.derive_shared_key(&pump_public);
        let cryptor = PumpCryptor::install(Arc::clone(store), shared)?;
        channel.install_cryptor(cryptor);

        // One validating status read decides the fate of the new key.
        match channel.read_system_status().await? {
            Some(status) => {
                self.update_status(&status);
                info!("renewed session key validated");
                Ok(())
            }
            None => {
                channel.take_cryptor();
                PumpCryptor::clear(store.as_ref())?;
                Err(ControllerError::KeyValidationFailed)
            }
        }
    }
}
