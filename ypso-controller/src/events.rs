//! Pump events: the edge-triggered processor and the replayable bus.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::broadcast;

use ypso_proto::{BolusNotification, BolusState, DeliveryMode, HistoryEvent, SystemStatus};

/// Battery thresholds in percent.
const BATTERY_LOW: u8 = 20;
const BATTERY_EMPTY: u8 = 5;

/// Reservoir thresholds in units.
const RESERVOIR_LOW: f64 = 20.0;
const RESERVOIR_EMPTY: f64 = 5.0;

/// A reservoir jump this large means the cartridge was swapped.
const CARTRIDGE_JUMP: f64 = 50.0;

/// How many past events a fresh subscriber receives.
const REPLAY: usize = 10;

/// User-facing pump events.
#[derive(Debug, Clone, PartialEq)]
pub enum PumpEvent {
    BolusStarted { units: Option<f64> },
    BolusCompleted { units: f64 },
    BolusCancelled { delivered_units: f64 },
    TbrStarted { percent: Option<u16>, duration_min: Option<u16> },
    TbrCompleted,
    TbrCancelled,
    ModeChanged { from: DeliveryMode, to: DeliveryMode },
    DeliveryStopped,
    BatteryLow { percent: u8 },
    BatteryEmpty { percent: u8 },
    ReservoirLow { units: f64 },
    ReservoirEmpty { units: f64 },
    CartridgeChanged { units: f64 },
    BatteryAlert,
    ReservoirAlert,
    OcclusionAlert,
    AutoStopAlert,
    KeyRenewed,
    NeedsKeyExchange,
}

/// Map a decoded history event onto the user-facing kind.
pub fn event_from_history(event: HistoryEvent) -> PumpEvent {
    match event {
        HistoryEvent::FastBolusRunning { units } => PumpEvent::BolusStarted { units: Some(units) },
        HistoryEvent::FastBolusCompleted { units } => PumpEvent::BolusCompleted { units },
        HistoryEvent::FastBolusCancelled { units } => {
            PumpEvent::BolusCancelled { delivered_units: units }
        }
        HistoryEvent::TbrRunning { percent, duration_min } => PumpEvent::TbrStarted {
            percent: Some(percent),
            duration_min: Some(duration_min),
        },
        HistoryEvent::TbrCompleted { .. } => PumpEvent::TbrCompleted,
        HistoryEvent::TbrCancelled { .. } => PumpEvent::TbrCancelled,
        HistoryEvent::BatteryAlert => PumpEvent::BatteryAlert,
        HistoryEvent::ReservoirAlert => PumpEvent::ReservoirAlert,
        HistoryEvent::OcclusionAlert => PumpEvent::OcclusionAlert,
        HistoryEvent::AutoStopWarning | HistoryEvent::AutoStop => PumpEvent::AutoStopAlert,
    }
}

/// Edge-triggered event detection over status snapshots and bolus
/// notifications. The first observation after a reset only establishes
/// the baseline.
#[derive(Debug, Default)]
pub struct EventProcessor {
    last_battery: Option<u8>,
    last_reservoir: Option<f64>,
    last_mode: Option<DeliveryMode>,
    last_fast_state: Option<BolusState>,
    last_slow_state: Option<BolusState>,
}

impl EventProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all last-known values so the next snapshot is a baseline.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn on_status(&mut self, status: &SystemStatus) -> Vec<PumpEvent> {
        let mut events = Vec::new();

        if let Some(last) = self.last_battery {
            let now = status.battery_percent;
            if last >= BATTERY_LOW && now < BATTERY_LOW {
                events.push(PumpEvent::BatteryLow { percent: now });
            }
            if last >= BATTERY_EMPTY && now < BATTERY_EMPTY {
                events.push(PumpEvent::BatteryEmpty { percent: now });
            }
        }
        self.last_battery = Some(status.battery_percent);

        if let Some(last) = self.last_reservoir {
            let now = status.insulin_units;
            if last >= RESERVOIR_LOW && now < RESERVOIR_LOW {
                events.push(PumpEvent::ReservoirLow { units: now });
            }
            if last >= RESERVOIR_EMPTY && now < RESERVOIR_EMPTY {
                events.push(PumpEvent::ReservoirEmpty { units: now });
            }
            if now > last + CARTRIDGE_JUMP {
                events.push(PumpEvent::CartridgeChanged { units: now });
            }
        }
        self.last_reservoir = Some(status.insulin_units);

        if let Some(last) = self.last_mode {
            let now = status.mode;
            if last != now {
                events.push(PumpEvent::ModeChanged { from: last, to: now });
                if now == DeliveryMode::Stopped {
                    events.push(PumpEvent::DeliveryStopped);
                }
                if now == DeliveryMode::Tbr {
                    events.push(PumpEvent::TbrStarted { percent: None, duration_min: None });
                }
                if last == DeliveryMode::Tbr && now == DeliveryMode::Basal {
                    events.push(PumpEvent::TbrCompleted);
                }
            }
        }
        self.last_mode = Some(status.mode);

        events
    }

    /// Notifications only ever produce `BolusStarted`, on a transition
    /// into delivering; terminal events come from the command path where
    /// the amounts are known.
    pub fn on_bolus_notification(&mut self, notification: &BolusNotification) -> Vec<PumpEvent> {
        let mut events = Vec::new();

        let fast_entered = self.last_fast_state != Some(BolusState::Delivering)
            && notification.fast_state == BolusState::Delivering;
        let slow_entered = self.last_slow_state != Some(BolusState::Delivering)
            && notification.slow_state == BolusState::Delivering;
        if fast_entered || slow_entered {
            events.push(PumpEvent::BolusStarted { units: None });
        }

        self.last_fast_state = Some(notification.fast_state);
        self.last_slow_state = Some(notification.slow_state);
        events
    }
}

/// Broadcast bus with a small replay window for late subscribers.
pub struct EventBus {
    sender: broadcast::Sender<PumpEvent>,
    replay: Mutex<VecDeque<PumpEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender, replay: Mutex::new(VecDeque::with_capacity(REPLAY)) }
    }

    pub fn emit(&self, event: PumpEvent) {
        let mut replay = self.replay.lock().unwrap();
        if replay.len() == REPLAY {
            replay.pop_front();
        }
        replay.push_back(event.clone());
        let _ = self.sender.send(event);
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = PumpEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Recent events plus a live receiver for what follows.
    pub fn subscribe(&self) -> (Vec<PumpEvent>, broadcast::Receiver<PumpEvent>) {
        let replay = self.replay.lock().unwrap().iter().cloned().collect();
        (replay, self.sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(mode: DeliveryMode, units: f64, battery: u8) -> SystemStatus {
        SystemStatus { mode, insulin_units: units, battery_percent: battery }
    }

    #[test]
    fn first_status_is_baseline_only() {
        let mut processor = EventProcessor::new();
        let events = processor.on_status(&status(DeliveryMode::Stopped, 3.0, 4));
        assert!(events.is_empty());
    }

    #[test]
    fn battery_thresholds_fire_once_per_crossing() {
        let mut processor = EventProcessor::new();
        processor.on_status(&status(DeliveryMode::Basal, 100.0, 60));

        let events = processor.on_status(&status(DeliveryMode::Basal, 100.0, 18));
        assert_eq!(events, vec![PumpEvent::BatteryLow { percent: 18 }]);

        // Still low, no repeat.
        let events = processor.on_status(&status(DeliveryMode::Basal, 100.0, 15));
        assert!(events.is_empty());

        let events = processor.on_status(&status(DeliveryMode::Basal, 100.0, 3));
        assert_eq!(events, vec![PumpEvent::BatteryEmpty { percent: 3 }]);
    }

    #[test]
    fn sharp_drop_crosses_both_battery_thresholds() {
        let mut processor = EventProcessor::new();
        processor.on_status(&status(DeliveryMode::Basal, 100.0, 60));
        let events = processor.on_status(&status(DeliveryMode::Basal, 100.0, 2));
        assert_eq!(
            events,
            vec![
                PumpEvent::BatteryLow { percent: 2 },
                PumpEvent::BatteryEmpty { percent: 2 },
            ]
        );
    }

    #[test]
    fn reservoir_thresholds_and_cartridge_jump() {
        let mut processor = EventProcessor::new();
        processor.on_status(&status(DeliveryMode::Basal, 21.0, 80));

        let events = processor.on_status(&status(DeliveryMode::Basal, 19.5, 80));
        assert_eq!(events, vec![PumpEvent::ReservoirLow { units: 19.5 }]);

        let events = processor.on_status(&status(DeliveryMode::Basal, 4.0, 80));
        assert_eq!(events, vec![PumpEvent::ReservoirEmpty { units: 4.0 }]);

        let events = processor.on_status(&status(DeliveryMode::Basal, 160.0, 80));
        assert_eq!(events, vec![PumpEvent::CartridgeChanged { units: 160.0 }]);
    }

    #[test]
    fn mode_transitions() {
        let mut processor = EventProcessor::new();
        processor.on_status(&status(DeliveryMode::Basal, 100.0, 80));

        let events = processor.on_status(&status(DeliveryMode::Tbr, 100.0, 80));
        assert_eq!(
            events,
            vec![
                PumpEvent::ModeChanged { from: DeliveryMode::Basal, to: DeliveryMode::Tbr },
                PumpEvent::TbrStarted { percent: None, duration_min: None },
            ]
        );

        let events = processor.on_status(&status(DeliveryMode::Basal, 100.0, 80));
        assert_eq!(
            events,
            vec![
                PumpEvent::ModeChanged { from: DeliveryMode::Tbr, to: DeliveryMode::Basal },
                PumpEvent::TbrCompleted,
            ]
        );

        let events = processor.on_status(&status(DeliveryMode::Stopped, 100.0, 80));
        assert_eq!(
            events,
            vec![
                PumpEvent::ModeChanged { from: DeliveryMode::Basal, to: DeliveryMode::Stopped },
                PumpEvent::DeliveryStopped,
            ]
        );
    }

    #[test]
    fn bolus_notification_emits_started_once() {
        let mut processor = EventProcessor::new();
        let idle = BolusNotification {
            fast_state: BolusState::Idle,
            fast_sequence: 1,
            slow_state: BolusState::Idle,
            slow_sequence: 0,
        };
        assert!(processor.on_bolus_notification(&idle).is_empty());

        let delivering = BolusNotification { fast_state: BolusState::Delivering, ..idle };
        assert_eq!(
            processor.on_bolus_notification(&delivering),
            vec![PumpEvent::BolusStarted { units: None }]
        );
        assert!(processor.on_bolus_notification(&delivering).is_empty());

        let completed = BolusNotification { fast_state: BolusState::Completed, ..idle };
        assert!(processor.on_bolus_notification(&completed).is_empty());
    }

    #[test]
    fn reset_reestablishes_baseline() {
        let mut processor = EventProcessor::new();
        processor.on_status(&status(DeliveryMode::Basal, 100.0, 80));
        processor.reset();
        let events = processor.on_status(&status(DeliveryMode::Stopped, 2.0, 2));
        assert!(events.is_empty());
    }

    #[test]
    fn bus_replays_recent_events_to_late_subscribers() {
        let bus = EventBus::new();
        for i in 0..15u8 {
            bus.emit(PumpEvent::BatteryLow { percent: i });
        }
        let (replay, mut rx) = bus.subscribe();
        assert_eq!(replay.len(), 10);
        assert_eq!(replay[0], PumpEvent::BatteryLow { percent: 5 });
        assert_eq!(replay[9], PumpEvent::BatteryLow { percent: 14 });

        bus.emit(PumpEvent::TbrCompleted);
        assert_eq!(rx.try_recv().unwrap(), PumpEvent::TbrCompleted);
    }
}
