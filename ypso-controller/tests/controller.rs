//! Controller integration tests against the scriptable fake pump.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ypso_ble::fake::FakePump;
use ypso_ble::{auth_password, HistoryStream};
use ypso_controller::{
    ConnectionState, ControllerError, PumpController, PumpEvent,
};
use ypso_crypto::{DeviceKeyPair, PumpCryptor};
use ypso_proto::command::BolusKind;
use ypso_proto::gatt::{
    CHAR_ALERTS_COUNT, CHAR_BOLUS_START_STOP, CHAR_BOLUS_STATUS, CHAR_EVENTS_COUNT,
    CHAR_EVENTS_VALUE, CHAR_SYSTEM_DATE, CHAR_SYSTEM_STATUS, CHAR_SYSTEM_TIME,
};
use ypso_proto::{glb, DeliveryMode};
use ypso_store::{keys, MemoryStore, Store};

const PUMP_KEY: [u8; 32] = [0x11; 32];
const SERIAL: u64 = 10_175_983;
const MAC: [u8; 6] = [0xEC, 0x2A, 0xF0, 0x02, 0xAF, 0x6F];

fn store_with_pairing() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.put_string(keys::DEVICE_MAC, "EC:2A:F0:02:AF:6F").unwrap();
    store.put_string(keys::DEVICE_NAME, "YpsoPump_10175983").unwrap();
    store.put_u64(keys::DEVICE_SERIAL, SERIAL).unwrap();
    store
}

fn paired_controller(pump: &FakePump) -> (PumpController<FakePump>, Arc<MemoryStore>) {
    let store = store_with_pairing();
    PumpCryptor::install(Arc::clone(&store) as Arc<dyn Store>, PUMP_KEY).unwrap();
    let controller = PumpController::new(pump.clone(), Arc::clone(&store) as Arc<dyn Store>);
    (controller, store)
}

/// Minimal one-shot relay: answers every POST with the given hex blob.
fn spawn_relay(encrypted_hex: String) -> (String, Arc<AtomicU32>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let calls_seen = Arc::clone(&calls);

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            calls_seen.fetch_add(1, Ordering::SeqCst);

            // Read headers plus the announced body length.
            let mut data = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).unwrap_or(0);
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
                if let Some(header_end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                    let headers = String::from_utf8_lossy(&data[..header_end]);
                    let content_length = headers
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if data.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }

            let body = format!(
                "{{\"encrypted_bytes\":\"{encrypted_hex}\",\"server_nonce\":\"0042\"}}"
            );
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });

    (format!("http://{addr}"), calls)
}

#[tokio::test(start_paused = true)]
async fn status_episode_connects_authenticates_and_disconnects() {
    let pump = FakePump::new(PUMP_KEY);
    pump.set_status(1, 12345, 80);
    let (controller, _store) = paired_controller(&pump);

    let status = controller.status().await.unwrap();
    assert_eq!(status.mode, DeliveryMode::Basal);
    assert_eq!(status.insulin_units, 123.45);
    assert_eq!(status.battery_percent, 80);

    assert_eq!(pump.auth_passwords(), vec![auth_password(&MAC).to_vec()]);
    assert!(!ypso_ble::PumpLink::is_connected(&pump).await);
    assert_eq!(controller.connection_state(), ConnectionState::Ready);
    assert_eq!(controller.cached_status(), Some(status));
}

#[tokio::test(start_paused = true)]
async fn missing_key_signals_key_exchange() {
    let pump = FakePump::new(PUMP_KEY);
    let store = store_with_pairing();
    let controller = PumpController::new(pump.clone(), store);

    let err = controller.status().await.unwrap_err();
    assert!(matches!(err, ControllerError::KeyMissing));
    assert_eq!(controller.connection_state(), ConnectionState::NeedsKeyExchange);
    assert!(controller.needs_key_exchange());
}

#[tokio::test(start_paused = true)]
async fn critical_command_retries_transient_failures() {
    let pump = FakePump::new(PUMP_KEY);
    // Exhaust the first episode's whole status-retry window.
    for _ in 0..3 {
        pump.enqueue_empty(CHAR_SYSTEM_STATUS);
    }
    let (controller, _store) = paired_controller(&pump);

    controller.set_tbr(50, 30).await.unwrap();

    assert_eq!(pump.connect_count(), 2);
    let commands = pump.commands_on(ypso_proto::gatt::CHAR_TBR_START_STOP);
    assert_eq!(
        commands,
        vec![vec![
            0x32, 0x00, 0x00, 0x00, 0xCD, 0xFF, 0xFF, 0xFF, //
            0x1E, 0x00, 0x00, 0x00, 0xE1, 0xFF, 0xFF, 0xFF,
        ]]
    );
}

#[tokio::test(start_paused = true)]
async fn reads_fail_fast_without_retry() {
    let pump = FakePump::new(PUMP_KEY);
    for _ in 0..3 {
        pump.enqueue_empty(CHAR_SYSTEM_STATUS);
    }
    let (controller, _store) = paired_controller(&pump);

    let err = controller.status().await.unwrap_err();
    assert!(matches!(err, ControllerError::Transport(_)));
    assert_eq!(pump.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_commands_never_overlap() {
    let pump = FakePump::new(PUMP_KEY);
    let (controller, _store) = paired_controller(&pump);

    let (a, b) = tokio::join!(controller.status(), controller.status());
    a.unwrap();
    b.unwrap();
    assert_eq!(pump.connect_count(), 2);
    assert_eq!(pump.max_concurrent_links(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_bolus_reports_delivered_units() {
    let pump = FakePump::new(PUMP_KEY);
    let (controller, _store) = paired_controller(&pump);

    // Bolus status after the cancel: fast block cancelled at 1.20 U.
    let mut status = vec![0x03];
    status.extend_from_slice(&4u32.to_le_bytes());
    status.extend_from_slice(&120u32.to_le_bytes());
    status.extend_from_slice(&200u32.to_le_bytes());
    pump.enqueue_response(CHAR_BOLUS_STATUS, status, true);

    let delivered = controller.cancel_bolus(BolusKind::Fast).await.unwrap();
    assert_eq!(delivered, Some(1.2));

    let commands = pump.commands_on(CHAR_BOLUS_START_STOP);
    let mut expected = vec![0u8; 13];
    expected[12] = 0x01;
    assert_eq!(commands, vec![ypso_proto::append_crc(&expected)]);

    let (replay, _) = controller.subscribe_events();
    assert!(replay.contains(&PumpEvent::BolusCancelled { delivered_units: 1.2 }));
}

#[tokio::test(start_paused = true)]
async fn deliver_bolus_follows_notifications_to_completion() {
    let pump = FakePump::new(PUMP_KEY);
    let (controller, _store) = paired_controller(&pump);

    // Follow-up bolus status: completed, 2.00 U of 2.00 U in.
    let mut status = vec![0x04];
    status.extend_from_slice(&9u32.to_le_bytes());
    status.extend_from_slice(&200u32.to_le_bytes());
    status.extend_from_slice(&200u32.to_le_bytes());
    pump.enqueue_response(CHAR_BOLUS_STATUS, status, true);

    let watcher = {
        let pump = pump.clone();
        tokio::spawn(async move {
            while pump.commands_on(CHAR_BOLUS_START_STOP).is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let mut delivering = vec![0x01];
            delivering.extend_from_slice(&9u32.to_le_bytes());
            delivering.push(0x00);
            delivering.extend_from_slice(&0u32.to_le_bytes());
            pump.notify(ypso_proto::gatt::CHAR_BOLUS_NOTIFICATION, delivering);

            tokio::time::sleep(Duration::from_millis(5)).await;
            let mut completed = vec![0x04];
            completed.extend_from_slice(&9u32.to_le_bytes());
            completed.push(0x00);
            completed.extend_from_slice(&0u32.to_le_bytes());
            pump.notify(ypso_proto::gatt::CHAR_BOLUS_NOTIFICATION, completed);
        })
    };

    let outcome = controller.deliver_bolus(2.0, 0, 0.0).await.unwrap();
    watcher.await.unwrap();

    assert_eq!(outcome.requested_units, 2.0);
    assert_eq!(outcome.delivered_units, Some(2.0));
    assert!(outcome.state.is_terminal());

    // The start command is the 13-byte fast-bolus payload plus trailer.
    let commands = pump.commands_on(CHAR_BOLUS_START_STOP);
    let expected = [0xC8, 0x00, 0x00, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0x01];
    assert_eq!(commands, vec![ypso_proto::append_crc(&expected)]);

    let (replay, _) = controller.subscribe_events();
    assert!(replay.contains(&PumpEvent::BolusStarted { units: None }));
    assert!(replay.contains(&PumpEvent::BolusCompleted { units: 2.0 }));
}

#[tokio::test(start_paused = true)]
async fn cancelled_command_never_leaves_the_link_connected() {
    let pump = FakePump::new(PUMP_KEY);
    let (controller, _store) = paired_controller(&pump);

    // No notifications ever arrive, so this stalls in the terminal wait.
    let task = {
        let controller = controller.clone();
        tokio::spawn(async move {
            let _ = controller.deliver_bolus(2.0, 0, 0.0).await;
        })
    };

    // Wait for the episode to get past the start command.
    while pump.commands_on(CHAR_BOLUS_START_STOP).is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(ypso_ble::PumpLink::is_connected(&pump).await);

    task.abort();
    let _ = task.await;

    // The drop guard's background disconnect gets a chance to run.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!ypso_ble::PumpLink::is_connected(&pump).await);

    // And the command mutex was released with it.
    let status = controller.status().await.unwrap();
    assert_eq!(status.battery_percent, 100);
}

#[tokio::test(start_paused = true)]
async fn sync_clock_writes_date_then_time() {
    let pump = FakePump::new(PUMP_KEY);
    let (controller, _store) = paired_controller(&pump);

    controller.sync_clock(2024, 6, 15, 10, 30, 0).await.unwrap();

    assert_eq!(
        pump.commands_on(CHAR_SYSTEM_DATE),
        vec![ypso_proto::append_crc(&[0xE8, 0x07, 6, 15])]
    );
    assert_eq!(
        pump.commands_on(CHAR_SYSTEM_TIME),
        vec![ypso_proto::append_crc(&[10, 30, 0])]
    );
}

#[tokio::test(start_paused = true)]
async fn polling_emits_history_deltas_after_baseline() {
    let pump = FakePump::new(PUMP_KEY);
    let (controller, _store) = paired_controller(&pump);

    // First poll: counts only, establishes the baseline.
    pump.enqueue_response(CHAR_EVENTS_COUNT, glb::encode(2).to_vec(), false);
    pump.enqueue_response(CHAR_ALERTS_COUNT, glb::encode(1).to_vec(), false);
    controller.poll().await.unwrap();

    // Second poll: one new event entry (fast bolus completed, 1.50 U).
    pump.enqueue_response(CHAR_EVENTS_COUNT, glb::encode(3).to_vec(), false);
    pump.enqueue_response(CHAR_ALERTS_COUNT, glb::encode(1).to_vec(), false);
    let mut entry = Vec::new();
    entry.extend_from_slice(&1000u32.to_le_bytes());
    entry.push(2);
    entry.extend_from_slice(&150u16.to_le_bytes());
    entry.extend_from_slice(&[0u8; 4]);
    entry.extend_from_slice(&3u32.to_le_bytes());
    entry.extend_from_slice(&2u16.to_le_bytes());
    pump.enqueue_response(CHAR_EVENTS_VALUE, entry, true);

    controller.poll().await.unwrap();

    let (replay, _) = controller.subscribe_events();
    assert!(replay.contains(&PumpEvent::BolusCompleted { units: 1.5 }));
}

#[tokio::test]
async fn key_death_triggers_exactly_one_renewal() {
    let pump = FakePump::new([0x99; 32]); // pump already rotated away
    let (controller, store) = paired_controller(&pump);

    // Identity material for the exchange.
    let app_pair = DeviceKeyPair::load_or_generate(store.as_ref()).unwrap();
    let pump_pair = DeviceKeyPair::generate();
    let shared = pump_pair.derive_shared_key(&app_pair.public_bytes());

    let mut material = [0u8; 64];
    material[..32].copy_from_slice(&[0x44; 32]);
    material[32..].copy_from_slice(&pump_pair.public_bytes());
    pump.set_key_material(material);
    pump.install_key_on_exchange(shared);

    let blob = vec![0xAB; 80];
    let (relay_url, relay_calls) = spawn_relay(data_encoding::HEXLOWER.encode(&blob));
    store.put_string(keys::RELAY_URL, &relay_url).unwrap();

    let status = controller.status().await.unwrap();
    assert_eq!(status.battery_percent, 100);

    // Exactly one relay call, one key write, and the new key persisted.
    assert_eq!(relay_calls.load(Ordering::SeqCst), 1);
    assert_eq!(pump.key_payload(), Some(blob));
    assert_eq!(
        store.get_bytes(keys::SHARED_KEY).unwrap(),
        Some(shared.to_vec())
    );
    assert!(!controller.needs_key_exchange());
    assert_eq!(controller.connection_state(), ConnectionState::Ready);

    let (replay, _) = controller.subscribe_events();
    assert!(replay.contains(&PumpEvent::KeyRenewed));
}

#[tokio::test]
async fn failed_validation_discards_the_new_key() {
    let pump = FakePump::new([0x99; 32]);
    let (controller, store) = paired_controller(&pump);

    let pump_pair = DeviceKeyPair::generate();
    let mut material = [0u8; 64];
    material[32..].copy_from_slice(&pump_pair.public_bytes());
    pump.set_key_material(material);
    // No install_key_on_exchange: the pump keeps rejecting everything.

    let (relay_url, relay_calls) = spawn_relay("abcd".repeat(16));
    store.put_string(keys::RELAY_URL, &relay_url).unwrap();

    let err = controller.status().await.unwrap_err();
    assert!(matches!(err, ControllerError::KeyValidationFailed));

    assert_eq!(relay_calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.get_bytes(keys::SHARED_KEY).unwrap(), None);
    assert!(controller.needs_key_exchange());
    assert_eq!(controller.connection_state(), ConnectionState::NeedsKeyExchange);
}

#[tokio::test]
async fn missing_relay_url_fails_renewal_immediately() {
    let pump = FakePump::new([0x99; 32]);
    let (controller, _store) = paired_controller(&pump);

    let err = controller.status().await.unwrap_err();
    assert!(matches!(err, ControllerError::RelayNotConfigured));
    assert_eq!(controller.connection_state(), ConnectionState::NeedsKeyExchange);
}

#[tokio::test]
async fn pairing_derives_the_mac_and_exchanges_keys() {
    let pump = FakePump::new([0x99; 32]);
    let store = Arc::new(MemoryStore::new());

    let app_pair = DeviceKeyPair::load_or_generate(store.as_ref()).unwrap();
    let pump_pair = DeviceKeyPair::generate();
    let shared = pump_pair.derive_shared_key(&app_pair.public_bytes());

    let mut material = [0u8; 64];
    material[..32].copy_from_slice(&[0x55; 32]);
    material[32..].copy_from_slice(&pump_pair.public_bytes());
    pump.set_key_material(material);
    pump.install_key_on_exchange(shared);

    let (relay_url, _calls) = spawn_relay("00".repeat(48));
    store.put_string(keys::RELAY_URL, &relay_url).unwrap();

    let controller = PumpController::new(pump.clone(), Arc::clone(&store) as Arc<dyn Store>);
    assert_eq!(controller.connection_state(), ConnectionState::NotPaired);

    controller.pair(SERIAL).await.unwrap();

    assert_eq!(
        store.get_string(keys::DEVICE_MAC).unwrap().as_deref(),
        Some("EC:2A:F0:02:AF:6F")
    );
    assert_eq!(controller.connection_state(), ConnectionState::Ready);
    assert_eq!(pump.auth_passwords()[0], auth_password(&MAC).to_vec());

    // The fresh session works end to end.
    let status = controller.status().await.unwrap();
    assert_eq!(status.mode, DeliveryMode::Basal);
}

#[tokio::test(start_paused = true)]
async fn history_fetch_returns_recent_entries() {
    let pump = FakePump::new(PUMP_KEY);
    let (controller, _store) = paired_controller(&pump);

    pump.enqueue_response(CHAR_EVENTS_COUNT, glb::encode(2).to_vec(), false);
    for index in 0..2u32 {
        let mut entry = Vec::new();
        entry.extend_from_slice(&(500 + index).to_le_bytes());
        entry.push(10); // tbr completed
        entry.extend_from_slice(&75u16.to_le_bytes());
        entry.extend_from_slice(&30u16.to_le_bytes());
        entry.extend_from_slice(&0u16.to_le_bytes());
        entry.extend_from_slice(&index.to_le_bytes());
        entry.extend_from_slice(&(index as u16).to_le_bytes());
        pump.enqueue_response(CHAR_EVENTS_VALUE, entry, true);
    }

    let entries = controller.fetch_history(HistoryStream::Events, 10).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].value1, 75);
    assert_eq!(entries[1].sequence, 1);
}
