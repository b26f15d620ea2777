//! Scriptable in-memory pump implementing [`PumpLink`].
//!
//! Speaks the real wire protocol end to end: responses are CRC-trailed,
//! session-encrypted with the fake's own counter state, and framed, so
//! the pipelines in [`crate::channel`] run against it unchanged. Tests
//! script failure modes (garbage envelopes, empty frames, rejected
//! auth, key rotation) through the handle, which is cheaply cloneable.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use rand_core::{OsRng, RngCore};
use uuid::Uuid;

use ypso_crypto::aead::{self, NONCE_LEN};
use ypso_proto::frame::{assemble, chunk, total_frames};
use ypso_proto::gatt::{
    CHAR_AUTH_PASSWORD, CHAR_EXTENDED_READ, CHAR_KEY_READ, CHAR_KEY_WRITE, CHAR_SYSTEM_STATUS,
};
use ypso_proto::append_crc;

use crate::link::{LinkError, Notification, NotificationStream, PumpLink};

/// Pump-side session state, independent of [`ypso_crypto::PumpCryptor`].
struct PumpSession {
    key: [u8; 32],
    reboot: u32,
    counter: u64,
}

impl PumpSession {
    fn seal(&mut self, payload: &[u8]) -> Vec<u8> {
        self.counter += 1;
        let mut plaintext = Vec::with_capacity(payload.len() + 12);
        plaintext.extend_from_slice(payload);
        plaintext.extend_from_slice(&self.reboot.to_le_bytes());
        plaintext.extend_from_slice(&self.counter.to_le_bytes());

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let mut envelope = aead::encrypt(&plaintext, &[], &nonce, &self.key).expect("seal");
        envelope.extend_from_slice(&nonce);
        envelope
    }

    fn open(&self, envelope: &[u8]) -> Option<Vec<u8>> {
        if envelope.len() < NONCE_LEN + 16 {
            return None;
        }
        let (sealed, nonce) = envelope.split_at(envelope.len() - NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce.try_into().unwrap();
        let mut plaintext = aead::decrypt(sealed, &[], &nonce, &self.key).ok()?;
        if plaintext.len() < 12 {
            return None;
        }
        plaintext.truncate(plaintext.len() - 12);
        Some(plaintext)
    }
}

enum Scripted {
    /// Normal encrypted response, optionally CRC-trailed.
    Encrypted { payload: Vec<u8>, with_crc: bool },
    /// Well-framed envelope that will not decrypt.
    Garbage,
    /// Empty first frame.
    Empty,
}

#[derive(Default)]
struct Counters {
    reads: HashMap<Uuid, u32>,
    connects: u32,
    active_links: u32,
    max_active_links: u32,
}

struct PumpState {
    connected: bool,
    session: PumpSession,
    reject_auth: bool,
    auth_passwords: Vec<Vec<u8>>,
    /// 6-byte system status payload served when nothing is scripted.
    status: Vec<u8>,
    fail_status_decrypts: u32,
    scripted: HashMap<Uuid, VecDeque<Scripted>>,
    pending_tail: VecDeque<Vec<u8>>,
    drop_next_tail: bool,
    inbound: HashMap<Uuid, Vec<Vec<u8>>>,
    commands: Vec<(Uuid, Vec<u8>)>,
    plain_reads: HashMap<Uuid, Vec<u8>>,
    key_material: [u8; 64],
    key_payload: Option<Vec<u8>>,
    key_after_exchange: Option<[u8; 32]>,
    subscribers: Vec<UnboundedSender<Notification>>,
    counters: Counters,
}

/// Handle to a scriptable fake pump.
#[derive(Clone)]
pub struct FakePump {
    state: Arc<Mutex<PumpState>>,
}

impl FakePump {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            state: Arc::new(Mutex::new(PumpState {
                connected: false,
                session: PumpSession { key, reboot: 0, counter: 0 },
                reject_auth: false,
                auth_passwords: Vec::new(),
                status: vec![1, 0, 0, 0, 0, 100], // basal, empty reservoir reading, full battery
                fail_status_decrypts: 0,
                scripted: HashMap::new(),
                pending_tail: VecDeque::new(),
                drop_next_tail: false,
                inbound: HashMap::new(),
                commands: Vec::new(),
                plain_reads: HashMap::new(),
                key_material: [0u8; 64],
                key_payload: None,
                key_after_exchange: None,
                subscribers: Vec::new(),
                counters: Counters::default(),
            })),
        }
    }

    /// Replace the pump-side session key, as a pump-initiated rotation
    /// does. Everything encrypted under the old key now fails to open.
    pub fn rotate_key(&self, key: [u8; 32]) {
        let mut state = self.state.lock().unwrap();
        state.session = PumpSession { key, reboot: state.session.reboot, counter: 0 };
    }

    pub fn set_reboot_counter(&self, reboot: u32) {
        self.state.lock().unwrap().session.reboot = reboot;
    }

    /// Set the auto-served System Status payload.
    pub fn set_status(&self, mode: u8, insulin_centi: u32, battery: u8) {
        let mut status = vec![mode];
        status.extend_from_slice(&insulin_centi.to_le_bytes());
        status.push(battery);
        self.state.lock().unwrap().status = status;
    }

    /// The next `n` status reads return envelopes that fail to decrypt.
    pub fn fail_next_status_decrypts(&self, n: u32) {
        self.state.lock().unwrap().fail_status_decrypts = n;
    }

    pub fn reject_auth(&self, reject: bool) {
        self.state.lock().unwrap().reject_auth = reject;
    }

    pub fn enqueue_response(&self, characteristic: Uuid, payload: Vec<u8>, with_crc: bool) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(characteristic)
            .or_default()
            .push_back(Scripted::Encrypted { payload, with_crc });
    }

    pub fn enqueue_garbage(&self, characteristic: Uuid) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(characteristic)
            .or_default()
            .push_back(Scripted::Garbage);
    }

    pub fn enqueue_empty(&self, characteristic: Uuid) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(characteristic)
            .or_default()
            .push_back(Scripted::Empty);
    }

    pub fn set_plain_read(&self, characteristic: Uuid, value: Vec<u8>) {
        self.state.lock().unwrap().plain_reads.insert(characteristic, value);
    }

    pub fn set_key_material(&self, material: [u8; 64]) {
        self.state.lock().unwrap().key_material = material;
    }

    /// Arm the key exchange: once a key payload is written, the pump
    /// session switches to `key` with zeroed counters.
    pub fn install_key_on_exchange(&self, key: [u8; 32]) {
        self.state.lock().unwrap().key_after_exchange = Some(key);
    }

    /// Swallow the last continuation frame of the next multi-frame
    /// response so the read comes up short.
    pub fn drop_next_continuation_frame(&self) {
        self.state.lock().unwrap().drop_next_tail = true;
    }

    /// Push a notification to every subscriber.
    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state
            .subscribers
            .retain(|tx| tx.unbounded_send(Notification { characteristic, value: value.clone() }).is_ok());
    }

    /// Decrypted command payloads received so far, CRC trailer included.
    pub fn commands(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Raw decrypted command payloads on one characteristic, any CRC
    /// trailer still attached.
    pub fn commands_on(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(uuid, _)| *uuid == characteristic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn auth_passwords(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().auth_passwords.clone()
    }

    pub fn key_payload(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().key_payload.clone()
    }

    pub fn read_count(&self, characteristic: Uuid) -> u32 {
        self.state
            .lock()
            .unwrap()
            .counters
            .reads
            .get(&characteristic)
            .copied()
            .unwrap_or(0)
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().unwrap().counters.connects
    }

    /// Most link sessions ever open at once; 1 when episodes serialize.
    pub fn max_concurrent_links(&self) -> u32 {
        self.state.lock().unwrap().counters.max_active_links
    }

    fn frame_out(state: &mut PumpState, envelope: Vec<u8>) -> Vec<u8> {
        let frames = chunk(&envelope).expect("fake envelope fits framing");
        let mut iter = frames.into_iter();
        let first = iter.next().expect("at least one frame");
        state.pending_tail.extend(iter);
        if state.drop_next_tail && !state.pending_tail.is_empty() {
            state.pending_tail.pop_back();
            state.drop_next_tail = false;
        }
        first
    }

    fn serve(state: &mut PumpState, characteristic: Uuid) -> Result<Vec<u8>, LinkError> {
        if let Some(queue) = state.scripted.get_mut(&characteristic) {
            if let Some(scripted) = queue.pop_front() {
                return Ok(match scripted {
                    Scripted::Encrypted { payload, with_crc } => {
                        let body = if with_crc { append_crc(&payload) } else { payload };
                        let envelope = state.session.seal(&body);
                        Self::frame_out(state, envelope)
                    }
                    Scripted::Garbage => {
                        let mut envelope = vec![0u8; 48];
                        OsRng.fill_bytes(&mut envelope);
                        Self::frame_out(state, envelope)
                    }
                    Scripted::Empty => vec![0x10],
                });
            }
        }

        if characteristic == CHAR_SYSTEM_STATUS {
            if state.fail_status_decrypts > 0 {
                state.fail_status_decrypts -= 1;
                let mut envelope = vec![0u8; 48];
                OsRng.fill_bytes(&mut envelope);
                return Ok(Self::frame_out(state, envelope));
            }
            let body = append_crc(&state.status.clone());
            let envelope = state.session.seal(&body);
            return Ok(Self::frame_out(state, envelope));
        }

        Err(LinkError::Transport(format!(
            "no scripted response for {characteristic}"
        )))
    }
}

#[async_trait]
impl PumpLink for FakePump {
    async fn connect(&self) -> Result<(), LinkError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            state.connected = true;
            state.counters.connects += 1;
            state.counters.active_links += 1;
            state.counters.max_active_links =
                state.counters.max_active_links.max(state.counters.active_links);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let mut state = self.state.lock().unwrap();
        if state.connected {
            state.connected = false;
            state.counters.active_links -= 1;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, LinkError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        *state.counters.reads.entry(characteristic).or_default() += 1;

        if characteristic == CHAR_EXTENDED_READ {
            return Ok(state.pending_tail.pop_front().unwrap_or_default());
        }
        if characteristic == CHAR_KEY_READ {
            return Ok(state.key_material.to_vec());
        }
        if let Some(value) = state.plain_reads.get(&characteristic) {
            return Ok(value.clone());
        }
        Self::serve(&mut state, characteristic)
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), LinkError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }

        if characteristic == CHAR_AUTH_PASSWORD {
            if state.reject_auth {
                return Err(LinkError::Transport("auth write rejected".into()));
            }
            state.auth_passwords.push(payload.to_vec());
            return Ok(());
        }

        // Frame accumulation: plaintext key writes assemble raw, other
        // characteristics assemble then decrypt with the pump session.
        let frames = state.inbound.entry(characteristic).or_default();
        frames.push(payload.to_vec());
        let total = total_frames(frames[0][0]);
        if frames.len() < total {
            return Ok(());
        }
        let frames = state.inbound.remove(&characteristic).unwrap_or_default();
        let body = assemble(&frames);

        if characteristic == CHAR_KEY_WRITE {
            state.key_payload = Some(body);
            if let Some(key) = state.key_after_exchange.take() {
                let reboot = state.session.reboot;
                state.session = PumpSession { key, reboot, counter: 0 };
            }
            return Ok(());
        }

        match state.session.open(&body) {
            Some(command) => state.commands.push((characteristic, command)),
            None => {
                return Err(LinkError::Transport(
                    "command failed to decrypt on the pump".into(),
                ))
            }
        }
        Ok(())
    }

    async fn write_no_response(
        &self,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        self.write(characteristic, payload).await
    }

    async fn subscribe(&self, _characteristic: Uuid) -> Result<(), LinkError> {
        if !self.state.lock().unwrap().connected {
            return Err(LinkError::NotConnected);
        }
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream, LinkError> {
        let (tx, rx) = mpsc::unbounded();
        self.state.lock().unwrap().subscribers.push(tx);
        Ok(rx.boxed())
    }
}
