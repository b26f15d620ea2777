//! Counter-stamped session cryptor.
//!
//! Every encrypted write carries the current reboot counter and the next
//! write counter in the last 12 plaintext bytes; every decrypted response
//! carries the pump's own pair. When the pump reports a new reboot
//! counter the local write counter restarts at zero in the same step;
//! the pump rejects writes stamped with a stale reboot epoch.
//!
//! Counters are persisted before an envelope leaves this module, so a
//! crash between encrypt and the BLE write can never reuse a counter.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand_core::{OsRng, RngCore};
use thiserror::Error;

use ypso_store::{keys, Store, StoreError};

use crate::aead::{self, NONCE_LEN, TAG_LEN};
use crate::KEY_LEN;

/// Counter tail appended to every plaintext: reboot(4) ‖ numeric(8).
const COUNTER_TAIL_LEN: usize = 12;

/// Smallest well-formed envelope: empty plaintext + tag + nonce.
const MIN_ENVELOPE_LEN: usize = TAG_LEN + NONCE_LEN;

/// Nominal key lifetime written at install time. Renewal is driven by
/// decrypt failure, never by this horizon.
const KEY_HORIZON_MILLIS: u64 = 3650 * 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Tag mismatch or malformed envelope. The controller treats this as
    /// the pump having rotated the session key.
    #[error("envelope failed to decrypt")]
    DecryptFailed,
    #[error("no shared key persisted")]
    KeyMissing,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Snapshot of the session counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionCounters {
    /// Numeric counter from the most recent successful decrypt.
    pub read: u64,
    /// Strictly increasing per encrypt within a reboot epoch.
    pub write: u64,
    /// The pump's reboot epoch, imported on decrypt.
    pub reboot: u32,
}

/// Stateful session cipher bound to one shared key and one store.
pub struct PumpCryptor {
    key: [u8; KEY_LEN],
    counters: SessionCounters,
    store: Arc<dyn Store>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl PumpCryptor {
    /// Install a freshly exchanged key: counters start at zero and the
    /// key is persisted with a far-future expiry.
    pub fn install(store: Arc<dyn Store>, key: [u8; KEY_LEN]) -> Result<Self, CryptoError> {
        store.put_bytes(keys::SHARED_KEY, &key)?;
        store.put_u64(keys::SHARED_KEY_EXPIRES_AT, now_millis() + KEY_HORIZON_MILLIS)?;
        let cryptor = Self { key, counters: SessionCounters::default(), store };
        cryptor.persist_counters()?;
        Ok(cryptor)
    }

    /// Restore the session from the store. Returns `None` when no key is
    /// persisted or the stored expiry has passed.
    pub fn from_store(store: Arc<dyn Store>) -> Result<Option<Self>, CryptoError> {
        let Some(raw) = store.get_bytes(keys::SHARED_KEY)? else {
            return Ok(None);
        };
        let key: [u8; KEY_LEN] = match raw.try_into() {
            Ok(key) => key,
            Err(_) => return Ok(None),
        };
        if let Some(expires_at) = store.get_u64(keys::SHARED_KEY_EXPIRES_AT)? {
            if expires_at <= now_millis() {
                return Ok(None);
            }
        }
        let counters = SessionCounters {
            read: store.get_u64(keys::READ_COUNTER)?.unwrap_or(0),
            write: store.get_u64(keys::WRITE_COUNTER)?.unwrap_or(0),
            reboot: store.get_u64(keys::REBOOT_COUNTER)?.unwrap_or(0) as u32,
        };
        Ok(Some(Self { key, counters, store }))
    }

    /// Drop the persisted session entirely (key death).
    pub fn clear(store: &dyn Store) -> Result<(), StoreError> {
        store.remove(keys::SHARED_KEY)?;
        store.remove(keys::SHARED_KEY_EXPIRES_AT)?;
        store.remove(keys::READ_COUNTER)?;
        store.remove(keys::WRITE_COUNTER)?;
        store.remove(keys::REBOOT_COUNTER)?;
        Ok(())
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    fn persist_counters(&self) -> Result<(), StoreError> {
        self.store.put_u64(keys::READ_COUNTER, self.counters.read)?;
        self.store.put_u64(keys::WRITE_COUNTER, self.counters.write)?;
        self.store
            .put_u64(keys::REBOOT_COUNTER, u64::from(self.counters.reboot))?;
        Ok(())
    }

    /// Encrypt `payload` into `ciphertext ‖ tag ‖ nonce`.
    pub fn encrypt(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let next_write = self.counters.write + 1;
        let mut plaintext = Vec::with_capacity(payload.len() + COUNTER_TAIL_LEN);
        plaintext.extend_from_slice(payload);
        plaintext.extend_from_slice(&self.counters.reboot.to_le_bytes());
        plaintext.extend_from_slice(&next_write.to_le_bytes());

        self.counters.write = next_write;
        self.persist_counters()?;

        let mut envelope =
            aead::encrypt(&plaintext, &[], &nonce, &self.key).map_err(|_| CryptoError::DecryptFailed)?;
        envelope.extend_from_slice(&nonce);
        Ok(envelope)
    }

    /// Open `ciphertext ‖ tag ‖ nonce`, import the pump's counter tail,
    /// and return the bare payload.
    pub fn decrypt(&mut self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if envelope.len() < MIN_ENVELOPE_LEN {
            return Err(CryptoError::DecryptFailed);
        }
        let (sealed, nonce) = envelope.split_at(envelope.len() - NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce.try_into().unwrap();

        let mut plaintext =
            aead::decrypt(sealed, &[], &nonce, &self.key).map_err(|_| CryptoError::DecryptFailed)?;
        if plaintext.len() < COUNTER_TAIL_LEN {
            return Err(CryptoError::DecryptFailed);
        }

        let tail_at = plaintext.len() - COUNTER_TAIL_LEN;
        let peer_reboot = u32::from_le_bytes(plaintext[tail_at..tail_at + 4].try_into().unwrap());
        let peer_numeric = u64::from_le_bytes(plaintext[tail_at + 4..].try_into().unwrap());

        if peer_reboot != self.counters.reboot {
            self.counters.reboot = peer_reboot;
            self.counters.write = 0;
        }
        self.counters.read = peer_numeric;
        self.persist_counters()?;

        plaintext.truncate(tail_at);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ypso_store::MemoryStore;

    fn fresh(key: u8) -> PumpCryptor {
        PumpCryptor::install(Arc::new(MemoryStore::new()), [key; KEY_LEN]).unwrap()
    }

    #[test]
    fn encrypt_then_decrypt_between_sessions() {
        let mut sender = fresh(0x55);
        let mut receiver = fresh(0x55);

        let envelope = sender.encrypt(b"hello pump").unwrap();
        assert_eq!(envelope.len(), 10 + COUNTER_TAIL_LEN + TAG_LEN + NONCE_LEN);

        let payload = receiver.decrypt(&envelope).unwrap();
        assert_eq!(payload, b"hello pump");
        assert_eq!(receiver.counters().read, 1);
    }

    #[test]
    fn empty_payload_envelope_is_forty_bytes_plus_tail() {
        let mut cryptor = fresh(0x01);
        let envelope = cryptor.encrypt(&[]).unwrap();
        assert_eq!(envelope.len(), COUNTER_TAIL_LEN + TAG_LEN + NONCE_LEN);
    }

    #[test]
    fn write_counter_increments_per_encrypt() {
        let mut cryptor = fresh(0x02);
        for expected in 1..=5u64 {
            cryptor.encrypt(b"tick").unwrap();
            assert_eq!(cryptor.counters().write, expected);
        }
    }

    #[test]
    fn reboot_change_resets_write_counter() {
        let store = Arc::new(MemoryStore::new());
        let mut local = PumpCryptor::install(store, [0x33; KEY_LEN]).unwrap();
        local.counters.reboot = 3;
        for _ in 0..4 {
            local.encrypt(b"x").unwrap();
        }
        assert_eq!(local.counters().write, 4);

        // Peer session in a different reboot epoch.
        let mut peer = fresh(0x33);
        peer.counters.reboot = 9;
        let envelope = peer.encrypt(b"rebooted").unwrap();

        let payload = local.decrypt(&envelope).unwrap();
        assert_eq!(payload, b"rebooted");
        assert_eq!(local.counters().reboot, 9);
        assert_eq!(local.counters().write, 0);
        assert_eq!(local.counters().read, 1);
    }

    #[test]
    fn same_reboot_keeps_write_counter() {
        let mut local = fresh(0x44);
        let mut peer = fresh(0x44);
        local.encrypt(b"a").unwrap();
        local.encrypt(b"b").unwrap();

        let envelope = peer.encrypt(b"reply").unwrap();
        local.decrypt(&envelope).unwrap();
        assert_eq!(local.counters().write, 2);
    }

    #[test]
    fn short_or_tampered_envelopes_fail() {
        let mut cryptor = fresh(0x66);
        assert!(matches!(
            cryptor.decrypt(&[0u8; MIN_ENVELOPE_LEN - 1]),
            Err(CryptoError::DecryptFailed)
        ));

        let mut envelope = cryptor.encrypt(b"payload").unwrap();
        envelope[0] ^= 0x01;
        let mut receiver = fresh(0x66);
        assert!(matches!(
            receiver.decrypt(&envelope),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let mut sender = fresh(0x10);
        let mut receiver = fresh(0x20);
        let envelope = sender.encrypt(b"payload").unwrap();
        assert!(matches!(
            receiver.decrypt(&envelope),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn counters_survive_reload() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let mut first =
            PumpCryptor::install(Arc::clone(&store) as Arc<dyn Store>, [0x77; KEY_LEN]).unwrap();
        let envelope = first.encrypt(b"one").unwrap();
        first.encrypt(b"two").unwrap();

        let mut second = PumpCryptor::from_store(Arc::clone(&store) as Arc<dyn Store>)
            .unwrap()
            .expect("key persisted");
        assert_eq!(second.counters(), first.counters());

        // And the reloaded session still shares the key material.
        let mut peer = fresh(0x77);
        peer.decrypt(&envelope).unwrap();
        let reply = peer.encrypt(b"ack").unwrap();
        assert_eq!(second.decrypt(&reply).unwrap(), b"ack");
    }

    #[test]
    fn from_store_respects_missing_and_expired_keys() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        assert!(PumpCryptor::from_store(Arc::clone(&store) as Arc<dyn Store>)
            .unwrap()
            .is_none());

        PumpCryptor::install(Arc::clone(&store) as Arc<dyn Store>, [0x88; KEY_LEN]).unwrap();
        store.put_u64(keys::SHARED_KEY_EXPIRES_AT, 1).unwrap();
        assert!(PumpCryptor::from_store(Arc::clone(&store) as Arc<dyn Store>)
            .unwrap()
            .is_none());
    }

    #[test]
    fn clear_removes_the_session() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        PumpCryptor::install(Arc::clone(&store) as Arc<dyn Store>, [0x99; KEY_LEN]).unwrap();
        PumpCryptor::clear(store.as_ref()).unwrap();
        assert!(PumpCryptor::from_store(store).unwrap().is_none());
    }
}
