//! X25519 key agreement for the pairing exchange.
//!
//! The pump hands out a raw 32-byte Curve25519 public key; the app keeps
//! a long-lived X25519 key pair of its own. The session key is the raw
//! shared secret stretched once through HChaCha20 with an all-zero nonce.

use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use ypso_store::{keys, Store, StoreError};

use crate::hchacha::hchacha20;
use crate::KEY_LEN;

/// The app-side X25519 key pair used towards the pump and the relay.
pub struct DeviceKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl DeviceKeyPair {
    /// Generate a fresh key pair from the OS RNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Load the persisted pair, generating and persisting one on first use.
    pub fn load_or_generate(store: &dyn Store) -> Result<Self, StoreError> {
        if let Some(raw) = store.get_bytes(keys::X25519_PRIV)? {
            let raw = Zeroizing::new(raw);
            let bytes: [u8; KEY_LEN] =
                raw.as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt {
                        key: keys::X25519_PRIV.to_string(),
                        expected: "32 bytes",
                    })?;
            return Ok(Self::from_secret_bytes(bytes));
        }

        let pair = Self::generate();
        store.put_bytes(keys::X25519_PRIV, pair.secret.as_bytes())?;
        store.put_bytes(keys::X25519_PUB, pair.public.as_bytes())?;
        Ok(pair)
    }

    /// Raw 32-byte public key, as sent to the relay.
    pub fn public_bytes(&self) -> [u8; KEY_LEN] {
        *self.public.as_bytes()
    }

    /// Run the agreement against the pump's raw public key and stretch
    /// the result into the 32-byte session key.
    pub fn derive_shared_key(&self, peer_public_raw: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
        derive_shared_key(&self.secret, peer_public_raw)
    }
}

/// `HChaCha20(X25519(private, peer), nonce = 0)`.
pub fn derive_shared_key(private: &StaticSecret, peer_public_raw: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let peer = PublicKey::from(*peer_public_raw);
    let shared = private.diffie_hellman(&peer);
    hchacha20(shared.as_bytes(), &[0u8; 16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ypso_store::MemoryStore;

    #[test]
    fn both_sides_derive_the_same_key() {
        let app = DeviceKeyPair::generate();
        let pump = DeviceKeyPair::generate();

        let from_app = app.derive_shared_key(&pump.public_bytes());
        let from_pump = pump.derive_shared_key(&app.public_bytes());
        assert_eq!(from_app, from_pump);
        assert_ne!(from_app, [0u8; KEY_LEN]);
    }

    #[test]
    fn derived_key_is_stretched_not_raw() {
        let app = DeviceKeyPair::generate();
        let pump = DeviceKeyPair::generate();

        let peer = PublicKey::from(pump.public_bytes());
        let raw = app.secret.diffie_hellman(&peer);
        let derived = app.derive_shared_key(&pump.public_bytes());
        assert_ne!(derived, *raw.as_bytes());
        assert_eq!(derived, hchacha20(raw.as_bytes(), &[0u8; 16]));
    }

    #[test]
    fn load_or_generate_is_stable() {
        let store = MemoryStore::new();
        let first = DeviceKeyPair::load_or_generate(&store).unwrap();
        let second = DeviceKeyPair::load_or_generate(&store).unwrap();
        assert_eq!(first.public_bytes(), second.public_bytes());

        assert_eq!(
            store.get_bytes(keys::X25519_PUB).unwrap(),
            Some(first.public_bytes().to_vec())
        );
    }
}
