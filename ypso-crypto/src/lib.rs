//! YpsoPump session crypto.
//!
//! The pump speaks XChaCha20-Poly1305 with a trailing nonce and a
//! counter block inside the plaintext. This crate provides the pieces in
//! dependency order: the HChaCha20 kernel, the composed AEAD, the X25519
//! key agreement used during pairing, and the stateful [`PumpCryptor`]
//! that stamps and tracks session counters.

pub mod aead;
pub mod exchange;
pub mod hchacha;
pub mod session;

pub use aead::{decrypt, encrypt, AeadError, NONCE_LEN, TAG_LEN};
pub use exchange::{derive_shared_key, DeviceKeyPair};
pub use hchacha::hchacha20;
pub use session::{CryptoError, PumpCryptor, SessionCounters};

/// Every key in this protocol is 32 bytes.
pub const KEY_LEN: usize = 32;
