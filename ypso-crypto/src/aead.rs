//! XChaCha20-Poly1305 composed from HChaCha20 and ChaCha20-Poly1305.
//!
//! The subkey comes from HChaCha20 over the first 16 nonce bytes; the
//! remaining 8 nonce bytes form the tail of a 12-byte IETF nonce whose
//! first 4 bytes are zero. The pump always uses an empty AAD, but the
//! interface accepts one.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use thiserror::Error;

use crate::hchacha::hchacha20;
use crate::KEY_LEN;

/// XChaCha20 nonce length.
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Authentication failed or the input could not be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("aead authentication failed")]
pub struct AeadError;

fn subcipher(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> (ChaCha20Poly1305, Nonce) {
    let subkey = hchacha20(key, nonce[..16].try_into().unwrap());
    let mut subnonce = [0u8; 12];
    subnonce[4..].copy_from_slice(&nonce[16..]);
    (
        ChaCha20Poly1305::new(Key::from_slice(&subkey)),
        Nonce::from(subnonce),
    )
}

/// Encrypt; returns `ciphertext ‖ tag(16)`.
pub fn encrypt(
    plaintext: &[u8],
    aad: &[u8],
    nonce: &[u8; NONCE_LEN],
    key: &[u8; KEY_LEN],
) -> Result<Vec<u8>, AeadError> {
    let (cipher, subnonce) = subcipher(key, nonce);
    cipher
        .encrypt(&subnonce, Payload { msg: plaintext, aad })
        .map_err(|_| AeadError)
}

/// Open `ciphertext ‖ tag(16)`; fails on any bit of tampering.
pub fn decrypt(
    ciphertext_and_tag: &[u8],
    aad: &[u8],
    nonce: &[u8; NONCE_LEN],
    key: &[u8; KEY_LEN],
) -> Result<Vec<u8>, AeadError> {
    let (cipher, subnonce) = subcipher(key, nonce);
    cipher
        .decrypt(&subnonce, Payload { msg: ciphertext_and_tag, aad })
        .map_err(|_| AeadError)
}
