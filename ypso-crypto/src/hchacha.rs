//! HChaCha20 key-derivation kernel.
//!
//! Runs the 20 ChaCha rounds over `constant ‖ key ‖ nonce16` and returns
//! state words 0..3 and 12..15 without the feed-forward addition. Used
//! twice in this protocol: to derive the XChaCha20 subkey from the first
//! 16 nonce bytes, and to stretch the raw X25519 secret into the session
//! key (with an all-zero nonce).

use crate::KEY_LEN;

const SIGMA: [u32; 4] = [0x6170_7865, 0x3320_646e, 0x7962_2d32, 0x6b20_6574];

#[inline]
fn quarter_round(state: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize) {
    state[a] = state[a].wrapping_add(state[b]);
    state[d] = (state[d] ^ state[a]).rotate_left(16);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_left(12);
    state[a] = state[a].wrapping_add(state[b]);
    state[d] = (state[d] ^ state[a]).rotate_left(8);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_left(7);
}

/// Derive 32 bytes from a 32-byte key and a 16-byte nonce.
pub fn hchacha20(key: &[u8; KEY_LEN], nonce: &[u8; 16]) -> [u8; KEY_LEN] {
    let mut state = [0u32; 16];
    state[..4].copy_from_slice(&SIGMA);
    for (i, word) in key.chunks_exact(4).enumerate() {
        state[4 + i] = u32::from_le_bytes(word.try_into().unwrap());
    }
    for (i, word) in nonce.chunks_exact(4).enumerate() {
        state[12 + i] = u32::from_le_bytes(word.try_into().unwrap());
    }

    for _ in 0..10 {
        quarter_round(&mut state, 0, 4, 8, 12);
        quarter_round(&mut state, 1, 5, 9, 13);
        quarter_round(&mut state, 2, 6, 10, 14);
        quarter_round(&mut state, 3, 7, 11, 15);
        quarter_round(&mut state, 0, 5, 10, 15);
        quarter_round(&mut state, 1, 6, 11, 12);
        quarter_round(&mut state, 2, 7, 8, 13);
        quarter_round(&mut state, 3, 4, 9, 14);
    }

    let mut out = [0u8; KEY_LEN];
    for (i, &word) in state[..4].iter().chain(&state[12..]).enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test vector from draft-irtf-cfrg-xchacha, section 2.2.1.
    #[test]
    fn ietf_vector() {
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let nonce: [u8; 16] = [
            0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x4a, //
            0x00, 0x00, 0x00, 0x00, 0x31, 0x41, 0x59, 0x27,
        ];
        let expected: [u8; 32] = [
            0x82, 0x41, 0x3b, 0x42, 0x27, 0xb2, 0x7b, 0xfe, //
            0xd3, 0x0e, 0x42, 0x50, 0x8a, 0x87, 0x7d, 0x73, //
            0xa0, 0xf9, 0xe4, 0xd5, 0x81, 0x85, 0xd1, 0xdb, //
            0x7a, 0x77, 0xf1, 0x48, 0x6b, 0xd4, 0x7c, 0x16,
        ];
        assert_eq!(hchacha20(&key, &nonce), expected);
    }

    #[test]
    fn output_depends_on_both_inputs() {
        let key = [0x11u8; 32];
        let nonce = [0x22u8; 16];
        let base = hchacha20(&key, &nonce);

        let mut other_key = key;
        other_key[0] ^= 1;
        assert_ne!(hchacha20(&other_key, &nonce), base);

        let mut other_nonce = nonce;
        other_nonce[15] ^= 1;
        assert_ne!(hchacha20(&key, &other_nonce), base);
    }
}
