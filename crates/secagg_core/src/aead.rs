//! Authenticated encryption for Shamir shares in transit.
//!
//! Shares travel from client `u` to client `v` through the aggregator,
//! encrypted under the shared key of the pair's "c" Diffie-Hellman exchange
//! with ChaCha20-Poly1305. Both endpoints derive the same nonce
//! deterministically from the (sender, recipient, round) triple, so no nonce
//! needs to ride along with the ciphertext. The nonce is never the key
//! itself.

use crate::error::SecAggError;
use crate::id::ClientId;
use crate::ka::SharedKey;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use sha2::{Digest, Sha256};

pub const NONCE_LEN: usize = 12;

const NONCE_DOMAIN: &[u8] = b"secagg.share.nonce.v1";

/// Deterministic per-direction nonce for a share ciphertext.
///
/// Hashes a domain tag, the sender and recipient ids (NUL-separated; ids may
/// not contain NUL), and the round index, then truncates to 96 bits. Both
/// the encrypting sender and the decrypting recipient compute this from the
/// sender's perspective.
pub fn share_nonce(sender: &ClientId, recipient: &ClientId, round: u64) -> [u8; NONCE_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(NONCE_DOMAIN);
    hasher.update(sender.as_bytes());
    hasher.update([0u8]);
    hasher.update(recipient.as_bytes());
    hasher.update([0u8]);
    hasher.update(round.to_be_bytes());

    let digest = hasher.finalize();
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);
    nonce
}

pub fn encrypt(key: &SharedKey, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, SecAggError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| SecAggError::EncryptFailure)
}

pub fn decrypt(key: &SharedKey, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, SecAggError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SecAggError::AeadFailure)
}
