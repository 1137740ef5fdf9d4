//! Error type shared across the protocol-logic modules.

use crate::id::ClientId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecAggError {
    /// Authenticated decryption failed (wrong key, wrong nonce, or tampered
    /// ciphertext).
    #[error("authenticated decryption failed")]
    AeadFailure,

    /// Encryption rejected the payload.
    #[error("encryption failed")]
    EncryptFailure,

    /// Secret-sharing parameters or shares were unusable.
    #[error("secret sharing: {0}")]
    Shamir(String),

    /// A signature did not verify against the signer's long-term key.
    #[error("signature from client {0} is invalid")]
    SignatureInvalid(ClientId),

    /// A wire payload could not be decoded, or decoded to an unexpected
    /// message for the endpoint it arrived on.
    #[error("malformed wire payload: {0}")]
    Decode(String),

    /// A vector did not match the round's configured shape.
    #[error("shape mismatch: expected {expected} elements, got {got}")]
    ShapeMismatch { expected: usize, got: usize },
}
