//! Long-term ed25519 signatures.
//!
//! Two objects are signed per round: the ephemeral key bundle a client
//! advertises in phase one, and the exact survivor-set bytes the aggregator
//! distributes in phase four. The survivor-set signature is over the
//! received serialization verbatim, so verification across clients is
//! byte-exact and any split view the aggregator presents is caught.

use crate::error::SecAggError;
use crate::id::ClientId;
use crate::ka::KEY_LEN;
use ed25519_dalek::{Signer, Verifier};

pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};

pub const SIGNATURE_LEN: usize = 64;

const BUNDLE_DOMAIN: &[u8] = b"secagg.key-bundle.v1";
const SURVIVOR_DOMAIN: &[u8] = b"secagg.survivor-set.v1";

fn bundle_message(c_pk: &[u8; KEY_LEN], s_pk: &[u8; KEY_LEN]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(BUNDLE_DOMAIN.len() + 2 * KEY_LEN);
    msg.extend_from_slice(BUNDLE_DOMAIN);
    msg.extend_from_slice(c_pk);
    msg.extend_from_slice(s_pk);
    msg
}

fn survivor_message(payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(SURVIVOR_DOMAIN.len() + payload.len());
    msg.extend_from_slice(SURVIVOR_DOMAIN);
    msg.extend_from_slice(payload);
    msg
}

/// Sign an advertised `(c_pk, s_pk)` ephemeral key bundle.
pub fn sign_key_bundle(key: &SigningKey, c_pk: &[u8; KEY_LEN], s_pk: &[u8; KEY_LEN]) -> Signature {
    key.sign(&bundle_message(c_pk, s_pk))
}

/// Verify a peer's advertised key bundle against its long-term public key.
pub fn verify_key_bundle(
    signer: &ClientId,
    key: &VerifyingKey,
    c_pk: &[u8; KEY_LEN],
    s_pk: &[u8; KEY_LEN],
    sig: &[u8],
) -> Result<(), SecAggError> {
    let sig = parse_signature(signer, sig)?;
    key.verify(&bundle_message(c_pk, s_pk), &sig)
        .map_err(|_| SecAggError::SignatureInvalid(signer.clone()))
}

/// Sign the survivor-set payload exactly as received off the wire.
pub fn sign_survivor_set(key: &SigningKey, payload: &[u8]) -> Signature {
    key.sign(&survivor_message(payload))
}

/// Verify a peer's survivor-set signature against the payload this client
/// received. A mismatch means the peer saw different bytes.
pub fn verify_survivor_set(
    signer: &ClientId,
    key: &VerifyingKey,
    payload: &[u8],
    sig: &[u8],
) -> Result<(), SecAggError> {
    let sig = parse_signature(signer, sig)?;
    key.verify(&survivor_message(payload), &sig)
        .map_err(|_| SecAggError::SignatureInvalid(signer.clone()))
}

fn parse_signature(signer: &ClientId, bytes: &[u8]) -> Result<Signature, SecAggError> {
    Signature::from_slice(bytes).map_err(|_| SecAggError::SignatureInvalid(signer.clone()))
}
