//! Wire messages exchanged between aggregator and clients.
//!
//! One tagged enum covers every message of the five phases; each endpoint
//! decodes and then matches on the variant it expects, treating anything
//! else as a malformed payload. Encoding is bincode over serde, which is
//! deterministic for these types — ordered maps, fixed-width integers — so
//! the survivor-set bytes a client signs are identical across processes.

use crate::error::SecAggError;
use crate::id::ClientId;
use crate::ka::KEY_LEN;
use crate::shamir::Share;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A client's advertised ephemeral keys and the long-term signature over
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBundle {
    pub c_pk: [u8; KEY_LEN],
    pub s_pk: [u8; KEY_LEN],
    pub sig: Vec<u8>,
}

/// Every message of the five-phase protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Phase 1, client → aggregator.
    Advertise { id: ClientId, bundle: KeyBundle },
    /// Phase 1 barrier, aggregator → clients: the full key directory.
    KeyDirectory(BTreeMap<ClientId, KeyBundle>),
    /// Phase 2, client → aggregator: encrypted shares addressed per peer.
    Shares {
        id: ClientId,
        ciphertexts: BTreeMap<ClientId, Vec<u8>>,
    },
    /// Phase 2 barrier, aggregator → one client: sender → ciphertext.
    Inbox(BTreeMap<ClientId, Vec<u8>>),
    /// Phase 3, client → aggregator.
    MaskedInput { id: ClientId, vector: Vec<f64> },
    /// Phase 4 request, aggregator → clients: the proposed survivor set.
    SurvivorSet(BTreeSet<ClientId>),
    /// Phase 4 reply: signature over the survivor-set bytes as received.
    SurvivorSig { id: ClientId, sig: Vec<u8> },
    /// Phase 4 reply: the client saw an inconsistent survivor signature.
    Dissent { id: ClientId },
    /// Phase 4 barrier, aggregator → clients: every survivor's signature.
    SignatureMap(BTreeMap<ClientId, Vec<u8>>),
    /// Phase 5, client → aggregator: key shares for dropouts, seed shares
    /// for survivors. Never both for the same peer.
    UnmaskShares {
        id: ClientId,
        key_shares: BTreeMap<ClientId, Share>,
        seed_shares: BTreeMap<ClientId, Share>,
    },
}

/// The plaintext a client encrypts for one peer in phase 2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharePayload {
    pub sender: ClientId,
    pub recipient: ClientId,
    /// Share of the sender's "s" DH secret.
    pub key_share: Share,
    /// Share of the sender's private mask seed.
    pub seed_share: Share,
}

pub fn encode(msg: &Message) -> Result<Vec<u8>, SecAggError> {
    bincode::serialize(msg).map_err(|e| SecAggError::Decode(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<Message, SecAggError> {
    bincode::deserialize(bytes).map_err(|e| SecAggError::Decode(e.to_string()))
}

pub fn encode_share_payload(payload: &SharePayload) -> Result<Vec<u8>, SecAggError> {
    bincode::serialize(payload).map_err(|e| SecAggError::Decode(e.to_string()))
}

pub fn decode_share_payload(bytes: &[u8]) -> Result<SharePayload, SecAggError> {
    bincode::deserialize(bytes).map_err(|e| SecAggError::Decode(e.to_string()))
}
