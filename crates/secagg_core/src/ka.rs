//! Diffie-Hellman key agreement over x25519.
//!
//! Each client generates two fresh key pairs per round: the "c" pair, whose
//! shared secrets encrypt Shamir shares in transit, and the "s" pair, whose
//! shared secrets seed the pairwise masks. Raw x25519 outputs are hashed
//! with SHA-256 before use so both sides hold a uniform 32-byte symmetric
//! key.

use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length in bytes of public keys, secret keys, and derived shared keys.
pub const KEY_LEN: usize = 32;

/// A hashed Diffie-Hellman shared secret, ready for use as a symmetric key
/// or as a pairwise mask seed source.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; KEY_LEN]);

impl SharedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// A per-round Diffie-Hellman key pair.
///
/// The secret half round-trips through [`DhKeyPair::secret_bytes`] so it can
/// be Shamir-shared; agreeing with a reconstructed secret yields the same
/// shared key as agreeing with the original.
pub struct DhKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl DhKeyPair {
    /// Generate a fresh key pair from a cryptographic RNG.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a key pair from a stored or reconstructed secret.
    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; KEY_LEN] {
        self.public.to_bytes()
    }

    /// The raw secret scalar, for Shamir sharing. Handle with care.
    pub fn secret_bytes(&self) -> [u8; KEY_LEN] {
        self.secret.to_bytes()
    }

    /// Agree with a peer's public key and hash the result to a shared key.
    pub fn agree(&self, peer_public: &[u8; KEY_LEN]) -> SharedKey {
        let peer = PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);
        SharedKey(Sha256::digest(shared.as_bytes()).into())
    }
}

/// Agreement from raw secret bytes, used by the aggregator on secrets it has
/// reconstructed from shares.
pub fn agree_raw(secret: [u8; KEY_LEN], peer_public: [u8; KEY_LEN]) -> SharedKey {
    DhKeyPair::from_secret_bytes(secret).agree(&peer_public)
}
