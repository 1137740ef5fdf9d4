//! Protocol logic for dropout-tolerant secure aggregation.
//!
//! A set of mutually distrustful clients each hold a private vector and want
//! an honest-but-curious aggregator to learn only the component-wise sum.
//! Every client adds two kinds of masks to its input before submission:
//! pairwise masks derived from Diffie-Hellman shared secrets (antisymmetric
//! in client-id order, so they cancel across the surviving set) and a private
//! mask seeded from a fresh 32-bit value. Both the "s" DH secret and the
//! 32-bit seed are Shamir-shared across all participants, which lets the
//! aggregator repair the sum when clients drop out mid-round: survivors hand
//! over the *seed* shares of other survivors and the *key* shares of
//! dropouts, never both for the same peer.
//!
//! This crate contains the pure protocol pieces: key agreement ([`ka`]),
//! share encryption ([`aead`]), long-term signatures ([`sign`]), byte-wise
//! Shamir sharing ([`shamir`]), mask expansion and arithmetic ([`masking`]),
//! and the wire codec ([`wire`]). The networked five-phase state machines
//! live in the `secagg_daemon` crate.

pub mod aead;
pub mod error;
pub mod id;
pub mod ka;
pub mod masking;
pub mod shamir;
pub mod sign;
pub mod wire;

pub use error::SecAggError;
pub use id::ClientId;
