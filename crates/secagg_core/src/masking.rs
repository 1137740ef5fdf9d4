//! Mask expansion and masked-input arithmetic.
//!
//! A masked input is `y = x + p_u + Σ_v sign(u, v) · p_{u,v}` where `p_u`
//! expands from the client's private 32-bit seed and each `p_{u,v}` expands
//! from a 32-bit seed drawn from the pair's "s" shared key. Expansion is
//! ChaCha20-based and fully determined by the seed and the target shape, so
//! the aggregator can re-derive any mask it recovers seeds for.
//!
//! Note: expansion re-seeds the generator for every shape slice, so all
//! slices of one vector draw from the same 32-bit seed stream. This mirrors
//! the deployed construction and is kept for reproducibility; it weakens the
//! expansion across slices and is called out in DESIGN.md.

use crate::error::SecAggError;
use crate::id::{mask_sign, ClientId};
use crate::ka::SharedKey;
use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Slice lengths of the flattened tensor list; vectors are the
/// concatenation of all slices.
pub type Shape = [usize];

/// Total element count of a shape.
pub fn shape_len(shape: &Shape) -> usize {
    shape.iter().sum()
}

/// Deterministically expand a 32-bit seed into a vector of the given shape
/// with values uniform in `[0, 1)`.
pub fn expand(seed: u32, shape: &Shape) -> Vec<f64> {
    let mut out = Vec::with_capacity(shape_len(shape));
    for &len in shape {
        let mut rng = ChaCha20Rng::seed_from_u64(u64::from(seed));
        for _ in 0..len {
            out.push(f64::from(rng.next_u32()) / 4_294_967_296.0);
        }
    }
    out
}

/// Draw the pairwise 32-bit mask seed from a shared key.
///
/// Both endpoints of the pair hold the same shared key and therefore derive
/// the same seed, as does the aggregator after reconstructing a dropout's
/// secret.
pub fn pairwise_seed(shared: &SharedKey) -> u32 {
    let mut rng = ChaCha20Rng::from_seed(*shared.as_bytes());
    rng.next_u32()
}

/// `acc += sign · v`, component-wise.
pub fn add_scaled(acc: &mut [f64], v: &[f64], sign: f64) {
    debug_assert_eq!(acc.len(), v.len());
    for (a, x) in acc.iter_mut().zip(v) {
        *a += sign * x;
    }
}

/// Mask an input vector with the client's private mask and its pairwise
/// masks. `pairwise` carries one `(peer id, pairwise seed)` entry per live
/// peer; the sign comes from the id order.
pub fn mask_input(
    own_id: &ClientId,
    x: &[f64],
    shape: &Shape,
    private_seed: u32,
    pairwise: &[(ClientId, u32)],
) -> Result<Vec<f64>, SecAggError> {
    let expected = shape_len(shape);
    if x.len() != expected {
        return Err(SecAggError::ShapeMismatch { expected, got: x.len() });
    }

    let mut y = x.to_vec();
    add_scaled(&mut y, &expand(private_seed, shape), 1.0);
    for (peer, seed) in pairwise {
        add_scaled(&mut y, &expand(*seed, shape), mask_sign(own_id, peer));
    }
    Ok(y)
}

/// Encode a private seed for Shamir sharing.
pub fn seed_to_bytes(seed: u32) -> [u8; 4] {
    seed.to_be_bytes()
}

/// Decode a reconstructed private seed.
pub fn seed_from_bytes(bytes: &[u8]) -> Result<u32, SecAggError> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| SecAggError::Shamir(format!("seed must be 4 bytes, got {}", bytes.len())))?;
    Ok(u32::from_be_bytes(arr))
}
