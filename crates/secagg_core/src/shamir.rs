//! Shamir t-of-n secret sharing over GF(2^8).
//!
//! Secrets are arbitrary byte strings; each byte is shared independently
//! with a fresh random polynomial of degree `t - 1`, and share `i` holds the
//! evaluations at `x = i`. Any `t` distinct shares reconstruct the secret by
//! Lagrange interpolation at zero; fewer than `t` shares are statistically
//! independent of the secret.
//!
//! In this protocol the shared secrets are the 32-byte "s" Diffie-Hellman
//! secret and the 4-byte big-endian private mask seed.

use crate::error::SecAggError;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// One participant's share of a byte-string secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    /// Evaluation point, `1..=n`. Never zero (zero holds the secret).
    pub index: u8,
    /// One evaluation byte per secret byte.
    pub data: Vec<u8>,
}

/// Split `secret` into `n` shares, any `threshold` of which reconstruct it.
pub fn share<R: RngCore + CryptoRng>(
    secret: &[u8],
    threshold: usize,
    n: usize,
    rng: &mut R,
) -> Result<Vec<Share>, SecAggError> {
    if n == 0 || n > 255 {
        return Err(SecAggError::Shamir(format!("share count {n} outside 1..=255")));
    }
    if threshold == 0 || threshold > n {
        return Err(SecAggError::Shamir(format!(
            "threshold {threshold} outside 1..={n}"
        )));
    }

    let mut shares: Vec<Share> = (1..=n as u8)
        .map(|index| Share {
            index,
            data: Vec::with_capacity(secret.len()),
        })
        .collect();

    let mut coeffs = vec![0u8; threshold];
    for &byte in secret {
        coeffs[0] = byte;
        rng.fill_bytes(&mut coeffs[1..]);

        for share in shares.iter_mut() {
            share.data.push(eval_poly(&coeffs, share.index));
        }
    }

    Ok(shares)
}

/// Reconstruct a secret from shares by interpolation at zero.
///
/// The caller is responsible for supplying at least the sharing threshold;
/// with fewer shares this interpolates a lower-degree polynomial and returns
/// bytes unrelated to the secret, which is exactly the privacy guarantee.
pub fn reconstruct(shares: &[Share]) -> Result<Vec<u8>, SecAggError> {
    let Some(first) = shares.first() else {
        return Err(SecAggError::Shamir("no shares supplied".into()));
    };

    let len = first.data.len();
    for s in shares {
        if s.index == 0 {
            return Err(SecAggError::Shamir("share index zero".into()));
        }
        if s.data.len() != len {
            return Err(SecAggError::Shamir(format!(
                "share length mismatch: {} vs {}",
                s.data.len(),
                len
            )));
        }
    }
    for (i, a) in shares.iter().enumerate() {
        if shares[i + 1..].iter().any(|b| b.index == a.index) {
            return Err(SecAggError::Shamir(format!("duplicate share index {}", a.index)));
        }
    }

    let mut secret = Vec::with_capacity(len);
    for byte_idx in 0..len {
        let mut acc = 0u8;
        for (i, si) in shares.iter().enumerate() {
            let mut basis = 1u8;
            for (j, sj) in shares.iter().enumerate() {
                if i == j {
                    continue;
                }
                // x_j / (x_j - x_i); subtraction is XOR in GF(2^8)
                basis = gf_mul(basis, gf_mul(sj.index, gf_inv(sj.index ^ si.index)));
            }
            acc ^= gf_mul(si.data[byte_idx], basis);
        }
        secret.push(acc);
    }

    Ok(secret)
}

/// Horner evaluation of `coeffs[0] + coeffs[1]·x + …` at `x`.
fn eval_poly(coeffs: &[u8], x: u8) -> u8 {
    let mut acc = 0u8;
    for &c in coeffs.iter().rev() {
        acc = gf_mul(acc, x) ^ c;
    }
    acc
}

/// Carry-less multiplication modulo the AES polynomial `x^8 + x^4 + x^3 + x + 1`.
fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        let carry = a & 0x80;
        a <<= 1;
        if carry != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    product
}

/// Multiplicative inverse via Fermat: `a^254` in GF(2^8). `gf_inv(0) == 0`.
fn gf_inv(a: u8) -> u8 {
    let mut result = 1u8;
    let mut base = a;
    let mut exp = 254u8;
    while exp != 0 {
        if exp & 1 != 0 {
            result = gf_mul(result, base);
        }
        base = gf_mul(base, base);
        exp >>= 1;
    }
    result
}
