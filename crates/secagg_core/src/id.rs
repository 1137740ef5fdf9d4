//! Client identity and the canonical ordering used for mask signs.
//!
//! Pairwise masks are antisymmetric: for a pair `(u, v)` one side adds the
//! mask and the other subtracts it, decided purely by which id is greater.
//! All parties (and the aggregator's reconstruction) must agree on the order
//! without coordination, so the order is fixed as byte-lexicographic
//! comparison of the id strings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stable, non-empty client identifier.
///
/// Ids are unique within a round and totally ordered (byte-lexicographic).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Sign applied by `a` to the pairwise mask shared with `b`.
///
/// `+1.0` when `a > b`, `-1.0` otherwise. Summed over both directions the
/// contributions cancel exactly.
pub fn mask_sign(a: &ClientId, b: &ClientId) -> f64 {
    if a > b {
        1.0
    } else {
        -1.0
    }
}
