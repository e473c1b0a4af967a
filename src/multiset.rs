//! A commutative, invertible multiset hash over byte strings.
//!
//! Each element is hashed to a point on the Ristretto group; the multiset
//! state is the running sum of those points. Point addition commutes and
//! every point has an inverse, so any permutation of adds and removes lands
//! on the same state, and a remove exactly cancels an add of the same bytes.
//! Signed states are legal: removing an element that was never added yields
//! a well-defined state that a later add brings back to neutral.

use crate::types::DigestBytes;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::traits::Identity;
use sha2::{Digest, Sha256, Sha512};

/// Accumulator state committing to a signed multiset of byte strings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MultiSet {
    point: RistrettoPoint,
}

impl Default for MultiSet {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiSet {
    /// Creates the empty multiset, the identity of [`combine`](Self::combine).
    pub fn new() -> Self {
        Self {
            point: RistrettoPoint::identity(),
        }
    }

    /// Folds one element into the multiset.
    pub fn insert(&mut self, element: &[u8]) {
        self.point += hash_to_point(element);
    }

    /// Removes one element from the multiset; the inverse of
    /// [`insert`](Self::insert) with the same bytes.
    pub fn remove(&mut self, element: &[u8]) {
        self.point -= hash_to_point(element);
    }

    /// Merges another multiset into this one. Commutative and associative.
    pub fn combine(&mut self, other: &Self) {
        self.point += other.point;
    }

    /// Finalizes to a 32-byte digest: SHA-256 of the canonical point
    /// encoding. The empty multiset encodes to 32 zero bytes, so the empty
    /// digest is `SHA-256([0u8; 32])`.
    pub fn digest(&self) -> DigestBytes {
        Sha256::digest(self.point.compress().as_bytes()).into()
    }
}

/// Maps arbitrary bytes to a uniformly distributed group point.
fn hash_to_point(element: &[u8]) -> RistrettoPoint {
    RistrettoPoint::hash_from_bytes::<Sha512>(element)
}
