//! Define the contract the engine consumes from the backing UTXO store.

use std::fmt::Debug;
use thiserror::Error;

/// Error type shared by the store implementations in this crate.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The prefix handed to a range query does not cover the requested bits.
    #[error("prefix of {len} bytes cannot cover a {bits}-bit range")]
    PrefixTooShort {
        /// Requested range width in bits.
        bits: u32,
        /// Length of the supplied prefix in bytes.
        len: usize,
    },
}

/// A single-use forward cursor over one prefix range of the store.
pub trait RangeCursor {
    /// Custom error type of the backing store.
    type Error: Debug + Send;

    /// Yields the next element in ascending byte-lexicographic order, or
    /// `None` at the end of the range.
    fn next(&mut self) -> Result<Option<Vec<u8>>, Self::Error>;
}

/// Read-only view of the full UTXO element set, keyed by element bytes.
///
/// The engine rebuilds itself from this view on startup and queries
/// subranges of it when splitting overfull leaves. The store must stay
/// snapshot-consistent while a cursor is outstanding and for the whole of
/// one bulk load or normalization pass.
pub trait UtxoSetReader: Sync {
    /// Custom trait's error type.
    type Error: Debug + Send;

    /// Approximate number of elements in the set. Only used to pre-shape
    /// trees before a bulk load; it does not have to be exact.
    fn size(&self) -> u64;

    /// Opens a cursor over every element whose first `bits` bits equal the
    /// first `bits` bits of `prefix`, in ascending order.
    ///
    /// `bits` is always a multiple of 4 in engine-generated calls, so the
    /// bound may end in the middle of a byte: the low nibble of the last
    /// prefix byte is then the inclusive lower bound and the same nibble
    /// extended to `0xF` the inclusive upper bound.
    fn range<'a>(
        &'a self,
        prefix: &[u8],
        bits: u32,
    ) -> Result<Box<dyn RangeCursor<Error = Self::Error> + 'a>, Self::Error>;
}
