//! This module provides the canonical empty store, useful for constructing
//! engines over no data and for normalizing sets that cannot need splits.

use crate::traits::{RangeCursor, StoreError, UtxoSetReader};

/// A [`UtxoSetReader`] over the empty set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmptyUtxoSet;

impl UtxoSetReader for EmptyUtxoSet {
    type Error = StoreError;

    fn size(&self) -> u64 {
        0
    }

    fn range<'a>(
        &'a self,
        _prefix: &[u8],
        _bits: u32,
    ) -> Result<Box<dyn RangeCursor<Error = Self::Error> + 'a>, Self::Error> {
        Ok(Box::new(EmptyCursor))
    }
}

/// The cursor over nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyCursor;

impl RangeCursor for EmptyCursor {
    type Error = StoreError;

    fn next(&mut self) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(None)
    }
}
