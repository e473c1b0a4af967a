//! This module implements [`UtxoCommit`], the engine combining the sixteen
//! trunks into one order-independent commitment.

use crate::constant::{BRANCH_BITS, BRANCH_COUNT, MIN_ELEMENT_SIZE};
use crate::hasher::HashWriter;
use crate::traits::UtxoSetReader;
use crate::trunk::TrunkNode;
use crate::types::{CommitStats, DigestBytes};
use rayon::prelude::*;
use std::fmt::Debug;
use thiserror::Error;
use tracing::{debug, info};

/// Error type for engine operations that consult the backing store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommitError<E: Debug + Send> {
    /// A read against the backing store failed. The affected trunks stay
    /// consistent but may be left denormalized; retry once the store
    /// recovers.
    #[error("utxo set read failed: {0:?}")]
    Store(E),
}

/// Maintains a 32-byte commitment to an evolving UTXO set.
///
/// Elements are dispatched to one of sixteen [`TrunkNode`]s by their leading
/// 4 bits; each trunk serializes its own mutation behind its own guard, so
/// updates touching different trunks proceed in parallel and the engine
/// itself holds no lock.
///
/// The digest depends only on the signed multiset of elements applied (and
/// the tree shape normalization settles on), never on operation order.
#[derive(Debug, Default)]
pub struct UtxoCommit {
    trunks: [TrunkNode; BRANCH_COUNT],
}

impl UtxoCommit {
    /// Creates an engine over the empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (`remove == false`) or removes one element.
    ///
    /// Thread safe: callers may update concurrently, and elements with
    /// different leading nibbles never contend.
    pub fn update(&self, element: &[u8], remove: bool) {
        assert!(
            element.len() >= MIN_ELEMENT_SIZE,
            "element of {} bytes is below the {MIN_ELEMENT_SIZE}-byte minimum",
            element.len()
        );
        self.trunks[(element[0] >> 4) as usize].update(element, remove);
    }

    /// Restores the leaf- and branch-size invariants on every trunk,
    /// querying `set` for the contents of leaves that must split.
    ///
    /// Trunks are processed in parallel; the result does not depend on the
    /// order. The restrictions of [`TrunkNode::normalize`] apply: `set` must
    /// be consistent with the absorbed updates, and engines holding a
    /// negative delta must not be normalized.
    pub fn normalize<S: UtxoSetReader>(&self, set: &S) -> Result<(), CommitError<S::Error>> {
        self.trunks
            .par_iter()
            .try_for_each(|trunk| trunk.normalize(set))
            .map_err(CommitError::Store)
    }

    /// Rebuilds the engine from `set`, one worker per trunk.
    ///
    /// Each worker pre-shapes its trunk from the store's size estimate,
    /// streams the trunk's 4-bit prefix range through
    /// [`update`](Self::update), and normalizes before joining. Not safe
    /// against concurrent updates on the same engine.
    pub fn initial_load<S: UtxoSetReader>(&self, set: &S) -> Result<(), CommitError<S::Error>> {
        let total = set.size();
        info!(elements = total, "starting initial utxo load");

        self.trunks
            .par_iter()
            .enumerate()
            .try_for_each(|(trunk_index, trunk)| {
                trunk.set_capacity(total / BRANCH_COUNT as u64, 0);

                let prefix = [(trunk_index as u8) << 4];
                let mut cursor = set.range(&prefix, BRANCH_BITS).map_err(CommitError::Store)?;
                let mut loaded = 0u64;
                while let Some(element) = cursor.next().map_err(CommitError::Store)? {
                    trunk.update(&element, false);
                    loaded += 1;
                }
                debug!(trunk = trunk_index, elements = loaded, "trunk loaded");

                trunk.normalize(set).map_err(CommitError::Store)
            })?;

        info!("initial utxo load done");
        Ok(())
    }

    /// Returns the commitment: the stream digest of the sixteen trunk root
    /// hashes in trunk order.
    ///
    /// Meaningful only on a quiescent engine; interleaving this with updates
    /// hashes a state no sequential history produced.
    pub fn get_hash(&self) -> DigestBytes {
        let roots: Vec<DigestBytes> = self.trunks.par_iter().map(TrunkNode::root_hash).collect();

        let mut writer = HashWriter::new();
        for root in &roots {
            writer.write(root);
        }
        writer.finalize()
    }

    /// Arena and queue statistics for every trunk.
    pub fn stats(&self) -> CommitStats {
        CommitStats {
            trunks: self.trunks.iter().map(TrunkNode::stats).collect(),
        }
    }
}
