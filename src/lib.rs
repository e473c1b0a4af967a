#![doc = include_str!("../README.md")]

pub mod constant;
pub mod types;
pub use types::{CommitStats, DigestBytes, Node, NodeIndex, NodeKind, NormalizeItem, TrunkStats};
pub mod multiset;
pub use multiset::MultiSet;
pub mod hasher;
pub use hasher::HashWriter;
pub mod traits;
pub use traits::{RangeCursor, StoreError, UtxoSetReader};
pub mod element;
pub use element::{encode_element, Coin, OutPoint};
pub mod trunk;
pub use trunk::TrunkNode;
pub mod commit;
pub use commit::{CommitError, UtxoCommit};
pub mod mem_store;
pub use mem_store::MemUtxoSet;
pub mod empty_set;
pub use empty_set::EmptyUtxoSet;

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_utxo(rng: &mut StdRng) -> Vec<u8> {
        let out = OutPoint {
            txid: rng.gen(),
            vout: rng.gen_range(0..4),
        };
        let coin = Coin {
            height: rng.gen_range(1..800_000),
            is_coinbase: rng.gen_bool(0.02),
            amount: rng.gen_range(1..21_000_000),
            script: vec![0x76, 0xa9, 0x14, rng.gen(), rng.gen(), 0x88, 0xac],
        };
        encode_element(&out, &coin)
    }

    /// End-to-end walk through the engine lifecycle: bulk load from a
    /// store of serialized outputs, apply a block of spends and creations,
    /// renormalize, and confirm a cold-started engine over the updated
    /// store lands on the same commitment.
    #[test]
    fn basic_integration_test() -> Result<(), CommitError<StoreError>> {
        let mut rng = StdRng::seed_from_u64(1);
        let store = MemUtxoSet::new();
        let mut utxos: Vec<Vec<u8>> = Vec::new();
        for _ in 0..2500 {
            let element = random_utxo(&mut rng);
            if store.insert(element.clone()) {
                utxos.push(element);
            }
        }

        let commit = UtxoCommit::new();
        commit.initial_load(&store)?;
        let genesis_digest = commit.get_hash();
        assert_ne!(genesis_digest, constant::empty_commit_digest());
        assert_eq!(commit.stats().elements(), utxos.len() as u64);

        // A block connects: 150 outputs spent, 200 created.
        for spent in utxos.drain(..150) {
            commit.update(&spent, true);
            store.remove(&spent);
        }
        for _ in 0..200 {
            let element = random_utxo(&mut rng);
            if store.insert(element.clone()) {
                commit.update(&element, false);
                utxos.push(element);
            }
        }
        commit.normalize(&store)?;

        let block_digest = commit.get_hash();
        assert_ne!(block_digest, genesis_digest);

        // A cold start over the updated store reproduces the commitment.
        let rebuilt = UtxoCommit::new();
        rebuilt.initial_load(&store)?;
        assert_eq!(rebuilt.get_hash(), block_digest);

        Ok(())
    }
}
