//! One trunk: the subtree owning a sixteenth of the key space.
//!
//! A trunk owns every node below one top-level nibble, stored as three
//! append-only arenas of pointer-free records, and a single guard
//! serializing all mutation. Sixteen trunks side by side give the engine
//! its parallelism: updates whose elements differ in the leading nibble
//! never contend.

use crate::constant::{
    branch_at, set_branch, BRANCH_BITS, BRANCH_COUNT, MAX_LEAF_SIZE, MIN_ELEMENT_SIZE,
};
use crate::hasher::HashWriter;
use crate::multiset::MultiSet;
use crate::traits::UtxoSetReader;
use crate::types::{DigestBytes, Node, NodeIndex, NodeKind, NormalizeItem, TrunkStats};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Arena storage of one trunk. Node 0 is the trunk root; nodes are appended
/// and never freed, so a reshape may orphan records in place.
#[derive(Debug)]
struct TrunkState {
    /// Every node of the tree, branch and leaf alike.
    nodes: Vec<Node>,
    /// Child tables of branch nodes, addressed by `NodeKind::Branch`.
    branches: Vec<[NodeIndex; BRANCH_COUNT]>,
    /// Accumulator states of leaf nodes, addressed by `NodeKind::Leaf`.
    multisets: Vec<MultiSet>,
    /// Nodes whose size invariant was observed violated, in FIFO order.
    queue: VecDeque<NormalizeItem>,
}

/// One sixteenth of the commitment tree, independently locked.
#[derive(Debug)]
pub struct TrunkNode {
    state: Mutex<TrunkState>,
}

impl Default for TrunkNode {
    fn default() -> Self {
        Self::new()
    }
}

impl TrunkNode {
    /// Creates a trunk holding nothing: a single empty leaf at the root.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrunkState {
                nodes: vec![Node::leaf(0, 0)],
                branches: Vec::new(),
                multisets: vec![MultiSet::new()],
                queue: VecDeque::new(),
            }),
        }
    }

    /// Adds or removes one element, assumed to belong to this trunk.
    ///
    /// Walks the tree along the element's nibbles, adjusting counts on the
    /// path, and folds the element into exactly one leaf's multiset. Nodes
    /// observed violating their size bound are queued for
    /// [`normalize`](Self::normalize); the tree shape itself is never
    /// changed here.
    pub fn update(&self, element: &[u8], remove: bool) {
        assert!(
            element.len() >= MIN_ELEMENT_SIZE,
            "element of {} bytes is below the {MIN_ELEMENT_SIZE}-byte minimum",
            element.len()
        );
        let mut state = self.state.lock().expect("trunk lock poisoned");

        let delta: i64 = if remove { -1 } else { 1 };
        let mut node_index: NodeIndex = 0;
        let mut depth: u32 = 1;
        loop {
            let idx = node_index as usize;
            let node = {
                let node = &mut state.nodes[idx];
                node.count = node.count.wrapping_add_signed(delta);
                *node
            };
            match node.kind {
                NodeKind::Leaf { multiset } => {
                    if node.count > MAX_LEAF_SIZE {
                        state.queue.push_back(NormalizeItem::new(
                            node_index,
                            depth * BRANCH_BITS,
                            element.to_vec(),
                        ));
                    }
                    let multiset = &mut state.multisets[multiset as usize];
                    if remove {
                        multiset.remove(element);
                    } else {
                        multiset.insert(element);
                    }
                    return;
                }
                NodeKind::Branch { branch } => {
                    // The trunk root is the only branch allowed to stay at or
                    // below the leaf bound.
                    if node.count <= MAX_LEAF_SIZE && node_index != 0 {
                        state.queue.push_back(NormalizeItem::new(
                            node_index,
                            depth * BRANCH_BITS,
                            element.to_vec(),
                        ));
                    }
                    node_index = state.branches[branch as usize][branch_at(depth, element)];
                    depth += 1;
                }
            }
        }
    }

    /// Restores the size invariants: splits every leaf that grew past
    /// [`MAX_LEAF_SIZE`] and collapses every non-root branch that shrank to
    /// it or below, draining the queue in FIFO order. Splitting re-reads the
    /// affected subrange from `set`, which must be consistent with the
    /// updates this trunk has absorbed.
    ///
    /// Must not be called while the trunk holds a negative delta (more
    /// removes than adds under any node): subrange sizes are then
    /// meaningless, and a split will abort on the count check.
    ///
    /// A store error leaves the trunk untouched, with the failed entry
    /// requeued; the call can be retried once the store recovers.
    pub fn normalize<S>(&self, set: &S) -> Result<(), S::Error>
    where
        S: UtxoSetReader + ?Sized,
    {
        let mut state = self.state.lock().expect("trunk lock poisoned");

        while let Some(item) = state.queue.pop_front() {
            let node = state.nodes[item.node as usize];
            match node.kind {
                NodeKind::Branch { .. } if node.count <= MAX_LEAF_SIZE => {
                    Self::collapse(&mut state, item.node);
                }
                NodeKind::Leaf { .. } if node.count > MAX_LEAF_SIZE => {
                    if let Err(err) = Self::split(&mut state, &item, set) {
                        state.queue.push_front(item);
                        return Err(err);
                    }
                }
                // The violation healed before we got here; drop the entry.
                _ => {}
            }
        }
        Ok(())
    }

    /// Shrinks the branch at `node_index` back into a single leaf by
    /// combining every descendant leaf's multiset into a fresh one. The
    /// subtree's nodes stay behind in the arenas, orphaned.
    fn collapse(state: &mut TrunkState, node_index: NodeIndex) {
        let mut combined = MultiSet::new();
        Self::sum_leaves(state, node_index, &mut combined);

        let slot = state.multisets.len() as u32;
        state.multisets.push(combined);
        let node = &mut state.nodes[node_index as usize];
        node.kind = NodeKind::Leaf { multiset: slot };
    }

    /// Splits the overfull leaf described by `item` into sixteen children,
    /// redistributing its elements by the nibble below `item.bits`.
    ///
    /// The subrange cursor is drained into staged counts and multisets
    /// before any arena is touched, so a store failure leaves the trunk
    /// exactly as it was. The streamed element count must match the node's
    /// running count; a mismatch means the store has diverged from the
    /// updates this tree absorbed, and no meaningful digest exists.
    fn split<S>(state: &mut TrunkState, item: &NormalizeItem, set: &S) -> Result<(), S::Error>
    where
        S: UtxoSetReader + ?Sized,
    {
        let depth = item.bits / BRANCH_BITS;
        let mut counts = [0u64; BRANCH_COUNT];
        let mut staged: [MultiSet; BRANCH_COUNT] = Default::default();

        let mut streamed = 0u64;
        let mut cursor = set.range(&item.prefix, item.bits)?;
        while let Some(element) = cursor.next()? {
            let branch = branch_at(depth, &element);
            counts[branch] += 1;
            staged[branch].insert(&element);
            streamed += 1;
        }
        assert_eq!(
            state.nodes[item.node as usize].count, streamed,
            "utxo set diverged from commitment tree: {} elements counted under \
             the split prefix, cursor produced {streamed}",
            state.nodes[item.node as usize].count,
        );

        let first_child = Self::split_node(state, item.node);
        for (n, multiset) in staged.into_iter().enumerate() {
            let child = first_child as usize + n;
            state.nodes[child].count = counts[n];
            let NodeKind::Leaf { multiset: slot } = state.nodes[child].kind else {
                unreachable!("split_node creates leaf children");
            };
            state.multisets[slot as usize] = multiset;
        }

        // The children may themselves be overfull; queue them with their own
        // prefix, derived by overwriting this depth's nibble.
        let mut prefix = item.prefix.clone();
        for n in 0..BRANCH_COUNT {
            set_branch(&mut prefix, depth, n as u8);
            state.queue.push_back(NormalizeItem::new(
                first_child + n as NodeIndex,
                item.bits + BRANCH_BITS,
                prefix.clone(),
            ));
        }
        Ok(())
    }

    /// Converts the leaf at `node_index` into a branch over sixteen fresh
    /// empty leaves, returning the index of the first child. The first
    /// child takes over the leaf's multiset slot; the count is preserved on
    /// the new branch.
    fn split_node(state: &mut TrunkState, node_index: NodeIndex) -> NodeIndex {
        let idx = node_index as usize;
        let NodeKind::Leaf { multiset } = state.nodes[idx].kind else {
            unreachable!("only leaves are split");
        };

        let first_child = state.nodes.len() as NodeIndex;
        state.nodes.push(Node::leaf(0, multiset));
        for _ in 1..BRANCH_COUNT {
            let slot = state.multisets.len() as u32;
            state.multisets.push(MultiSet::new());
            state.nodes.push(Node::leaf(0, slot));
        }

        let branch = state.branches.len() as u32;
        state
            .branches
            .push(std::array::from_fn(|n| first_child + n as NodeIndex));
        state.nodes[idx].kind = NodeKind::Branch { branch };
        first_child
    }

    /// Combines every leaf multiset below `node_index` into `acc`.
    fn sum_leaves(state: &TrunkState, node_index: NodeIndex, acc: &mut MultiSet) {
        match state.nodes[node_index as usize].kind {
            NodeKind::Branch { branch } => {
                for child in state.branches[branch as usize] {
                    Self::sum_leaves(state, child, acc);
                }
            }
            NodeKind::Leaf { multiset } => acc.combine(&state.multisets[multiset as usize]),
        }
    }

    /// Pre-splits empty leaves so that an expected bulk load of `est_count`
    /// elements triggers few dynamic splits. Shrinking is cheaper than
    /// growing, so a node is split while its estimated share still carries a
    /// 50% margin over the leaf bound.
    pub fn set_capacity(&self, est_count: u64, node_index: NodeIndex) {
        let mut state = self.state.lock().expect("trunk lock poisoned");
        Self::reserve(&mut state, est_count, node_index);
    }

    fn reserve(state: &mut TrunkState, est_count: u64, node_index: NodeIndex) {
        let node = state.nodes[node_index as usize];
        assert!(
            !node.is_branch() && node.count == 0,
            "capacity pre-shaping expects an empty leaf"
        );

        if est_count + est_count / 2 < MAX_LEAF_SIZE {
            return;
        }

        let first_child = Self::split_node(state, node_index);
        for n in 0..BRANCH_COUNT as NodeIndex {
            Self::reserve(state, est_count / BRANCH_COUNT as u64, first_child + n);
        }
    }

    /// The 32-byte contribution of this trunk to the engine digest: the
    /// multiset digest if the root is a leaf, otherwise the recursive
    /// branch digest over its children.
    pub fn root_hash(&self) -> DigestBytes {
        let state = self.state.lock().expect("trunk lock poisoned");
        Self::node_hash(&state, 0)
    }

    /// Hashes one node: a leaf finalizes its multiset; a branch hashes the
    /// concatenation of its sixteen children's 32-byte digests, in nibble
    /// order.
    fn node_hash(state: &TrunkState, node_index: NodeIndex) -> DigestBytes {
        match state.nodes[node_index as usize].kind {
            NodeKind::Leaf { multiset } => state.multisets[multiset as usize].digest(),
            NodeKind::Branch { branch } => {
                let mut writer = HashWriter::new();
                for child in state.branches[branch as usize] {
                    writer.write(&Self::node_hash(state, child));
                }
                writer.finalize()
            }
        }
    }

    /// Current arena and queue sizes.
    pub fn stats(&self) -> TrunkStats {
        let state = self.state.lock().expect("trunk lock poisoned");
        TrunkStats {
            nodes: state.nodes.len(),
            branches: state.branches.len(),
            multisets: state.multisets.len(),
            queued: state.queue.len(),
            elements: state.nodes[0].count,
        }
    }
}

#[cfg(test)]
impl TrunkNode {
    /// Returns the node reached by descending `path` nibbles from the root.
    pub(crate) fn probe(&self, path: &[usize]) -> Node {
        let state = self.state.lock().unwrap();
        let mut idx: NodeIndex = 0;
        for &nibble in path {
            let NodeKind::Branch { branch } = state.nodes[idx as usize].kind else {
                panic!("probe path descends through a leaf");
            };
            idx = state.branches[branch as usize][nibble];
        }
        state.nodes[idx as usize]
    }

    /// Panics unless the steady-state size and count invariants hold.
    pub(crate) fn assert_normalized(&self) {
        let state = self.state.lock().unwrap();
        assert!(state.queue.is_empty(), "normalization queue not drained");
        Self::check_subtree(&state, 0, true);
    }

    fn check_subtree(state: &TrunkState, node_index: NodeIndex, is_root: bool) -> u64 {
        let node = state.nodes[node_index as usize];
        match node.kind {
            NodeKind::Leaf { .. } => {
                assert!(
                    node.count <= MAX_LEAF_SIZE,
                    "leaf holds {} elements",
                    node.count
                );
            }
            NodeKind::Branch { branch } => {
                assert!(
                    is_root || node.count > MAX_LEAF_SIZE,
                    "non-root branch holds only {} elements",
                    node.count
                );
                let sum: u64 = state.branches[branch as usize]
                    .iter()
                    .map(|&child| Self::check_subtree(state, child, false))
                    .sum();
                assert_eq!(sum, node.count, "branch count out of sync with children");
            }
        }
        node.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::empty_leaf_digest;
    use crate::mem_store::MemUtxoSet;
    use crate::traits::RangeCursor;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Random elements sharing the two leading nibbles of `first_byte`.
    fn prefixed_elements(first_byte: u8, count: usize, rng: &mut StdRng) -> Vec<Vec<u8>> {
        (0..count)
            .map(|_| {
                let mut element = rng.gen::<[u8; 32]>().to_vec();
                element[0] = first_byte;
                element
            })
            .collect()
    }

    fn filled_store(elements: &[Vec<u8>]) -> MemUtxoSet {
        elements.iter().cloned().collect()
    }

    #[test]
    fn test_new_trunk_hashes_to_empty_leaf() {
        let trunk = TrunkNode::new();
        assert_eq!(trunk.root_hash(), empty_leaf_digest());
        assert_eq!(trunk.stats().elements, 0);
    }

    #[test]
    fn test_update_below_leaf_bound_keeps_single_leaf() {
        let mut rng = StdRng::seed_from_u64(7);
        let trunk = TrunkNode::new();
        let elements = prefixed_elements(0x3d, MAX_LEAF_SIZE as usize, &mut rng);
        for e in &elements {
            trunk.update(e, false);
        }

        let stats = trunk.stats();
        assert_eq!(stats.elements, MAX_LEAF_SIZE);
        assert_eq!(stats.nodes, 1);
        assert_eq!(stats.queued, 0);

        let mut expected = MultiSet::new();
        for e in &elements {
            expected.insert(e);
        }
        assert_eq!(trunk.root_hash(), expected.digest());
    }

    #[test]
    fn test_overflow_enqueues_but_does_not_reshape() {
        let mut rng = StdRng::seed_from_u64(8);
        let trunk = TrunkNode::new();
        for e in prefixed_elements(0x3d, MAX_LEAF_SIZE as usize + 1, &mut rng) {
            trunk.update(&e, false);
        }
        let stats = trunk.stats();
        assert_eq!(stats.nodes, 1, "update must not reshape the tree");
        assert_eq!(stats.queued, 1);
    }

    #[test]
    fn test_healed_overflow_is_dropped_from_queue() {
        let mut rng = StdRng::seed_from_u64(9);
        let trunk = TrunkNode::new();
        let elements = prefixed_elements(0x3d, MAX_LEAF_SIZE as usize + 1, &mut rng);
        for e in &elements {
            trunk.update(e, false);
        }
        // Back at the bound before normalization runs: nothing to do.
        trunk.update(&elements[0], true);

        let before = trunk.root_hash();
        trunk
            .normalize(&filled_store(&elements[1..]))
            .unwrap();
        assert_eq!(trunk.stats().nodes, 1);
        assert_eq!(trunk.root_hash(), before);
        trunk.assert_normalized();
    }

    #[test]
    fn test_split_shapes_tree_and_preserves_counts() {
        let mut rng = StdRng::seed_from_u64(10);
        let trunk = TrunkNode::new();
        let elements = prefixed_elements(0x3d, MAX_LEAF_SIZE as usize + 1, &mut rng);
        for e in &elements {
            trunk.update(e, false);
        }
        trunk.normalize(&filled_store(&elements)).unwrap();
        trunk.assert_normalized();

        // All elements share nibble 1 = 0xd, so the root split funnels them
        // into one child, which splits again into sixteen leaves.
        let root = trunk.probe(&[]);
        assert!(root.is_branch());
        assert_eq!(root.count, MAX_LEAF_SIZE + 1);

        let funnel = trunk.probe(&[0xd]);
        assert!(funnel.is_branch());
        assert_eq!(funnel.count, MAX_LEAF_SIZE + 1);

        let mut child_sum = 0;
        for n in 0..BRANCH_COUNT {
            let child = trunk.probe(&[0xd, n]);
            assert!(!child.is_branch());
            child_sum += child.count;
        }
        assert_eq!(child_sum, MAX_LEAF_SIZE + 1);

        for n in 0..BRANCH_COUNT {
            if n != 0xd {
                assert_eq!(trunk.probe(&[n]).count, 0);
            }
        }
    }

    #[test]
    fn test_set_capacity_matches_dynamic_splitting() {
        let mut rng = StdRng::seed_from_u64(11);
        let elements = prefixed_elements(0x3d, MAX_LEAF_SIZE as usize + 1, &mut rng);
        let store = filled_store(&elements);

        let dynamic = TrunkNode::new();
        for e in &elements {
            dynamic.update(e, false);
        }
        dynamic.normalize(&store).unwrap();

        let preshaped = TrunkNode::new();
        preshaped.set_capacity(elements.len() as u64, 0);
        assert!(preshaped.probe(&[]).is_branch(), "estimate should pre-split");
        for e in &elements {
            preshaped.update(e, false);
        }
        preshaped.normalize(&store).unwrap();

        preshaped.assert_normalized();
        assert_eq!(dynamic.root_hash(), preshaped.root_hash());
    }

    #[test]
    fn test_small_estimate_skips_pre_shaping() {
        let trunk = TrunkNode::new();
        trunk.set_capacity(MAX_LEAF_SIZE * 2 / 3 - 1, 0);
        assert_eq!(trunk.stats().nodes, 1);
    }

    #[test]
    fn test_collapse_after_removals() {
        let mut rng = StdRng::seed_from_u64(12);
        let trunk = TrunkNode::new();
        let elements = prefixed_elements(0x3d, 2100, &mut rng);
        for e in &elements {
            trunk.update(e, false);
        }
        trunk.normalize(&filled_store(&elements)).unwrap();
        assert!(trunk.probe(&[0xd]).is_branch());

        // Dropping below the bound queues the branch for collapse. The store
        // is only consulted for splits, so it may already reflect the spend.
        let (spent, remaining) = elements.split_at(200);
        for e in spent {
            trunk.update(e, true);
        }
        trunk.normalize(&filled_store(remaining)).unwrap();
        trunk.assert_normalized();

        let funnel = trunk.probe(&[0xd]);
        assert!(!funnel.is_branch(), "shrunk branch should collapse to a leaf");
        assert_eq!(funnel.count, 1900);

        // The collapsed leaf must commit to exactly the remaining elements.
        let mut expected = MultiSet::new();
        for e in remaining {
            expected.insert(e);
        }
        let mut writer = HashWriter::new();
        for n in 0..BRANCH_COUNT {
            if n == 0xd {
                writer.write(&expected.digest());
            } else {
                writer.write(&empty_leaf_digest());
            }
        }
        assert_eq!(trunk.root_hash(), writer.finalize());
    }

    /// Store whose cursors fail after yielding a few elements.
    #[derive(Debug)]
    struct FlakyUtxoSet;

    struct FlakyCursor {
        left: u32,
    }

    impl RangeCursor for FlakyCursor {
        type Error = &'static str;

        fn next(&mut self) -> Result<Option<Vec<u8>>, Self::Error> {
            if self.left == 0 {
                return Err("backing store read failed");
            }
            self.left -= 1;
            Ok(Some(vec![0x3d, self.left as u8, 0, 0]))
        }
    }

    impl UtxoSetReader for FlakyUtxoSet {
        type Error = &'static str;

        fn size(&self) -> u64 {
            0
        }

        fn range<'a>(
            &'a self,
            _prefix: &[u8],
            _bits: u32,
        ) -> Result<Box<dyn RangeCursor<Error = Self::Error> + 'a>, Self::Error> {
            Ok(Box::new(FlakyCursor { left: 3 }))
        }
    }

    #[test]
    fn test_failed_split_restores_state_and_can_retry() {
        let mut rng = StdRng::seed_from_u64(13);
        let trunk = TrunkNode::new();
        let elements = prefixed_elements(0x3d, MAX_LEAF_SIZE as usize + 1, &mut rng);
        for e in &elements {
            trunk.update(e, false);
        }
        let before_stats = trunk.stats();
        let before_hash = trunk.root_hash();

        assert_eq!(
            trunk.normalize(&FlakyUtxoSet),
            Err("backing store read failed")
        );
        let after = trunk.stats();
        assert_eq!(after.nodes, before_stats.nodes);
        assert_eq!(after.multisets, before_stats.multisets);
        assert_eq!(after.queued, before_stats.queued, "failed item is requeued");
        assert_eq!(trunk.root_hash(), before_hash);

        // Retrying against a healthy store completes the deferred split.
        trunk.normalize(&filled_store(&elements)).unwrap();
        trunk.assert_normalized();
        assert!(trunk.probe(&[]).is_branch());
    }

    #[test]
    #[should_panic(expected = "diverged")]
    fn test_split_count_mismatch_is_fatal() {
        let mut rng = StdRng::seed_from_u64(14);
        let trunk = TrunkNode::new();
        let elements = prefixed_elements(0x3d, MAX_LEAF_SIZE as usize + 1, &mut rng);
        for e in &elements {
            trunk.update(e, false);
        }
        // The store is missing half of what the tree absorbed.
        let _ = trunk.normalize(&filled_store(&elements[..1000]));
    }

    #[test]
    #[should_panic(expected = "minimum")]
    fn test_short_element_is_rejected() {
        TrunkNode::new().update(&[0x3d, 0x00, 0x00], false);
    }
}
