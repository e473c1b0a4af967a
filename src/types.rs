//! Define the types that make up a trunk's in-memory tree.

use serde::{Deserialize, Serialize};

/// A finalized 32-byte digest, either of one multiset or of a whole subtree.
pub type DigestBytes = [u8; 32];

/// Index of a node within its trunk's `nodes` arena. Node 0 is the trunk root.
pub type NodeIndex = u32;

/// Index into a trunk's `branches` or `multisets` arena.
pub type SlotIndex = u32;

/// One tree node. Nodes never own their payload directly; `kind` carries an
/// index into the owning trunk's side arenas so the whole tree stays
/// pointer-free and relocatable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Node {
    /// Number of elements in the subtree rooted at this node.
    ///
    /// Updated with wrapping signed arithmetic: a delta workload that removes
    /// elements it never added drives the count "below zero", and a matching
    /// add must bring it back to exactly where it was.
    pub count: u64,
    /// Leaf or branch, with the arena slot holding the node's payload.
    pub kind: NodeKind,
}

/// Payload discriminant for [`Node`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Terminal node accumulating elements into `multisets[multiset]`.
    Leaf {
        /// Slot of this leaf's multiset.
        multiset: SlotIndex,
    },
    /// Internal node whose 16 children live in `branches[branch]`.
    Branch {
        /// Slot of this node's child table.
        branch: SlotIndex,
    },
}

impl Node {
    /// A leaf with the given count, accumulating into `multiset`.
    pub const fn leaf(count: u64, multiset: SlotIndex) -> Self {
        Self {
            count,
            kind: NodeKind::Leaf { multiset },
        }
    }

    /// A branch with the given count, dispatching through `branch`.
    pub const fn branch(count: u64, branch: SlotIndex) -> Self {
        Self {
            count,
            kind: NodeKind::Branch { branch },
        }
    }

    /// Whether this node is a branch.
    pub const fn is_branch(&self) -> bool {
        matches!(self.kind, NodeKind::Branch { .. })
    }
}

/// A node queued for normalization, with the depth it sits at (in bits) and
/// enough of the triggering element to derive subrange bounds on a split.
#[derive(Clone, Debug)]
pub struct NormalizeItem {
    /// Index of the queued node in the trunk's `nodes` arena.
    pub node: NodeIndex,
    /// Bit depth of the node: 4 for a trunk root, plus 4 per level below it.
    pub bits: u32,
    /// Bytes of the element whose update enqueued this node. Only the first
    /// `bits` bits identify the node's subrange; the tail is ignored.
    pub prefix: Vec<u8>,
}

impl NormalizeItem {
    /// Creates a queue entry for `node` at `bits`, keyed by `prefix`.
    pub fn new(node: NodeIndex, bits: u32, prefix: Vec<u8>) -> Self {
        Self { node, bits, prefix }
    }
}

/// Arena and queue sizes of one trunk. Arena sizes only grow; the gap
/// between `nodes` and live tree nodes measures normalization churn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrunkStats {
    /// Total nodes ever allocated, orphans included.
    pub nodes: usize,
    /// Total branch child-tables ever allocated.
    pub branches: usize,
    /// Total multiset states ever allocated.
    pub multisets: usize,
    /// Entries currently awaiting normalization.
    pub queued: usize,
    /// Elements currently accumulated under the trunk root.
    pub elements: u64,
}

/// Per-trunk statistics for a whole engine, in trunk order 0..15.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStats {
    /// One entry per trunk.
    pub trunks: Vec<TrunkStats>,
}

impl CommitStats {
    /// Elements currently accumulated across all trunks.
    pub fn elements(&self) -> u64 {
        self.trunks.iter().map(|t| t.elements).sum()
    }
}
