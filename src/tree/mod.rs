//! Hierarchical node storage shared by grid meshes and bucket trees.

mod node;
mod plan;

pub use node::{Action, Node, TreeError, descend, leaves, merge_node, split_node, update_adjacency};
pub use plan::{RefinePlan, insert_plan};

use datasize::DataSize;
use slotmap::{SlotMap, new_key_type};

new_key_type! {
    /// Handle to a node. Handles to released nodes are detected rather than aliasing
    /// whatever reuses their slot.
    pub struct NodeId;
}

/// Storage for every node of a hierarchy.
pub type Nodes<P, const D: usize> = SlotMap<NodeId, Node<P, D>>;

/// Heap held by `nodes`, counting the slots themselves and each node's payload.
pub fn nodes_heap_size<P: DataSize, const D: usize>(nodes: &Nodes<P, D>) -> usize {
    let slots = nodes.capacity() * std::mem::size_of::<Node<P, D>>();
    slots + nodes.values().map(DataSize::estimate_heap_size).sum::<usize>()
}

/// One root node of a mesh together with its position in the array of trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tree<const D: usize> {
    root: NodeId,
    offset: [usize; D],
}

impl<const D: usize> Tree<D> {
    pub fn new(root: NodeId, offset: [usize; D]) -> Self {
        Self { root, offset }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Coordinates of this tree within the mesh, which are also the level 0 block index of
    /// its root.
    pub fn offset(&self) -> [usize; D] {
        self.offset
    }
}
