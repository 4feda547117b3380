use datasize::DataSize;
use thiserror::Error;
use treeamr_geometry::{Face, FaceArray, Split, faces};

use super::{NodeId, Nodes};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("node {0:?} is not a leaf and cannot be split")]
    SplitNonLeaf(NodeId),
    #[error("node {0:?} is a leaf and cannot be merged")]
    MergeLeaf(NodeId),
    #[error("node {0:?} has children that are not leaves")]
    MergeNonLeafChildren(NodeId),
    #[error("leaf {0:?} holds no payload")]
    EmptyLeaf(NodeId),
    #[error("handle {0:?} refers to a released node")]
    Stale(NodeId),
}

/// Pending structural request of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    None,
    Refine,
    Coarsen,
}

/// One element of a tree. Leaves own a payload and have no children, internal nodes own
/// exactly `2^D` children and no payload.
#[derive(Debug)]
pub struct Node<P, const D: usize> {
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) data: Option<P>,
    pub action: Action,
    pub(crate) level: usize,
    pub(crate) index: [usize; D],
    pub(crate) tree: usize,
    pub(crate) adjacent: FaceArray<D, Option<NodeId>>,
    /// Plans of the current restructuring pass that cover this node.
    pub(crate) refine_plan: Vec<usize>,
    pub(crate) sync: bool,
    pub(crate) propagate: bool,
}

impl<P, const D: usize> Node<P, D> {
    /// Creates the root leaf of tree `tree` located at `index` on level 0.
    pub fn root(data: P, tree: usize, index: [usize; D]) -> Self {
        Self {
            parent: None,
            children: Vec::new(),
            data: Some(data),
            action: Action::None,
            level: 0,
            index,
            tree,
            adjacent: FaceArray::default(),
            refine_plan: Vec::new(),
            sync: true,
            propagate: false,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in `Split` linear order, empty for leaves.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn child(&self, split: Split<D>) -> Option<NodeId> {
        self.children.get(split.to_linear()).copied()
    }

    pub fn data(&self) -> Option<&P> {
        self.data.as_ref()
    }

    pub fn data_mut(&mut self) -> Option<&mut P> {
        self.data.as_mut()
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// Global block coordinate on this node's level.
    pub fn index(&self) -> [usize; D] {
        self.index
    }

    pub fn tree(&self) -> usize {
        self.tree
    }

    /// Which child of its parent this node is.
    pub fn split(&self) -> Split<D> {
        Split::from_index(self.index)
    }

    /// Same level neighbor across `face`, if one exists.
    pub fn adjacent(&self, face: Face<D>) -> Option<NodeId> {
        self.adjacent[face]
    }

    /// Whether the halo of this leaf is stale after a structural change.
    pub fn needs_sync(&self) -> bool {
        self.sync
    }
}

impl<P: DataSize, const D: usize> DataSize for Node<P, D> {
    const IS_DYNAMIC: bool = true;
    const STATIC_HEAP_SIZE: usize = 0;

    fn estimate_heap_size(&self) -> usize {
        self.children.capacity() * std::mem::size_of::<NodeId>()
            + self.refine_plan.estimate_heap_size()
            + self.data.as_ref().map_or(0, |data| data.estimate_heap_size())
    }
}

/// Splits leaf `id` into `2^D` children. `subdivide` receives the leaf's payload and must
/// return one payload per child in `Split` order. The payload is only released once it
/// succeeds. Adjacency of the children and of their same level neighbors is updated.
pub fn split_node<P, E, const D: usize>(
    nodes: &mut Nodes<P, D>,
    id: NodeId,
    subdivide: impl FnOnce(&mut P) -> Result<Vec<P>, E>,
) -> Result<Vec<NodeId>, E>
where
    E: From<TreeError>,
{
    let node = nodes.get_mut(id).ok_or(TreeError::Stale(id))?;

    if !node.is_leaf() {
        return Err(TreeError::SplitNonLeaf(id).into());
    }

    let data = node.data.as_mut().ok_or(TreeError::EmptyLeaf(id))?;
    let payloads = subdivide(data)?;
    debug_assert_eq!(payloads.len(), Split::<D>::COUNT);

    node.data = None;

    let (level, index, tree) = (node.level, node.index, node.tree);

    let children = payloads
        .into_iter()
        .zip(Split::<D>::enumerate())
        .map(|(payload, split)| {
            let offset = split.offset();
            nodes.insert(Node {
                parent: Some(id),
                children: Vec::new(),
                data: Some(payload),
                action: Action::None,
                level: level + 1,
                index: std::array::from_fn(|axis| 2 * index[axis] + offset[axis]),
                tree,
                adjacent: FaceArray::default(),
                refine_plan: Vec::new(),
                sync: true,
                propagate: false,
            })
        })
        .collect::<Vec<_>>();

    if let Some(node) = nodes.get_mut(id) {
        node.children = children.clone();
    }

    update_adjacency(nodes, id);

    Ok(children)
}

/// Recomputes the adjacency of the children of `id` and the reverse pointers of their
/// neighbors.
pub fn update_adjacency<P, const D: usize>(nodes: &mut Nodes<P, D>, id: NodeId) {
    let Some(node) = nodes.get(id) else {
        return;
    };

    let children = node.children.clone();
    let outer = node.adjacent;

    for split in Split::<D>::enumerate() {
        let child = children[split.to_linear()];

        for face in faces::<D>() {
            let sibling = split.toggled(face.axis);

            let neighbor = if split.is_inner_face(face) {
                Some(children[sibling.to_linear()])
            } else {
                outer[face]
                    .and_then(|neighbor| nodes.get(neighbor))
                    .and_then(|neighbor| neighbor.child(sibling))
            };

            if let Some(node) = nodes.get_mut(child) {
                node.adjacent[face] = neighbor;
            }

            if split.is_outer_face(face) {
                if let Some(node) = neighbor.and_then(|n| nodes.get_mut(n)) {
                    node.adjacent[face.reversed()] = Some(child);
                }
            }
        }
    }
}

/// Merges the children of `id` back into it. `coarsen` receives the children's payloads
/// in `Split` order. If it fails the children are left untouched.
pub fn merge_node<P, E, const D: usize>(
    nodes: &mut Nodes<P, D>,
    id: NodeId,
    coarsen: impl FnOnce(&mut [P]) -> Result<P, E>,
) -> Result<(), E>
where
    E: From<TreeError>,
{
    let node = nodes.get(id).ok_or(TreeError::Stale(id))?;

    if node.is_leaf() {
        return Err(TreeError::MergeLeaf(id).into());
    }

    let children = node.children.clone();

    for &child in &children {
        let node = nodes.get(child).ok_or(TreeError::Stale(child))?;
        if !node.is_leaf() {
            return Err(TreeError::MergeNonLeafChildren(id).into());
        }
        if node.data.is_none() {
            return Err(TreeError::EmptyLeaf(child).into());
        }
    }

    let mut payloads = children
        .iter()
        .filter_map(|&child| nodes.get_mut(child).and_then(|node| node.data.take()))
        .collect::<Vec<_>>();

    let merged = match coarsen(&mut payloads) {
        Ok(merged) => merged,
        Err(err) => {
            for (&child, payload) in children.iter().zip(payloads) {
                if let Some(node) = nodes.get_mut(child) {
                    node.data = Some(payload);
                }
            }
            return Err(err);
        }
    };

    for &child in &children {
        let Some(removed) = nodes.remove(child) else {
            continue;
        };

        for face in faces::<D>() {
            let Some(neighbor) = removed.adjacent[face] else {
                continue;
            };

            if let Some(neighbor) = nodes.get_mut(neighbor) {
                if neighbor.adjacent[face.reversed()] == Some(child) {
                    neighbor.adjacent[face.reversed()] = None;
                }
            }
        }
    }

    if let Some(node) = nodes.get_mut(id) {
        node.children.clear();
        node.data = Some(merged);
        node.sync = true;
    }

    Ok(())
}

/// Collects the leaves below `root` in depth first order.
pub fn leaves<P, const D: usize>(nodes: &Nodes<P, D>, root: NodeId) -> Vec<NodeId> {
    let mut result = Vec::new();
    let mut stack = vec![root];

    while let Some(id) = stack.pop() {
        let Some(node) = nodes.get(id) else {
            continue;
        };

        if node.is_leaf() {
            result.push(id);
        } else {
            stack.extend(node.children.iter().rev());
        }
    }

    result
}

/// Follows the bits of `index` (a coordinate on `level`) down from `root`, returning the
/// deepest node covering it whose level does not exceed `level`.
pub fn descend<P, const D: usize>(
    nodes: &Nodes<P, D>,
    root: NodeId,
    level: usize,
    index: [usize; D],
) -> Option<NodeId> {
    let mut current = root;

    loop {
        let node = nodes.get(current)?;

        if node.is_leaf() || node.level >= level {
            return Some(current);
        }

        let shift = level - node.level - 1;
        let split = Split::pack(std::array::from_fn(|axis| (index[axis] >> shift) & 1 == 1));
        current = node.child(split)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Tree = Nodes<Vec<u32>, 2>;

    fn halve(data: &mut Vec<u32>) -> Result<Vec<Vec<u32>>, TreeError> {
        Ok((0..4).map(|i| vec![data.len() as u32 + i]).collect())
    }

    fn concat(children: &mut [Vec<u32>]) -> Result<Vec<u32>, TreeError> {
        Ok(children.iter_mut().flat_map(std::mem::take).collect())
    }

    #[test]
    fn split_links_siblings() -> eyre::Result<()> {
        let mut nodes = Tree::with_key();
        let root = nodes.insert(Node::root(vec![], 0, [0, 0]));

        let children = split_node(&mut nodes, root, halve)?;
        assert_eq!(children.len(), 4);
        assert!(!nodes.get(root).unwrap().is_leaf());
        assert!(nodes.get(root).unwrap().data().is_none());

        let first = nodes.get(children[0]).unwrap();
        assert_eq!(first.level(), 1);
        assert_eq!(first.index(), [0, 0]);
        assert_eq!(first.adjacent(Face::positive(0)), Some(children[1]));
        assert_eq!(first.adjacent(Face::positive(1)), Some(children[2]));
        assert_eq!(first.adjacent(Face::negative(0)), None);

        let last = nodes.get(children[3]).unwrap();
        assert_eq!(last.index(), [1, 1]);
        assert_eq!(last.split(), Split::pack([true, true]));
        assert_eq!(last.data(), Some(&vec![3]));

        assert_eq!(
            split_node(&mut nodes, root, halve),
            Err(TreeError::SplitNonLeaf(root))
        );
        Ok(())
    }

    #[test]
    fn split_links_cousins() -> eyre::Result<()> {
        let mut nodes = Tree::with_key();
        let root = nodes.insert(Node::root(vec![], 0, [0, 0]));
        let children = split_node(&mut nodes, root, halve)?;

        // Refine the lower left and lower right quadrants. Their facing children must see
        // each other.
        let left = split_node(&mut nodes, children[0], halve)?;
        let right = split_node(&mut nodes, children[1], halve)?;

        let a = nodes.get(left[1]).unwrap();
        assert_eq!(a.index(), [1, 0]);
        assert_eq!(a.adjacent(Face::positive(0)), Some(right[0]));
        assert_eq!(
            nodes.get(right[0]).unwrap().adjacent(Face::negative(0)),
            Some(left[1])
        );

        // The upper left quadrant is still a coarse leaf.
        assert_eq!(a.adjacent(Face::positive(1)), Some(left[3]));
        assert_eq!(nodes.get(left[3]).unwrap().adjacent(Face::positive(1)), None);

        assert_eq!(descend(&nodes, root, 2, [2, 1]), Some(right[2]));
        assert_eq!(descend(&nodes, root, 2, [1, 3]), Some(children[2]));
        assert_eq!(descend(&nodes, root, 1, [1, 0]), Some(children[1]));

        assert_eq!(leaves(&nodes, root).len(), 2 + 4 + 4);
        Ok(())
    }

    #[test]
    fn merge_clears_reverse_links() -> eyre::Result<()> {
        let mut nodes = Tree::with_key();
        let root = nodes.insert(Node::root(vec![], 0, [0, 0]));
        let children = split_node(&mut nodes, root, halve)?;
        let left = split_node(&mut nodes, children[0], halve)?;
        let right = split_node(&mut nodes, children[1], halve)?;

        assert_eq!(
            merge_node(&mut nodes, root, concat),
            Err(TreeError::MergeNonLeafChildren(root))
        );
        assert_eq!(
            merge_node(&mut nodes, left[0], concat),
            Err(TreeError::MergeLeaf(left[0]))
        );

        merge_node(&mut nodes, children[1], concat)?;
        assert!(!nodes.contains_key(right[0]));
        assert_eq!(nodes.get(children[1]).unwrap().data(), Some(&vec![1, 2, 3, 4]));
        assert_eq!(nodes.get(left[1]).unwrap().adjacent(Face::positive(0)), None);
        assert_eq!(
            nodes.get(children[0]).unwrap().adjacent(Face::positive(0)),
            Some(children[1])
        );

        assert!(matches!(
            merge_node(&mut nodes, right[0], concat),
            Err(TreeError::Stale(_))
        ));
        Ok(())
    }

    #[test]
    fn failed_merge_restores_children() -> eyre::Result<()> {
        let mut nodes = Tree::with_key();
        let root = nodes.insert(Node::root(vec![7], 0, [0, 0]));
        let children = split_node(&mut nodes, root, halve)?;

        let result = merge_node(&mut nodes, root, |_: &mut [Vec<u32>]| {
            Err::<Vec<u32>, _>(TreeError::Stale(root))
        });
        assert!(result.is_err());
        assert_eq!(nodes.get(children[2]).unwrap().data(), Some(&vec![3]));
        assert!(!nodes.get(root).unwrap().is_leaf());
        Ok(())
    }
}
