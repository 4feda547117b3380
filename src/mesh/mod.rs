//! The top level container: a regular array of trees sharing one node store.

use std::array;

use datasize::DataSize;
use thiserror::Error;
use treeamr_geometry::{Face, IndexSpace, Rectangle, faces};

use crate::block::Block;
use crate::buffer::BufferError;
use crate::config::{BoundaryPolicy, ConfigError, FieldType, MeshConfig, MeshSettings, Value};
use crate::tree::{
    Action, Node, NodeId, Nodes, Tree, TreeError, descend, leaves, nodes_heap_size,
};

mod kernel;
mod restructure;
mod sync;

pub use kernel::DataView;
pub use restructure::RestructureReport;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
    #[error("mesh extent along axis {axis} is zero")]
    ZeroExtent { axis: usize },
    #[error("grading closure did not converge within {iterations} iterations")]
    GradingDiverged { iterations: usize },
    #[error("handle {0:?} refers to a released node")]
    StaleHandle(NodeId),
    #[error("tree {0} does not exist")]
    UnknownTree(usize),
    #[error("field {0} does not exist")]
    UnknownField(usize),
    #[error("field {field} does not store {expected:?} values")]
    FieldType { field: usize, expected: FieldType },
    #[error("leaf {0:?} borders a leaf more than one level apart")]
    Ungraded(NodeId),
    #[error("node {0:?} is not a leaf")]
    NotLeaf(NodeId),
}

/// An adaptive mesh of `size` trees. Each leaf stores one block of every field declared in
/// the mesh's [`MeshConfig`].
#[derive(Debug)]
pub struct Mesh<const D: usize> {
    config: MeshConfig<D>,
    size: [usize; D],
    domain: Rectangle<D>,
    nodes: Nodes<Block<D>, D>,
    trees: Vec<Tree<D>>,
}

impl<const D: usize> Mesh<D> {
    /// Builds a mesh of `size` unrefined trees, each covering a unit tile.
    pub fn new(config: MeshConfig<D>, size: [usize; D]) -> Result<Self, MeshError> {
        let domain = Rectangle {
            size: size.map(|extent| extent as f64),
            origin: [0.0; D],
        };

        Self::with_domain(config, size, domain)
    }

    /// Builds a mesh of `size` unrefined trees tiling `domain`.
    pub fn with_domain(
        config: MeshConfig<D>,
        size: [usize; D],
        domain: Rectangle<D>,
    ) -> Result<Self, MeshError> {
        if let Some(axis) = size.iter().position(|&extent| extent == 0) {
            return Err(MeshError::ZeroExtent { axis });
        }

        config.settings().validate()?;

        let mut nodes = Nodes::with_key();
        let mut trees = Vec::new();

        for (tree, offset) in IndexSpace::new(size).iter().enumerate() {
            let root = nodes.insert(Node::root(config.create_block()?, tree, offset));
            trees.push(Tree::new(root, offset));
        }

        let mut result = Self {
            config,
            size,
            domain,
            nodes,
            trees,
        };

        result.link_roots();

        log::debug!(
            "created mesh of {} trees with {} fields",
            result.trees.len(),
            result.config.num_fields()
        );

        Ok(result)
    }

    /// Connects the roots of neighboring trees, wrapping around periodic boundaries.
    fn link_roots(&mut self) {
        let space = IndexSpace::new(self.size);

        for tree in 0..self.trees.len() {
            let (root, offset) = (self.trees[tree].root(), self.trees[tree].offset());

            for face in faces::<D>() {
                let neighbor = self
                    .neighbor_index(0, offset, face)
                    .map(|index| self.trees[space.linear_from_cartesian(index)].root());

                if let Some(node) = self.nodes.get_mut(root) {
                    node.adjacent[face] = neighbor;
                }
            }
        }
    }

    pub fn config(&self) -> &MeshConfig<D> {
        &self.config
    }

    pub fn settings(&self) -> &MeshSettings {
        self.config.settings()
    }

    /// Number of trees along each axis.
    pub fn size(&self) -> [usize; D] {
        self.size
    }

    pub fn domain(&self) -> Rectangle<D> {
        self.domain
    }

    pub fn trees(&self) -> &[Tree<D>] {
        &self.trees
    }

    pub fn tree(&self, tree: usize) -> Result<&Tree<D>, MeshError> {
        self.trees.get(tree).ok_or(MeshError::UnknownTree(tree))
    }

    pub fn node(&self, id: NodeId) -> Result<&Node<Block<D>, D>, MeshError> {
        self.nodes.get(id).ok_or(MeshError::StaleHandle(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node<Block<D>, D>, MeshError> {
        self.nodes.get_mut(id).ok_or(MeshError::StaleHandle(id))
    }

    /// Queues a structural change on a leaf, processed by the next restructure.
    pub fn set_action(&mut self, id: NodeId, action: Action) -> Result<(), MeshError> {
        let node = self.node_mut(id)?;
        if !node.is_leaf() {
            return Err(MeshError::NotLeaf(id));
        }
        node.action = action;
        Ok(())
    }

    /// Field data of a leaf.
    pub fn block(&self, id: NodeId) -> Result<&Block<D>, MeshError> {
        let node = self.node(id)?;
        if !node.is_leaf() {
            return Err(MeshError::NotLeaf(id));
        }
        node.data().ok_or(MeshError::Tree(TreeError::EmptyLeaf(id)))
    }

    pub fn block_mut(&mut self, id: NodeId) -> Result<&mut Block<D>, MeshError> {
        let node = self.node_mut(id)?;
        if !node.is_leaf() {
            return Err(MeshError::NotLeaf(id));
        }
        node.data_mut().ok_or(MeshError::Tree(TreeError::EmptyLeaf(id)))
    }

    /// All leaves, tree by tree, in depth first order.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.trees
            .iter()
            .flat_map(|tree| leaves(&self.nodes, tree.root()))
            .collect()
    }

    pub fn tree_leaves(&self, tree: usize) -> Result<Vec<NodeId>, MeshError> {
        Ok(leaves(&self.nodes, self.tree(tree)?.root()))
    }

    pub fn num_leaves(&self) -> usize {
        self.nodes.iter().filter(|(_, node)| node.is_leaf()).count()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Deepest level of any leaf.
    pub fn max_level(&self) -> usize {
        self.nodes
            .iter()
            .map(|(_, node)| node.level())
            .max()
            .unwrap_or(0)
    }

    /// Global index of the block across `face` on the same level, wrapping around periodic
    /// boundaries. `None` if the face lies on the boundary of the mesh.
    pub(crate) fn neighbor_index(
        &self,
        level: usize,
        index: [usize; D],
        face: Face<D>,
    ) -> Option<[usize; D]> {
        let extent = self.size[face.axis] << level;
        let periodic = self.settings().boundary == BoundaryPolicy::Periodic;

        let mut result = index;
        let coord = &mut result[face.axis];

        if face.side {
            if *coord + 1 < extent {
                *coord += 1;
            } else if periodic {
                *coord = 0;
            } else {
                return None;
            }
        } else if *coord > 0 {
            *coord -= 1;
        } else if periodic {
            *coord = extent - 1;
        } else {
            return None;
        }

        Some(result)
    }

    /// The deepest node at or above `level` covering the global block `index` of that
    /// level.
    pub fn locate(&self, level: usize, index: [usize; D]) -> Option<NodeId> {
        let offset: [usize; D] = array::from_fn(|axis| index[axis] >> level);

        if (0..D).any(|axis| offset[axis] >= self.size[axis]) {
            return None;
        }

        let tree = IndexSpace::new(self.size).linear_from_cartesian(offset);
        descend(&self.nodes, self.trees[tree].root(), level, index)
    }

    /// Physical region covered by a block.
    pub fn block_bounds(&self, level: usize, index: [usize; D]) -> Rectangle<D> {
        block_rect(&self.domain, self.size, level, index)
    }

    /// Volume of a single cell on `level`.
    pub fn cell_volume(&self, level: usize) -> f64 {
        let width = self.config.block_size();
        (0..D)
            .map(|axis| self.domain.size[axis] / ((self.size[axis] << level) * width) as f64)
            .product()
    }

    /// Sums `value * cell volume` over the interior of every leaf.
    pub fn integrate(&self, field: usize) -> Result<f64, MeshError> {
        let kind = self
            .config
            .fields()
            .get(field)
            .map(|descriptor| descriptor.kind.field_type())
            .ok_or(MeshError::UnknownField(field))?;

        match kind {
            FieldType::Float => self.integrate_typed::<f64>(field),
            FieldType::Int => self.integrate_typed::<i64>(field),
        }
    }

    fn integrate_typed<T: Value>(&self, field: usize) -> Result<f64, MeshError> {
        let mut total = 0.0;

        for (id, node) in self.nodes.iter().filter(|(_, node)| node.is_leaf()) {
            let block = node.data().ok_or(TreeError::EmptyLeaf(id))?;
            let interior = block.interior::<T>(field).ok_or(MeshError::FieldType {
                field,
                expected: T::TYPE,
            })?;

            let sum: f64 = interior.values().map(|value| value.to_f64()).sum();
            total += sum * self.cell_volume(node.level());
        }

        Ok(total)
    }

    /// Checks that face adjacent leaves differ by at most one level.
    pub fn is_graded(&self) -> bool {
        self.nodes
            .iter()
            .filter(|(_, node)| node.is_leaf())
            .all(|(_, node)| {
                faces::<D>().all(|face| {
                    let Some(index) = self.neighbor_index(node.level(), node.index(), face) else {
                        return true;
                    };

                    self.locate(node.level(), index)
                        .and_then(|cover| self.nodes.get(cover))
                        .is_none_or(|cover| cover.level() + 1 >= node.level())
                })
            })
    }

    /// Restructures, synchronizes and then applies `kernel` to every leaf.
    pub fn step<F>(&mut self, kernel: F) -> Result<RestructureReport, MeshError>
    where
        F: Fn(&mut DataView<'_, D>) -> Result<(), MeshError> + Sync,
    {
        let report = self.restructure()?;
        self.synchronize()?;
        self.apply_kernel(kernel)?;
        Ok(report)
    }

    /// Estimates the heap memory held by the mesh.
    pub fn estimate_heap_size(&self) -> usize {
        DataSize::estimate_heap_size(self)
    }
}

/// Region covered by block `index` of `level` in a mesh of `size` trees tiling `domain`.
fn block_rect<const D: usize>(
    domain: &Rectangle<D>,
    size: [usize; D],
    level: usize,
    index: [usize; D],
) -> Rectangle<D> {
    let extent: [f64; D] = array::from_fn(|axis| domain.size[axis] / (size[axis] << level) as f64);

    Rectangle {
        size: extent,
        origin: array::from_fn(|axis| domain.origin[axis] + index[axis] as f64 * extent[axis]),
    }
}

impl<const D: usize> DataSize for Mesh<D> {
    const IS_DYNAMIC: bool = true;
    const STATIC_HEAP_SIZE: usize = 0;

    fn estimate_heap_size(&self) -> usize {
        nodes_heap_size(&self.nodes)
            + self.trees.capacity() * std::mem::size_of::<Tree<D>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{Conservative, Nearest};

    pub(crate) fn config(settings: MeshSettings) -> eyre::Result<MeshConfig<2>> {
        Ok(MeshConfig::new(settings)?
            .float_field("u", Conservative)?
            .int_field("tag", Nearest)?)
    }

    pub(crate) fn small() -> MeshSettings {
        MeshSettings {
            block_size: 4,
            ghost: 1,
            max_level: 4,
            ..Default::default()
        }
    }

    #[test]
    fn construction() -> eyre::Result<()> {
        assert!(matches!(
            Mesh::new(config(small())?, [2, 0]),
            Err(MeshError::ZeroExtent { axis: 1 })
        ));

        let mesh = Mesh::new(config(small())?, [3, 2])?;
        assert_eq!(mesh.trees().len(), 6);
        assert_eq!(mesh.num_leaves(), 6);
        assert_eq!(mesh.max_level(), 0);
        assert!(mesh.is_graded());

        let root = mesh.trees()[1].root();
        let node = mesh.node(root)?;
        assert_eq!(node.index(), [1, 0]);
        assert_eq!(node.adjacent(Face::negative(0)), Some(mesh.trees()[0].root()));
        assert_eq!(node.adjacent(Face::positive(1)), Some(mesh.trees()[4].root()));
        assert_eq!(node.adjacent(Face::negative(1)), None);

        assert_eq!(mesh.block(root)?.buffer::<f64>(0).map(|b| b.size()), Some([6, 6]));
        assert!(mesh.estimate_heap_size() > 6 * 36 * 8);
        Ok(())
    }

    #[test]
    fn periodic_roots() -> eyre::Result<()> {
        let settings = MeshSettings {
            boundary: BoundaryPolicy::Periodic,
            ..small()
        };
        let mesh = Mesh::new(config(settings)?, [3, 1])?;

        let first = mesh.node(mesh.trees()[0].root())?;
        assert_eq!(first.adjacent(Face::negative(0)), Some(mesh.trees()[2].root()));
        assert_eq!(first.adjacent(Face::positive(1)), Some(mesh.trees()[0].root()));
        Ok(())
    }

    #[test]
    fn location() -> eyre::Result<()> {
        let mut mesh = Mesh::new(config(small())?, [2, 1])?;
        let right = mesh.trees()[1].root();
        mesh.set_action(right, Action::Refine)?;
        mesh.restructure()?;

        assert_eq!(mesh.locate(0, [1, 0]), Some(right));
        assert_eq!(mesh.locate(3, [1, 5]), Some(mesh.trees()[0].root()));

        let child = mesh.locate(1, [3, 1]).unwrap();
        assert_eq!(mesh.node(child)?.level(), 1);
        assert_eq!(mesh.node(child)?.index(), [3, 1]);
        assert_eq!(mesh.node(child)?.parent(), Some(right));

        assert_eq!(mesh.locate(1, [4, 0]), None);
        assert_eq!(mesh.locate(0, [0, 1]), None);

        assert!(matches!(mesh.block(right), Err(MeshError::NotLeaf(_))));
        Ok(())
    }

    #[test]
    fn geometry() -> eyre::Result<()> {
        let domain = Rectangle {
            size: [2.0, 1.0],
            origin: [-1.0, 0.0],
        };
        let mesh = Mesh::with_domain(config(small())?, [2, 1], domain)?;

        assert_eq!(mesh.cell_volume(0), 0.25 * 0.25);
        assert_eq!(mesh.cell_volume(1), 0.125 * 0.125);

        let bounds = mesh.block_bounds(1, [3, 1]);
        assert_eq!(bounds.origin, [0.5, 0.5]);
        assert_eq!(bounds.size, [0.5, 0.5]);
        Ok(())
    }

    #[test]
    fn integration() -> eyre::Result<()> {
        let mut mesh = Mesh::new(config(small())?, [2, 1])?;
        for id in mesh.leaves() {
            mesh.block_mut(id)?
                .interior_mut::<f64>(0)
                .unwrap()
                .fill(2.0);
            mesh.block_mut(id)?
                .interior_mut::<i64>(1)
                .unwrap()
                .fill(3);
        }

        assert_eq!(mesh.integrate(0)?, 4.0);
        assert_eq!(mesh.integrate(1)?, 6.0);
        assert!(matches!(
            mesh.integrate(2),
            Err(MeshError::UnknownField(2))
        ));
        Ok(())
    }
}
