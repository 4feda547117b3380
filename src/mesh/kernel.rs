#[cfg(feature = "parallel")]
use rayon::prelude::*;
use treeamr_geometry::Rectangle;

use crate::block::Block;
use crate::buffer::{BufferError, Getter, GetterMut};
use crate::config::Value;
use crate::tree::{Action, Node, NodeId, TreeError};

use super::{Mesh, MeshError, block_rect};

/// Mutable access to a single leaf while a kernel runs.
///
/// Cell offsets are relative to the first interior cell, so `[0; D]` is the lower corner of
/// the interior and negative offsets reach into the halo. Setting `refine` or `derefine`
/// records a request on the leaf once the view is dropped:
///
/// - `refine` always requests refinement.
/// - `derefine` requests coarsening unless refinement is already pending.
/// - Otherwise a coarsening request left by an earlier kernel is withdrawn, so coarsening
///   must be confirmed on every application.
#[derive(Debug)]
pub struct DataView<'a, const D: usize> {
    id: NodeId,
    level: usize,
    index: [usize; D],
    bounds: Rectangle<D>,
    block: &'a mut Block<D>,
    action: &'a mut Action,
    pub refine: bool,
    pub derefine: bool,
}

impl<'a, const D: usize> DataView<'a, D> {
    pub(crate) fn new(
        id: NodeId,
        node: &'a mut Node<Block<D>, D>,
        bounds: Rectangle<D>,
    ) -> Result<Self, MeshError> {
        let (level, index) = (node.level, node.index);
        let Node { data, action, .. } = node;
        let block = data.as_mut().ok_or(TreeError::EmptyLeaf(id))?;

        Ok(Self {
            id,
            level,
            index,
            bounds,
            block,
            action,
            refine: false,
            derefine: false,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// Global block index on this leaf's level.
    pub fn index(&self) -> [usize; D] {
        self.index
    }

    /// Physical region covered by the interior.
    pub fn bounds(&self) -> Rectangle<D> {
        self.bounds
    }

    pub fn width(&self) -> usize {
        self.block.width()
    }

    pub fn ghost(&self) -> usize {
        self.block.ghost()
    }

    /// Action currently pending on the leaf, before this view's requests are applied.
    pub fn action(&self) -> Action {
        *self.action
    }

    /// Physical spacing between cell centers.
    pub fn spacing(&self) -> [f64; D] {
        let width = self.width() as f64;
        self.bounds.size.map(|size| size / width)
    }

    /// Center of a cell, given by its offset from the first interior cell.
    pub fn cell_center(&self, cell: [isize; D]) -> [f64; D] {
        let spacing = self.spacing();
        std::array::from_fn(|axis| {
            self.bounds.origin[axis] + (cell[axis] as f64 + 0.5) * spacing[axis]
        })
    }

    pub fn block(&self) -> &Block<D> {
        &*self.block
    }

    pub fn block_mut(&mut self) -> &mut Block<D> {
        &mut *self.block
    }

    fn position(&self, field: usize, offset: [isize; D]) -> Result<[usize; D], MeshError> {
        let ghost = self.ghost() as isize;
        let extent = (self.width() + 2 * self.ghost()) as isize;

        let mut result = [0; D];
        for axis in 0..D {
            let coord = ghost + offset[axis];
            if coord < 0 || coord >= extent {
                log::trace!("offset {offset:?} of field {field} leaves the block halo");
                return Err(BufferError::OutOfBounds { axis }.into());
            }
            result[axis] = coord as usize;
        }

        Ok(result)
    }

    pub fn get<T: Value>(&self, field: usize, offset: [isize; D]) -> Result<T, MeshError> {
        let position = self.position(field, offset)?;
        let fields = self.block.num_fields();
        self.block
            .buffer::<T>(field)
            .map(|buffer| buffer[position])
            .ok_or_else(|| mismatch::<T>(field, fields))
    }

    pub fn set<T: Value>(
        &mut self,
        field: usize,
        offset: [isize; D],
        value: T,
    ) -> Result<(), MeshError> {
        let position = self.position(field, offset)?;
        let fields = self.block.num_fields();
        let buffer = self
            .block
            .buffer_mut::<T>(field)
            .ok_or_else(|| mismatch::<T>(field, fields))?;
        buffer[position] = value;
        Ok(())
    }

    /// Stencil access to a field, based at the first interior cell.
    pub fn getter<T: Value>(&self, field: usize) -> Result<Getter<'_, T, D>, MeshError> {
        let (ghost, fields) = (self.ghost(), self.block.num_fields());
        self.block
            .buffer::<T>(field)
            .map(|buffer| buffer.getter([ghost; D]))
            .ok_or_else(|| mismatch::<T>(field, fields))
    }

    pub fn getter_mut<T: Value>(&mut self, field: usize) -> Result<GetterMut<'_, T, D>, MeshError> {
        let (ghost, fields) = (self.ghost(), self.block.num_fields());
        self.block
            .buffer_mut::<T>(field)
            .map(|buffer| buffer.getter_mut([ghost; D]))
            .ok_or_else(|| mismatch::<T>(field, fields))
    }

    pub fn request_refine(&mut self) {
        self.refine = true;
    }

    pub fn request_coarsen(&mut self) {
        self.derefine = true;
    }
}

fn mismatch<T: Value>(field: usize, fields: usize) -> MeshError {
    if field >= fields {
        MeshError::UnknownField(field)
    } else {
        MeshError::FieldType {
            field,
            expected: T::TYPE,
        }
    }
}

impl<const D: usize> Drop for DataView<'_, D> {
    fn drop(&mut self) {
        if self.refine {
            *self.action = Action::Refine;
        } else if self.derefine {
            if *self.action != Action::Refine {
                *self.action = Action::Coarsen;
            }
        } else if *self.action == Action::Coarsen {
            *self.action = Action::None;
        }
    }
}

impl<const D: usize> Mesh<D> {
    /// Runs `kernel` on every leaf, in parallel when the `parallel` feature is enabled.
    pub fn apply_kernel<F>(&mut self, kernel: F) -> Result<(), MeshError>
    where
        F: Fn(&mut DataView<'_, D>) -> Result<(), MeshError> + Sync,
    {
        let Self {
            nodes,
            domain,
            size,
            ..
        } = self;
        let (domain, size) = (&*domain, *size);

        let visit = |(id, node): (NodeId, &mut Node<Block<D>, D>)| {
            let bounds = block_rect(domain, size, node.level, node.index);
            let mut view = DataView::new(id, node, bounds)?;
            kernel(&mut view)
        };

        #[cfg(feature = "parallel")]
        nodes
            .iter_mut()
            .filter(|(_, node)| node.is_leaf())
            .collect::<Vec<_>>()
            .into_par_iter()
            .try_for_each(visit)?;

        #[cfg(not(feature = "parallel"))]
        nodes
            .iter_mut()
            .filter(|(_, node)| node.is_leaf())
            .try_for_each(visit)?;

        Ok(())
    }

    /// Runs `kernel` on the leaves of a single tree, in depth first order.
    pub fn apply_kernel_tree<F>(&mut self, tree: usize, mut kernel: F) -> Result<(), MeshError>
    where
        F: FnMut(&mut DataView<'_, D>) -> Result<(), MeshError>,
    {
        for id in self.tree_leaves(tree)? {
            let node = self.node(id)?;
            let bounds = self.block_bounds(node.level(), node.index());

            let mut view = DataView::new(id, self.node_mut(id)?, bounds)?;
            kernel(&mut view)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldType;
    use crate::mesh::tests::{config, small};

    #[test]
    fn kernel_requests_refinement() -> eyre::Result<()> {
        let mut mesh = Mesh::new(config(small())?, [1, 1])?;
        let root = mesh.trees()[0].root();

        mesh.apply_kernel(|view| {
            view.request_refine();
            Ok(())
        })?;
        assert_eq!(mesh.node(root)?.action, Action::Refine);

        mesh.restructure()?;
        assert_eq!(mesh.num_leaves(), 4);
        Ok(())
    }

    #[test]
    fn coarsening_must_be_confirmed() -> eyre::Result<()> {
        let mut mesh = Mesh::new(config(small())?, [1, 1])?;
        mesh.set_action(mesh.trees()[0].root(), Action::Refine)?;
        mesh.restructure()?;

        mesh.apply_kernel(|view| {
            view.derefine = true;
            Ok(())
        })?;
        for id in mesh.leaves() {
            assert_eq!(mesh.node(id)?.action, Action::Coarsen);
        }

        // A later kernel that does not ask again withdraws the request.
        mesh.apply_kernel(|_| Ok(()))?;
        for id in mesh.leaves() {
            assert_eq!(mesh.node(id)?.action, Action::None);
        }
        assert_eq!(mesh.restructure()?.coarsened, 0);

        mesh.apply_kernel(|view| {
            view.derefine = true;
            Ok(())
        })?;
        assert_eq!(mesh.restructure()?.coarsened, 1);
        assert_eq!(mesh.num_leaves(), 1);
        Ok(())
    }

    #[test]
    fn pending_refinement_survives() -> eyre::Result<()> {
        let mut mesh = Mesh::new(config(small())?, [2, 1])?;
        let (left, right) = (mesh.trees()[0].root(), mesh.trees()[1].root());
        mesh.set_action(left, Action::Refine)?;
        mesh.set_action(right, Action::Refine)?;

        mesh.apply_kernel_tree(0, |_| Ok(()))?;
        mesh.apply_kernel_tree(1, |view| {
            view.request_coarsen();
            Ok(())
        })?;

        assert_eq!(mesh.node(left)?.action, Action::Refine);
        assert_eq!(mesh.node(right)?.action, Action::Refine);
        Ok(())
    }

    #[test]
    fn cell_access() -> eyre::Result<()> {
        let mut mesh = Mesh::new(config(small())?, [2, 1])?;

        mesh.apply_kernel(|view| {
            for j in 0..4 {
                for i in 0..4 {
                    let center = view.cell_center([i, j]);
                    view.set(0, [i, j], center[0])?;
                }
            }
            view.set(1, [-1, 0], 5i64)?;
            Ok(())
        })?;

        // Cell centers of the left tree average to 0.5, those of the right to 1.5.
        assert_eq!(mesh.integrate(0)?, 2.0);

        let left = mesh.trees()[0].root();
        let block = mesh.block(left)?;
        assert_eq!(block.buffer::<f64>(0).unwrap()[[1, 1]], 0.125);
        assert_eq!(block.buffer::<i64>(1).unwrap()[[0, 1]], 5);

        mesh.apply_kernel_tree(0, |view| {
            assert_eq!(view.get::<f64>(0, [3, 0])?, 0.875);
            assert_eq!(view.getter::<f64>(0)?.get([1, 2]), &0.375);
            assert_eq!(view.spacing(), [0.25, 0.25]);

            *view.getter_mut::<i64>(1)?.get_mut([4, 3]) = 2;
            assert_eq!(view.get::<i64>(1, [4, 3])?, 2);
            Ok(())
        })?;

        let out_of_bounds = mesh.apply_kernel(|view| view.get::<f64>(0, [-2, 0]).map(|_| ()));
        assert!(matches!(
            out_of_bounds,
            Err(MeshError::Buffer(BufferError::OutOfBounds { axis: 0 }))
        ));

        let mismatch = mesh.apply_kernel(|view| view.get::<i64>(0, [0, 0]).map(|_| ()));
        assert!(matches!(
            mismatch,
            Err(MeshError::FieldType {
                field: 0,
                expected: FieldType::Int
            })
        ));

        let unknown = mesh.apply_kernel(|view| view.set(7, [0, 0], 1.0).map(|_| ()));
        assert!(matches!(unknown, Err(MeshError::UnknownField(7))));
        Ok(())
    }

    #[test]
    fn stepping_refines_until_satisfied() -> eyre::Result<()> {
        let mut mesh = Mesh::new(config(small())?, [1, 1])?;

        fn refine_twice(view: &mut DataView<'_, 2>) -> Result<(), MeshError> {
            if view.level() < 2 {
                view.request_refine();
            }
            Ok(())
        }

        for _ in 0..4 {
            mesh.step(refine_twice)?;
        }

        assert_eq!(mesh.max_level(), 2);
        assert_eq!(mesh.num_leaves(), 16);
        assert!(mesh.is_graded());
        Ok(())
    }
}
