//! Halo exchange between face adjacent leaves.

use std::array;

use bumpalo::Bump;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use treeamr_geometry::{Face, IndexSpace, IndexWindow, Split, faces};

use crate::block::Block;
use crate::buffer::{Buffer, GetterMut};
use crate::config::{BoundaryPolicy, FieldBuffer, FieldType, Value};
use crate::tree::{Node, NodeId, TreeError};

use super::{Mesh, MeshError};

/// Where the ghost cells behind one face of a leaf come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HaloSource {
    /// A leaf on the same level, copied directly.
    Same(NodeId),
    /// An internal node on the same level. Its children are restricted.
    Finer(NodeId),
    /// A leaf one level coarser, prolonged.
    Coarser(NodeId),
    /// Outer boundary, filled from the nearest interior cells.
    Extrapolate,
    /// Outer boundary, left untouched.
    Skip,
}

/// Ghost values of one field behind one face, gathered before they are written.
#[derive(Debug)]
struct HaloPatch<const D: usize> {
    field: usize,
    origin: [usize; D],
    values: FieldBuffer<D>,
}

impl<const D: usize> Mesh<D> {
    /// Fills the ghost cells of every leaf from its face neighbors.
    pub fn synchronize(&mut self) -> Result<(), MeshError> {
        let leaves = self.leaves();
        self.synchronize_leaves(leaves)
    }

    /// Fills the ghost cells of the leaves of a single tree. Neighbors in other trees are
    /// read but not updated.
    pub fn synchronize_tree(&mut self, tree: usize) -> Result<(), MeshError> {
        let leaves = self.tree_leaves(tree)?;
        self.synchronize_leaves(leaves)
    }

    pub(super) fn synchronize_leaves(&mut self, leaves: Vec<NodeId>) -> Result<(), MeshError> {
        let mut order = leaves
            .into_iter()
            .map(|id| Ok((self.node(id)?.level(), id)))
            .collect::<Result<Vec<_>, MeshError>>()?;

        // Prolongation reads the halo of the coarser leaf, so coarse levels go first.
        order.sort_by_key(|&(level, _)| level);

        for group in order.chunk_by(|a, b| a.0 == b.0) {
            let ids = group.iter().map(|&(_, id)| id).collect::<Vec<_>>();
            let patches = self.gather(&ids)?;

            for (&id, patches) in ids.iter().zip(patches) {
                self.scatter(id, patches)?;
            }

            log::trace!("synchronized {} leaves on level {}", ids.len(), group[0].0);
        }

        Ok(())
    }

    #[cfg(feature = "parallel")]
    fn gather(&self, leaves: &[NodeId]) -> Result<Vec<Vec<HaloPatch<D>>>, MeshError> {
        leaves.par_iter().map(|&id| self.gather_leaf(id)).collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn gather(&self, leaves: &[NodeId]) -> Result<Vec<Vec<HaloPatch<D>>>, MeshError> {
        leaves.iter().map(|&id| self.gather_leaf(id)).collect()
    }

    fn scatter(&mut self, id: NodeId, patches: Vec<HaloPatch<D>>) -> Result<(), MeshError> {
        let node = self.node_mut(id)?;
        let block = node.data.as_mut().ok_or(TreeError::EmptyLeaf(id))?;

        for patch in patches {
            match patch.values.field_type() {
                FieldType::Float => scatter_field::<f64, D>(block, &patch),
                FieldType::Int => scatter_field::<i64, D>(block, &patch),
            }
        }

        node.sync = false;
        Ok(())
    }

    fn gather_leaf(&self, id: NodeId) -> Result<Vec<HaloPatch<D>>, MeshError> {
        let node = self.node(id)?;
        let block = node.data().ok_or(TreeError::EmptyLeaf(id))?;

        let scratch = Bump::new();
        let mut patches = Vec::new();

        for face in faces::<D>() {
            let source = self.halo_source(id, node, face)?;
            if source == HaloSource::Skip {
                continue;
            }

            let window = self.ghost_window(face);

            for (field, descriptor) in self.config.fields().iter().enumerate() {
                let halo = Halo {
                    node,
                    block,
                    source,
                    face,
                    field,
                    window,
                };

                let values = match descriptor.kind.field_type() {
                    FieldType::Float => self.gather_field::<f64>(&scratch, halo)?,
                    FieldType::Int => self.gather_field::<i64>(&scratch, halo)?,
                };

                patches.push(HaloPatch {
                    field,
                    origin: window.origin,
                    values,
                });
            }
        }

        Ok(patches)
    }

    fn halo_source(
        &self,
        id: NodeId,
        node: &Node<Block<D>, D>,
        face: Face<D>,
    ) -> Result<HaloSource, MeshError> {
        if let Some(neighbor) = node.adjacent(face) {
            return Ok(if self.node(neighbor)?.is_leaf() {
                HaloSource::Same(neighbor)
            } else {
                HaloSource::Finer(neighbor)
            });
        }

        if self.neighbor_index(node.level(), node.index(), face).is_none() {
            return Ok(match self.settings().boundary {
                BoundaryPolicy::Skip => HaloSource::Skip,
                BoundaryPolicy::Extrapolate | BoundaryPolicy::Periodic => HaloSource::Extrapolate,
            });
        }

        let coarse = node
            .parent()
            .and_then(|parent| self.nodes.get(parent))
            .and_then(|parent| parent.adjacent(face));

        match coarse {
            Some(coarse) if self.node(coarse)?.is_leaf() => Ok(HaloSource::Coarser(coarse)),
            _ => Err(MeshError::Ungraded(id)),
        }
    }

    /// Ghost cells of a block lying behind `face`, excluding corners.
    fn ghost_window(&self, face: Face<D>) -> IndexWindow<D> {
        let (width, ghost) = (self.config.block_size(), self.config.ghost());

        let mut origin = [ghost; D];
        let mut size = [width; D];

        origin[face.axis] = if face.side { ghost + width } else { 0 };
        size[face.axis] = ghost;

        IndexWindow::new(origin, size)
    }

    fn leaf_field<T: Value>(&self, id: NodeId, field: usize) -> Result<&Buffer<T, D>, MeshError> {
        self.block(id)?.buffer::<T>(field).ok_or(MeshError::FieldType {
            field,
            expected: T::TYPE,
        })
    }

    fn gather_field<T: Value>(
        &self,
        scratch: &Bump,
        halo: Halo<'_, D>,
    ) -> Result<FieldBuffer<D>, MeshError> {
        let Halo {
            node,
            block,
            source,
            face,
            field,
            window,
        } = halo;

        let mismatch = || MeshError::FieldType {
            field,
            expected: T::TYPE,
        };

        let sampler = self
            .config
            .fields()
            .get(field)
            .and_then(|descriptor| T::sampler(&descriptor.kind))
            .ok_or_else(mismatch)?;

        let (width, ghost) = (block.width() as isize, block.ghost() as isize);
        let (axis, sign) = (face.axis, face.sign());

        let mut values = Buffer::<T, D>::new(window.size)?;

        // Ghost coordinates relative to the first interior cell.
        let relative = |cell: [usize; D]| -> [isize; D] {
            array::from_fn(|i| (window.origin[i] + cell[i]) as isize - ghost)
        };

        match source {
            HaloSource::Same(neighbor) => {
                let src = self.leaf_field::<T>(neighbor, field)?;

                for cell in IndexSpace::new(window.size).iter() {
                    let mut x = relative(cell);
                    x[axis] -= sign * width;
                    values[cell] = src[x.map(|coord| (coord + ghost) as usize)];
                }
            }
            HaloSource::Finer(neighbor) => {
                let neighbor_node = self.node(neighbor)?;
                let half = width / 2;

                for cell in IndexSpace::new(window.size).iter() {
                    let mut u = relative(cell);
                    u[axis] -= sign * width;

                    let split = Split::<D>::pack(u.map(|coord| coord >= half));
                    let child = neighbor_node
                        .child(split)
                        .filter(|&child| self.nodes.get(child).is_some_and(Node::is_leaf))
                        .ok_or(MeshError::Ungraded(neighbor))?;

                    let src = self.leaf_field::<T>(child, field)?;
                    let offset = split.offset();
                    let base = array::from_fn(|i| {
                        (ghost + 2 * (u[i] - offset[i] as isize * half)) as usize
                    });

                    let mut value = [T::default()];
                    sampler.downsample(
                        &src.getter(base),
                        &mut GetterMut::from_slice(&mut value, [1; D], [0; D]),
                    );
                    values[cell] = value[0];
                }
            }
            HaloSource::Coarser(coarse) => {
                let src = self.leaf_field::<T>(coarse, field)?;
                let offset = node.split().offset();
                let patch = scratch.alloc_slice_fill_default::<T>(Split::<D>::COUNT);

                for cell in IndexSpace::new(window.size).iter() {
                    // Position in the fine index space of the parent's interior.
                    let x = relative(cell);
                    let v: [isize; D] = array::from_fn(|i| x[i] + offset[i] as isize * width);

                    let base = array::from_fn(|i| {
                        let mut coord = ghost + v[i].div_euclid(2);
                        if i == axis {
                            coord -= sign * width;
                        }
                        coord as usize
                    });

                    sampler.upsample(
                        &src.getter(base),
                        &mut GetterMut::from_slice(&mut *patch, [2; D], [0; D]),
                    );

                    let split = Split::<D>::pack(v.map(|coord| coord.rem_euclid(2) == 1));
                    values[cell] = patch[split.to_linear()];
                }
            }
            HaloSource::Extrapolate => {
                let src = block.buffer::<T>(field).ok_or_else(mismatch)?;
                let (ghost, width) = (block.ghost(), block.width());

                for cell in IndexSpace::new(window.size).iter() {
                    let mut x: [usize; D] = array::from_fn(|i| window.origin[i] + cell[i]);
                    x[axis] = x[axis].clamp(ghost, ghost + width - 1);
                    values[cell] = src[x];
                }
            }
            HaloSource::Skip => {}
        }

        Ok(T::wrap(values))
    }
}

/// Everything needed to fill one field behind one face.
#[derive(Clone, Copy)]
struct Halo<'a, const D: usize> {
    node: &'a Node<Block<D>, D>,
    block: &'a Block<D>,
    source: HaloSource,
    face: Face<D>,
    field: usize,
    window: IndexWindow<D>,
}

fn scatter_field<T: Value, const D: usize>(block: &mut Block<D>, patch: &HaloPatch<D>) {
    let (Some(src), Some(dst)) = (T::buffer(&patch.values), block.buffer_mut::<T>(patch.field))
    else {
        return;
    };

    for cell in src.space().iter() {
        let target: [usize; D] = array::from_fn(|i| patch.origin[i] + cell[i]);
        dst[target] = src[cell];
    }
}
