use datasize::DataSize;
use treeamr_geometry::Split;

use crate::buffer::{Array, ArrayMut, Buffer, BufferError};
use crate::config::{FieldBuffer, FieldKind, FieldType, MeshConfig, Value};
use crate::grid::{downsample_child, upsample_child};

/// Field storage of a single leaf: one buffer per field, each spanning the interior plus a
/// halo of `ghost` cells on every side.
#[derive(Debug, PartialEq)]
pub struct Block<const D: usize> {
    fields: Vec<FieldBuffer<D>>,
    width: usize,
    ghost: usize,
}

impl<const D: usize> Block<D> {
    pub fn new(fields: Vec<FieldBuffer<D>>, width: usize, ghost: usize) -> Self {
        Self {
            fields,
            width,
            ghost,
        }
    }

    /// Interior cells along each axis.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn ghost(&self) -> usize {
        self.ghost
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, field: usize) -> Option<&FieldBuffer<D>> {
        self.fields.get(field)
    }

    pub fn field_mut(&mut self, field: usize) -> Option<&mut FieldBuffer<D>> {
        self.fields.get_mut(field)
    }

    /// Whole buffer (halo included) of a field, if it stores `T`.
    pub fn buffer<T: Value>(&self, field: usize) -> Option<&Buffer<T, D>> {
        self.fields.get(field).and_then(T::buffer)
    }

    pub fn buffer_mut<T: Value>(&mut self, field: usize) -> Option<&mut Buffer<T, D>> {
        self.fields.get_mut(field).and_then(T::buffer_mut)
    }

    /// The interior cells of a field.
    pub fn interior<T: Value>(&self, field: usize) -> Option<Array<'_, T, D>> {
        let (ghost, width) = (self.ghost, self.width);
        self.buffer::<T>(field)?.window([ghost; D], [width; D]).ok()
    }

    pub fn interior_mut<T: Value>(&mut self, field: usize) -> Option<ArrayMut<'_, T, D>> {
        let (ghost, width) = (self.ghost, self.width);
        self.buffer_mut::<T>(field)?
            .window_mut([ghost; D], [width; D])
            .ok()
    }

    /// Prolongs this block into `2^D` children, ordered by `Split` linear index.
    pub(crate) fn subdivide(&self, config: &MeshConfig<D>) -> Result<Vec<Block<D>>, BufferError> {
        let mut children = (0..Split::<D>::COUNT)
            .map(|_| config.create_block())
            .collect::<Result<Vec<_>, _>>()?;

        for (field, descriptor) in config.fields().iter().enumerate() {
            match descriptor.kind.field_type() {
                FieldType::Float => {
                    self.subdivide_field::<f64>(&descriptor.kind, field, &mut children)
                }
                FieldType::Int => self.subdivide_field::<i64>(&descriptor.kind, field, &mut children),
            }
        }

        Ok(children)
    }

    fn subdivide_field<T: Value>(
        &self,
        kind: &FieldKind<D>,
        field: usize,
        children: &mut [Block<D>],
    ) {
        let (Some(sampler), Some(parent)) = (T::sampler(kind), self.buffer::<T>(field)) else {
            return;
        };

        for (linear, child) in children.iter_mut().enumerate() {
            if let Some(dst) = child.buffer_mut::<T>(field) {
                upsample_child(
                    sampler,
                    parent,
                    dst,
                    Split::from_linear(linear),
                    self.width,
                    self.ghost,
                );
            }
        }
    }

    /// Restricts `2^D` children (in `Split` order) into a fresh block.
    pub(crate) fn coarsen(
        children: &[Block<D>],
        config: &MeshConfig<D>,
    ) -> Result<Block<D>, BufferError> {
        let mut parent = config.create_block()?;

        for (field, descriptor) in config.fields().iter().enumerate() {
            match descriptor.kind.field_type() {
                FieldType::Float => parent.coarsen_field::<f64>(&descriptor.kind, field, children),
                FieldType::Int => parent.coarsen_field::<i64>(&descriptor.kind, field, children),
            }
        }

        Ok(parent)
    }

    fn coarsen_field<T: Value>(&mut self, kind: &FieldKind<D>, field: usize, children: &[Block<D>]) {
        let (width, ghost) = (self.width, self.ghost);
        let (Some(sampler), Some(parent)) = (T::sampler(kind), self.buffer_mut::<T>(field)) else {
            return;
        };

        for (linear, child) in children.iter().enumerate() {
            if let Some(src) = child.buffer::<T>(field) {
                downsample_child(
                    sampler,
                    src,
                    parent,
                    Split::from_linear(linear),
                    width,
                    ghost,
                );
            }
        }
    }
}

impl<const D: usize> DataSize for Block<D> {
    const IS_DYNAMIC: bool = true;
    const STATIC_HEAP_SIZE: usize = 0;

    fn estimate_heap_size(&self) -> usize {
        self.fields.capacity() * std::mem::size_of::<FieldBuffer<D>>()
            + self
                .fields
                .iter()
                .map(|field| field.estimate_heap_size())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshSettings;
    use crate::grid::{Conservative, Nearest};

    #[test]
    fn subdivide_and_coarsen() -> eyre::Result<()> {
        let config = MeshConfig::<2>::new(MeshSettings {
            block_size: 4,
            ghost: 1,
            ..Default::default()
        })?
        .float_field("u", Conservative)?
        .int_field("tag", Nearest)?;

        let mut block = config.create_block()?;
        assert_eq!(block.buffer::<f64>(0).map(|b| b.size()), Some([6, 6]));
        assert!(block.buffer::<f64>(1).is_none());

        {
            let mut interior = block.interior_mut::<f64>(0).unwrap();
            for index in interior.indices() {
                interior[index] = (index[0] + 4 * index[1]) as f64;
            }
        }
        block.interior_mut::<i64>(1).unwrap().fill(9);

        let children = block.subdivide(&config)?;
        assert_eq!(children.len(), 4);

        // Child 1 covers the upper half of axis 0: parent interior cells 2..4 along x.
        let child = children[1].interior::<f64>(0).unwrap();
        assert_eq!(child[[0, 0]], 2.0);
        assert_eq!(child[[1, 1]], 2.0);
        assert_eq!(child[[2, 0]], 3.0);
        assert_eq!(child[[0, 2]], 6.0);
        assert!(children[3].interior::<i64>(1).unwrap().values().all(|&v| v == 9));

        let merged = Block::coarsen(&children, &config)?;
        assert_eq!(
            merged.interior::<f64>(0).unwrap().values().collect::<Vec<_>>(),
            block.interior::<f64>(0).unwrap().values().collect::<Vec<_>>()
        );
        assert!(merged.interior::<i64>(1).unwrap().values().all(|&v| v == 9));

        Ok(())
    }
}
