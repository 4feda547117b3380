//! Mesh settings and field layout.

use std::fmt::Debug;
use std::sync::Arc;

use datasize::DataSize;
use ron::ser::PrettyConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::Block;
use crate::buffer::{Buffer, BufferError};
use crate::grid::GridConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("block size must be even and at least 2, got {0}")]
    InvalidBlockSize(usize),
    #[error("ghost width {ghost} must lie in 1..={max} for block size {block_size}")]
    InvalidGhost {
        ghost: usize,
        block_size: usize,
        max: usize,
    },
    #[error("field `{0}` is declared twice")]
    DuplicateField(String),
    #[error("failed to parse settings: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] ron::Error),
}

/// How ghost cells on the outer boundary of the mesh are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BoundaryPolicy {
    /// Boundary ghosts are left untouched, the kernel owns them.
    Skip,
    /// Copies the nearest interior cell outward.
    #[default]
    Extrapolate,
    /// Opposite sides of the mesh are adjacent.
    Periodic,
}

/// Scalar settings of a mesh. Can be stored alongside a simulation in RON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    /// Interior cells per block along each axis.
    pub block_size: usize,
    /// Halo width.
    pub ghost: usize,
    /// Deepest level a node may reach.
    pub max_level: usize,
    pub boundary: BoundaryPolicy,
    /// Bound on grading closure rounds, `max_level + 2` when unset.
    pub max_grading_iterations: Option<usize>,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            block_size: 8,
            ghost: 1,
            max_level: 8,
            boundary: BoundaryPolicy::default(),
            max_grading_iterations: None,
        }
    }
}

impl MeshSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size < 2 || self.block_size % 2 != 0 {
            return Err(ConfigError::InvalidBlockSize(self.block_size));
        }

        let max = self.block_size / 2;
        if self.ghost == 0 || self.ghost > max {
            return Err(ConfigError::InvalidGhost {
                ghost: self.ghost,
                block_size: self.block_size,
                max,
            });
        }

        Ok(())
    }

    pub fn grading_iterations(&self) -> usize {
        self.max_grading_iterations.unwrap_or(self.max_level + 2)
    }

    pub fn from_ron(source: &str) -> Result<Self, ConfigError> {
        let settings: Self = ron::from_str(source)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_ron(&self) -> Result<String, ConfigError> {
        Ok(ron::ser::to_string_pretty(self, PrettyConfig::default())?)
    }
}

/// Element type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Float,
    Int,
}

/// Sampler attached to a field, tagged with the field's element type.
#[derive(Debug, Clone)]
pub enum FieldKind<const D: usize> {
    Float(Arc<dyn GridConfig<f64, D>>),
    Int(Arc<dyn GridConfig<i64, D>>),
}

impl<const D: usize> FieldKind<D> {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldKind::Float(_) => FieldType::Float,
            FieldKind::Int(_) => FieldType::Int,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor<const D: usize> {
    pub name: String,
    pub kind: FieldKind<D>,
}

/// Storage of one field on one block.
#[derive(Debug, PartialEq)]
pub enum FieldBuffer<const D: usize> {
    Float(Buffer<f64, D>),
    Int(Buffer<i64, D>),
}

impl<const D: usize> FieldBuffer<D> {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldBuffer::Float(_) => FieldType::Float,
            FieldBuffer::Int(_) => FieldType::Int,
        }
    }
}

impl<const D: usize> DataSize for FieldBuffer<D> {
    const IS_DYNAMIC: bool = true;
    const STATIC_HEAP_SIZE: usize = 0;

    fn estimate_heap_size(&self) -> usize {
        match self {
            FieldBuffer::Float(buffer) => buffer.estimate_heap_size(),
            FieldBuffer::Int(buffer) => buffer.estimate_heap_size(),
        }
    }
}

/// Element types that can be stored in a field. Bridges generic code to the tagged
/// [`FieldKind`] and [`FieldBuffer`] variants.
pub trait Value: Copy + Default + PartialEq + Debug + DataSize + Send + Sync + 'static {
    const TYPE: FieldType;

    fn buffer<const D: usize>(field: &FieldBuffer<D>) -> Option<&Buffer<Self, D>>;
    fn buffer_mut<const D: usize>(field: &mut FieldBuffer<D>) -> Option<&mut Buffer<Self, D>>;
    fn wrap<const D: usize>(buffer: Buffer<Self, D>) -> FieldBuffer<D>;
    fn sampler<const D: usize>(kind: &FieldKind<D>) -> Option<&dyn GridConfig<Self, D>>;

    /// Arithmetic mean of a non-empty sequence.
    fn mean(values: impl Iterator<Item = Self>) -> Self;

    fn to_f64(self) -> f64;
}

impl Value for f64 {
    const TYPE: FieldType = FieldType::Float;

    fn buffer<const D: usize>(field: &FieldBuffer<D>) -> Option<&Buffer<Self, D>> {
        match field {
            FieldBuffer::Float(buffer) => Some(buffer),
            FieldBuffer::Int(_) => None,
        }
    }

    fn buffer_mut<const D: usize>(field: &mut FieldBuffer<D>) -> Option<&mut Buffer<Self, D>> {
        match field {
            FieldBuffer::Float(buffer) => Some(buffer),
            FieldBuffer::Int(_) => None,
        }
    }

    fn wrap<const D: usize>(buffer: Buffer<Self, D>) -> FieldBuffer<D> {
        FieldBuffer::Float(buffer)
    }

    fn sampler<const D: usize>(kind: &FieldKind<D>) -> Option<&dyn GridConfig<Self, D>> {
        match kind {
            FieldKind::Float(sampler) => Some(sampler.as_ref()),
            FieldKind::Int(_) => None,
        }
    }

    fn mean(values: impl Iterator<Item = Self>) -> Self {
        let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
        sum / count as f64
    }

    fn to_f64(self) -> f64 {
        self
    }
}

impl Value for i64 {
    const TYPE: FieldType = FieldType::Int;

    fn buffer<const D: usize>(field: &FieldBuffer<D>) -> Option<&Buffer<Self, D>> {
        match field {
            FieldBuffer::Int(buffer) => Some(buffer),
            FieldBuffer::Float(_) => None,
        }
    }

    fn buffer_mut<const D: usize>(field: &mut FieldBuffer<D>) -> Option<&mut Buffer<Self, D>> {
        match field {
            FieldBuffer::Int(buffer) => Some(buffer),
            FieldBuffer::Float(_) => None,
        }
    }

    fn wrap<const D: usize>(buffer: Buffer<Self, D>) -> FieldBuffer<D> {
        FieldBuffer::Int(buffer)
    }

    fn sampler<const D: usize>(kind: &FieldKind<D>) -> Option<&dyn GridConfig<Self, D>> {
        match kind {
            FieldKind::Int(sampler) => Some(sampler.as_ref()),
            FieldKind::Float(_) => None,
        }
    }

    fn mean(values: impl Iterator<Item = Self>) -> Self {
        let (sum, count) = values.fold((0i64, 0i64), |(sum, count), v| (sum + v, count + 1));
        sum / count
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

/// Validated settings together with the ordered list of fields every leaf stores.
#[derive(Debug, Clone)]
pub struct MeshConfig<const D: usize> {
    settings: MeshSettings,
    fields: Vec<FieldDescriptor<D>>,
}

impl<const D: usize> MeshConfig<D> {
    pub fn new(settings: MeshSettings) -> Result<Self, ConfigError> {
        settings.validate()?;

        Ok(Self {
            settings,
            fields: Vec::new(),
        })
    }

    fn push(mut self, name: String, kind: FieldKind<D>) -> Result<Self, ConfigError> {
        if self.field_index(&name).is_some() {
            return Err(ConfigError::DuplicateField(name));
        }

        self.fields.push(FieldDescriptor { name, kind });
        Ok(self)
    }

    /// Appends a floating point field.
    pub fn float_field(
        self,
        name: impl Into<String>,
        sampler: impl GridConfig<f64, D> + 'static,
    ) -> Result<Self, ConfigError> {
        self.push(name.into(), FieldKind::Float(Arc::new(sampler)))
    }

    /// Appends an integer field.
    pub fn int_field(
        self,
        name: impl Into<String>,
        sampler: impl GridConfig<i64, D> + 'static,
    ) -> Result<Self, ConfigError> {
        self.push(name.into(), FieldKind::Int(Arc::new(sampler)))
    }

    pub fn settings(&self) -> &MeshSettings {
        &self.settings
    }

    pub fn fields(&self) -> &[FieldDescriptor<D>] {
        &self.fields
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    pub fn block_size(&self) -> usize {
        self.settings.block_size
    }

    pub fn ghost(&self) -> usize {
        self.settings.ghost
    }

    /// Extents of every field buffer, interior plus halo on both sides.
    pub fn block_extents(&self) -> [usize; D] {
        [self.settings.block_size + 2 * self.settings.ghost; D]
    }

    /// Allocates zeroed storage for every field.
    pub fn create_buffers(&self) -> Result<Vec<FieldBuffer<D>>, BufferError> {
        let extents = self.block_extents();

        self.fields
            .iter()
            .map(|field| -> Result<FieldBuffer<D>, BufferError> {
                Ok(match field.kind {
                    FieldKind::Float(_) => FieldBuffer::Float(Buffer::new(extents)?),
                    FieldKind::Int(_) => FieldBuffer::Int(Buffer::new(extents)?),
                })
            })
            .collect()
    }

    pub fn create_block(&self) -> Result<Block<D>, BufferError> {
        Ok(Block::new(
            self.create_buffers()?,
            self.settings.block_size,
            self.settings.ghost,
        ))
    }
}
