//! Adaptive hierarchical block trees.
//!
//! A [`Mesh`](mesh::Mesh) is a regular array of trees whose leaves each own a fixed size block
//! of cells for every configured field. Leaves are refined and coarsened on request while the
//! mesh is kept graded, halos are exchanged between neighbors on any level, and user kernels
//! run on every leaf through a [`DataView`](mesh::DataView). The same node machinery backs the
//! point bucket tree in [`bucket`].

#![allow(clippy::needless_range_loop)]
#![allow(clippy::too_many_arguments)]

pub mod block;
pub mod bucket;
pub mod buffer;
pub mod config;
pub mod grid;
pub mod mesh;
pub mod tree;

pub use treeamr_geometry as geometry;

/// Provides common types used for most `treeamr` applications.
pub mod prelude {
    pub use crate::block::Block;
    pub use crate::bucket::{BucketError, BucketSettings, BucketTree, Positioned};
    pub use crate::buffer::{Array, ArrayMut, Buffer, BufferError, Getter, GetterMut};
    pub use crate::config::{
        BoundaryPolicy, ConfigError, FieldType, MeshConfig, MeshSettings, Value,
    };
    pub use crate::grid::{Conservative, GridConfig, LinearConservative, Nearest};
    pub use crate::mesh::{DataView, Mesh, MeshError, RestructureReport};
    pub use crate::tree::{Action, NodeId, TreeError};
    pub use treeamr_geometry::{Face, IndexSpace, Rectangle, Split, faces};
}
