//! Geometric primitives shared by `treeamr` (child splits, faces, cartesian index spaces and
//! axis aligned rectangles).

#![allow(clippy::needless_range_loop)]

mod face;
mod index;
mod rectangle;
mod split;

pub use face::{Face, FaceArray, FaceIter, faces};
pub use index::{CartesianIter, IndexSpace, IndexWindow};
pub use rectangle::Rectangle;
pub use split::{Split, SplitIter};
