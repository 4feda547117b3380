//! Sampling kernels used to move field data between refinement levels.

use std::fmt::Debug;

use treeamr_geometry::{IndexSpace, Split};

use crate::buffer::{Buffer, Getter, GetterMut};
use crate::config::Value;

/// Per field policy for transferring data between a coarse cell and the `2^D` fine cells
/// covering it.
pub trait GridConfig<T, const D: usize>: Debug + Send + Sync {
    /// Prolongation. `src` is bound to a coarse cell, `dst` to the first of the fine cells it
    /// covers. Every fine cell (offsets in `{0, 1}^D`) must be written.
    fn upsample(&self, src: &Getter<'_, T, D>, dst: &mut GetterMut<'_, T, D>);

    /// Restriction. `src` is bound to the first of `2^D` fine cells, `dst` to the coarse cell.
    fn downsample(&self, src: &Getter<'_, T, D>, dst: &mut GetterMut<'_, T, D>);
}

/// Offset of a child cell within its `2^D` patch.
fn patch_offset<const D: usize>(split: Split<D>) -> [isize; D] {
    split.offset().map(|o| o as isize)
}

/// Injection upsample and arithmetic mean downsample. Integer means truncate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Conservative;

impl<T: Value, const D: usize> GridConfig<T, D> for Conservative {
    fn upsample(&self, src: &Getter<'_, T, D>, dst: &mut GetterMut<'_, T, D>) {
        let value = *src.get([0; D]);
        for split in Split::<D>::enumerate() {
            dst.set(patch_offset(split), value);
        }
    }

    fn downsample(&self, src: &Getter<'_, T, D>, dst: &mut GetterMut<'_, T, D>) {
        let value = T::mean(Split::<D>::enumerate().map(|split| *src.get(patch_offset(split))));
        dst.set([0; D], value);
    }
}

/// Injection upsample and first cell downsample.
#[derive(Debug, Clone, Copy, Default)]
pub struct Nearest;

impl<T: Value, const D: usize> GridConfig<T, D> for Nearest {
    fn upsample(&self, src: &Getter<'_, T, D>, dst: &mut GetterMut<'_, T, D>) {
        let value = *src.get([0; D]);
        for split in Split::<D>::enumerate() {
            dst.set(patch_offset(split), value);
        }
    }

    fn downsample(&self, src: &Getter<'_, T, D>, dst: &mut GetterMut<'_, T, D>) {
        dst.set([0; D], *src.get([0; D]));
    }
}

/// Piecewise linear reconstruction limited with minmod. Reads the face neighbors of the
/// coarse cell, so the source must have at least one layer of valid cells around it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearConservative;

fn minmod(a: f64, b: f64) -> f64 {
    if a * b <= 0.0 {
        0.0
    } else if a.abs() < b.abs() {
        a
    } else {
        b
    }
}

impl<const D: usize> GridConfig<f64, D> for LinearConservative {
    fn upsample(&self, src: &Getter<'_, f64, D>, dst: &mut GetterMut<'_, f64, D>) {
        let center = *src.get([0; D]);

        let slopes: [f64; D] = std::array::from_fn(|axis| {
            let mut offset = [0; D];
            offset[axis] = 1;
            let right = *src.get(offset);
            offset[axis] = -1;
            let left = *src.get(offset);

            minmod(right - center, center - left)
        });

        for split in Split::<D>::enumerate() {
            let mut value = center;
            for axis in 0..D {
                // Fine cell centers sit a quarter of a coarse width from the coarse center.
                let sign = if split.is_set(axis) { 0.25 } else { -0.25 };
                value += sign * slopes[axis];
            }
            dst.set(patch_offset(split), value);
        }
    }

    fn downsample(&self, src: &Getter<'_, f64, D>, dst: &mut GetterMut<'_, f64, D>) {
        Conservative.downsample(src, dst)
    }
}

/// Fills the interior of `child` by prolonging the quadrant of `parent` selected by `split`.
pub(crate) fn upsample_child<T, const D: usize>(
    sampler: &dyn GridConfig<T, D>,
    parent: &Buffer<T, D>,
    child: &mut Buffer<T, D>,
    split: Split<D>,
    width: usize,
    ghost: usize,
) {
    let half = width / 2;
    let offset = split.offset();

    for cell in IndexSpace::new([half; D]).iter() {
        let src = std::array::from_fn(|axis| ghost + offset[axis] * half + cell[axis]);
        let dst = std::array::from_fn(|axis| ghost + 2 * cell[axis]);

        sampler.upsample(&parent.getter(src), &mut child.getter_mut(dst));
    }
}

/// Restricts the interior of `child` into the quadrant of `parent` selected by `split`.
pub(crate) fn downsample_child<T, const D: usize>(
    sampler: &dyn GridConfig<T, D>,
    child: &Buffer<T, D>,
    parent: &mut Buffer<T, D>,
    split: Split<D>,
    width: usize,
    ghost: usize,
) {
    let half = width / 2;
    let offset = split.offset();

    for cell in IndexSpace::new([half; D]).iter() {
        let src = std::array::from_fn(|axis| ghost + 2 * cell[axis]);
        let dst = std::array::from_fn(|axis| ghost + offset[axis] * half + cell[axis]);

        sampler.downsample(&child.getter(src), &mut parent.getter_mut(dst));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conservative_mean() {
        let fine = [1.0, 2.0, 3.0, 6.0];
        let mut coarse = [0.0];
        Conservative.downsample(
            &Getter::from_slice(&fine, [2, 2], [0, 0]),
            &mut GetterMut::from_slice(&mut coarse, [1, 1], [0, 0]),
        );
        assert_eq!(coarse[0], 3.0);

        let fine = [1i64, 2, 2, 2];
        let mut coarse = [0i64];
        Conservative.downsample(
            &Getter::from_slice(&fine, [2, 2], [0, 0]),
            &mut GetterMut::from_slice(&mut coarse, [1, 1], [0, 0]),
        );
        assert_eq!(coarse[0], 1);

        let mut fine = [0i64; 4];
        Conservative.upsample(
            &Getter::from_slice(&[7i64], [1, 1], [0, 0]),
            &mut GetterMut::from_slice(&mut fine, [2, 2], [0, 0]),
        );
        assert_eq!(fine, [7; 4]);
    }

    #[test]
    fn nearest_picks_first() {
        let fine = [4.0, 1.0, 1.0, 1.0];
        let mut coarse = [0.0];
        Nearest.downsample(
            &Getter::from_slice(&fine, [2, 2], [0, 0]),
            &mut GetterMut::from_slice(&mut coarse, [1, 1], [0, 0]),
        );
        assert_eq!(coarse[0], 4.0);
    }

    #[test]
    fn linear_preserves_mean() {
        // A monotone ramp along axis 0, flat along axis 1.
        let mut coarse = [0.0; 9];
        for j in 0..3 {
            for i in 0..3 {
                coarse[i + 3 * j] = i as f64;
            }
        }

        let mut fine = [0.0; 4];
        LinearConservative.upsample(
            &Getter::from_slice(&coarse, [3, 3], [1, 1]),
            &mut GetterMut::from_slice(&mut fine, [2, 2], [0, 0]),
        );

        assert_eq!(fine, [0.75, 1.25, 0.75, 1.25]);
        assert_eq!(fine.iter().sum::<f64>() / 4.0, 1.0);

        // Extrema are not sharpened.
        coarse[4] = 5.0;
        LinearConservative.upsample(
            &Getter::from_slice(&coarse, [3, 3], [1, 1]),
            &mut GetterMut::from_slice(&mut fine, [2, 2], [0, 0]),
        );
        assert_eq!(fine, [5.0; 4]);
    }

    #[test]
    fn child_transfer_round_trip() -> eyre::Result<()> {
        let (width, ghost) = (4, 1);
        let mut parent = Buffer::<f64, 2>::new([6, 6])?;
        for index in parent.space().iter() {
            parent[index] = (index[0] * 10 + index[1]) as f64;
        }

        let mut restored = Buffer::<f64, 2>::new([6, 6])?;

        for split in Split::<2>::enumerate() {
            let mut child = Buffer::<f64, 2>::new([6, 6])?;
            upsample_child(&Conservative, &parent, &mut child, split, width, ghost);
            downsample_child(&Conservative, &child, &mut restored, split, width, ghost);
        }

        for i in ghost..ghost + width {
            for j in ghost..ghost + width {
                assert_eq!(restored[[i, j]], parent[[i, j]]);
            }
        }

        Ok(())
    }
}
