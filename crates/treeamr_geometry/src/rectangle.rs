use std::array::from_fn;

use crate::Split;

/// Represents a rectangular physical domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rectangle<const N: usize> {
    /// Size of the rectangle along each axis.
    pub size: [f64; N],
    /// Origin of the rectangle (located at the bottom-left corner).
    pub origin: [f64; N],
}

impl<const N: usize> Rectangle<N> {
    /// Unit rectangle.
    pub const UNIT: Self = Rectangle {
        size: [1.0; N],
        origin: [0.0; N],
    };

    /// Computes the center of the rectangle.
    pub fn center(&self) -> [f64; N] {
        from_fn(|i| self.origin[i] + self.size[i] / 2.0)
    }

    /// Returns the subdivision of the rectangle along every axis indicated by `split`.
    pub fn split(&self, split: Split<N>) -> Self {
        let size = from_fn(|i| self.size[i] / 2.0);
        let origin = from_fn(|i| {
            if split.is_set(i) {
                self.origin[i] + size[i]
            } else {
                self.origin[i]
            }
        });

        Self { size, origin }
    }

    /// Checks if the point lies within the rectangle (bounds inclusive).
    pub fn contains(&self, point: [f64; N]) -> bool {
        (0..N).all(|i| point[i] >= self.origin[i] && point[i] <= self.origin[i] + self.size[i])
    }

    /// Checks whether two rectangles overlap (touching edges count as overlap).
    pub fn intersects(&self, other: &Self) -> bool {
        (0..N).all(|i| {
            self.origin[i] <= other.origin[i] + other.size[i]
                && other.origin[i] <= self.origin[i] + self.size[i]
        })
    }

    /// Split of the child of this rectangle containing `point`.
    pub fn split_containing(&self, point: [f64; N]) -> Split<N> {
        let center = self.center();
        Split::pack(from_fn(|axis| point[axis] > center[axis]))
    }

    pub fn volume(&self) -> f64 {
        self.size.iter().product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdivision() {
        let rect = Rectangle::<2> {
            size: [2.0, 4.0],
            origin: [-1.0, 0.0],
        };

        let child = rect.split(Split::pack([true, false]));
        assert_eq!(child.size, [1.0, 2.0]);
        assert_eq!(child.origin, [0.0, 0.0]);

        assert_eq!(rect.split_containing([0.5, 0.5]), Split::pack([true, false]));
        assert_eq!(rect.split_containing([0.0, 2.0]), Split::empty());
        assert!(rect.contains([1.0, 4.0]));
        assert!(!rect.contains([1.5, 1.0]));
        assert_eq!(rect.volume(), 8.0);
        assert!(rect.intersects(&child));
    }
}
