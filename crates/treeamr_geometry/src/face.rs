use std::ops::{Index, IndexMut};

/// A face of a rectangular prism in `N` dimensional space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Face<const N: usize> {
    pub axis: usize,
    /// `false` for the negative side of the axis, `true` for the positive side.
    pub side: bool,
}

impl<const N: usize> Face<N> {
    /// Face on negative side of axis.
    pub fn negative(axis: usize) -> Self {
        assert!(axis < N);
        Self { axis, side: false }
    }

    /// Face on positive side of axis.
    pub fn positive(axis: usize) -> Self {
        assert!(axis < N);
        Self { axis, side: true }
    }

    pub fn reversed(self) -> Self {
        Self {
            axis: self.axis,
            side: !self.side,
        }
    }

    /// Unit step across this face.
    pub fn sign(self) -> isize {
        if self.side { 1 } else { -1 }
    }
}

/// Iterator over all faces in a given number of dimensions.
#[derive(Debug, Clone)]
pub struct FaceIter<const N: usize> {
    axis: usize,
    side: bool,
}

impl<const N: usize> Iterator for FaceIter<N> {
    type Item = Face<N>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.axis >= N {
            return None;
        }

        let result = Face {
            axis: self.axis,
            side: self.side,
        };

        self.axis += self.side as usize;
        self.side = !self.side;

        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = 2 * (N - self.axis) - self.side as usize;
        (remaining, Some(remaining))
    }
}

impl<const N: usize> ExactSizeIterator for FaceIter<N> {}

/// Iterates over all faces in a given number of dimensions.
pub fn faces<const N: usize>() -> FaceIter<N> {
    FaceIter {
        axis: 0,
        side: false,
    }
}

/// Stores one value per face.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaceArray<const N: usize, T>([[T; 2]; N]);

impl<const N: usize, T> FaceArray<N, T> {
    pub fn from_fn<F: FnMut(Face<N>) -> T>(mut f: F) -> Self {
        Self(std::array::from_fn(|axis| {
            [f(Face::negative(axis)), f(Face::positive(axis))]
        }))
    }
}

impl<const N: usize, T: Default> Default for FaceArray<N, T> {
    fn default() -> Self {
        Self::from_fn(|_| T::default())
    }
}

impl<const N: usize, T> Index<Face<N>> for FaceArray<N, T> {
    type Output = T;

    fn index(&self, face: Face<N>) -> &Self::Output {
        &self.0[face.axis][face.side as usize]
    }
}

impl<const N: usize, T> IndexMut<Face<N>> for FaceArray<N, T> {
    fn index_mut(&mut self, face: Face<N>) -> &mut Self::Output {
        &mut self.0[face.axis][face.side as usize]
    }
}
