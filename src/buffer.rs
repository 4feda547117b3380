//! Dense D-dimensional storage and the views used to address it.
//!
//! A [`Buffer`] owns a flat allocation laid out with axis 0 varying fastest. [`Array`] and
//! [`ArrayMut`] are checked windows into a buffer, while [`Getter`] and [`GetterMut`] bind a
//! base cell and accept signed offsets, which is the form sampling kernels and stencils use.

use std::array;
use std::ops::{Index, IndexMut};

use datasize::DataSize;
use thiserror::Error;
use treeamr_geometry::{CartesianIter, IndexSpace};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffers need at least one dimension")]
    ZeroDimensions,
    #[error("buffer extent along axis {axis} is zero")]
    ZeroExtent { axis: usize },
    #[error("window exceeds buffer extents along axis {axis}")]
    OutOfBounds { axis: usize },
}

/// Computes cumulative strides, `stride[i] = size[0] * ... * size[i]`.
pub fn strides<const D: usize>(size: [usize; D]) -> [usize; D] {
    let mut result = [0; D];
    let mut acc = 1;

    for axis in 0..D {
        acc *= size[axis];
        result[axis] = acc;
    }

    result
}

/// Flattens a cartesian coordinate given cumulative strides.
fn flatten<const D: usize>(stride: &[usize; D], coords: [usize; D]) -> usize {
    let mut result = 0;

    for axis in 0..D {
        if axis == 0 {
            result += coords[0];
        } else {
            result += coords[axis] * stride[axis - 1];
        }
    }

    result
}

/// Owned storage for a D-dimensional grid of values.
#[derive(Debug, PartialEq)]
pub struct Buffer<T, const D: usize> {
    size: [usize; D],
    stride: [usize; D],
    data: Box<[T]>,
}

impl<T: Default + Clone, const D: usize> Buffer<T, D> {
    /// Allocates a buffer filled with `T::default()`.
    pub fn new(size: [usize; D]) -> Result<Self, BufferError> {
        Self::filled(size, T::default())
    }
}

impl<T: Clone, const D: usize> Buffer<T, D> {
    /// Allocates a buffer with every element set to `value`.
    pub fn filled(size: [usize; D], value: T) -> Result<Self, BufferError> {
        if D == 0 {
            return Err(BufferError::ZeroDimensions);
        }

        if let Some(axis) = size.iter().position(|&extent| extent == 0) {
            return Err(BufferError::ZeroExtent { axis });
        }

        let stride = strides(size);
        let len = size.iter().product();

        Ok(Self {
            size,
            stride,
            data: vec![value; len].into_boxed_slice(),
        })
    }

    /// Sets every element (ghosts included) to `value`.
    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }
}

impl<T, const D: usize> Buffer<T, D> {
    pub fn size(&self) -> [usize; D] {
        self.size
    }

    pub fn strides(&self) -> [usize; D] {
        self.stride
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The underlying storage in linear order.
    pub fn linear(&self) -> &[T] {
        &self.data
    }

    pub fn linear_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn space(&self) -> IndexSpace<D> {
        IndexSpace::new(self.size)
    }

    fn contains(&self, coords: [usize; D]) -> bool {
        (0..D).all(|axis| coords[axis] < self.size[axis])
    }

    pub fn get(&self, coords: [usize; D]) -> Option<&T> {
        if !self.contains(coords) {
            return None;
        }
        Some(&self.data[flatten(&self.stride, coords)])
    }

    pub fn get_mut(&mut self, coords: [usize; D]) -> Option<&mut T> {
        if !self.contains(coords) {
            return None;
        }
        Some(&mut self.data[flatten(&self.stride, coords)])
    }

    /// A view spanning the entire buffer.
    pub fn array(&self) -> Array<'_, T, D> {
        Array {
            buffer: self,
            position: [0; D],
            size: self.size,
        }
    }

    pub fn array_mut(&mut self) -> ArrayMut<'_, T, D> {
        let size = self.size;
        ArrayMut {
            buffer: self,
            position: [0; D],
            size,
        }
    }

    fn check_window(&self, position: [usize; D], size: [usize; D]) -> Result<(), BufferError> {
        for axis in 0..D {
            if position[axis] + size[axis] > self.size[axis] {
                return Err(BufferError::OutOfBounds { axis });
            }
        }
        Ok(())
    }

    /// A view of the sub-region starting at `position` with extents `size`.
    pub fn window(
        &self,
        position: [usize; D],
        size: [usize; D],
    ) -> Result<Array<'_, T, D>, BufferError> {
        self.check_window(position, size)?;
        Ok(Array {
            buffer: self,
            position,
            size,
        })
    }

    pub fn window_mut(
        &mut self,
        position: [usize; D],
        size: [usize; D],
    ) -> Result<ArrayMut<'_, T, D>, BufferError> {
        self.check_window(position, size)?;
        Ok(ArrayMut {
            buffer: self,
            position,
            size,
        })
    }

    /// Binds a getter to the cell at `base`.
    pub fn getter(&self, base: [usize; D]) -> Getter<'_, T, D> {
        Getter {
            data: &self.data,
            size: self.size,
            stride: self.stride,
            base,
        }
    }

    pub fn getter_mut(&mut self, base: [usize; D]) -> GetterMut<'_, T, D> {
        GetterMut {
            data: &mut self.data,
            size: self.size,
            stride: self.stride,
            base,
        }
    }
}

impl<T, const D: usize> Index<[usize; D]> for Buffer<T, D> {
    type Output = T;

    fn index(&self, coords: [usize; D]) -> &T {
        debug_assert!(self.contains(coords));
        &self.data[flatten(&self.stride, coords)]
    }
}

impl<T, const D: usize> IndexMut<[usize; D]> for Buffer<T, D> {
    fn index_mut(&mut self, coords: [usize; D]) -> &mut T {
        debug_assert!(self.contains(coords));
        &mut self.data[flatten(&self.stride, coords)]
    }
}

impl<T: DataSize, const D: usize> DataSize for Buffer<T, D> {
    const IS_DYNAMIC: bool = true;
    const STATIC_HEAP_SIZE: usize = 0;

    fn estimate_heap_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<T>()
    }
}

/// Shared view of a rectangular sub-region of a buffer.
#[derive(Debug)]
pub struct Array<'a, T, const D: usize> {
    buffer: &'a Buffer<T, D>,
    position: [usize; D],
    size: [usize; D],
}

impl<T, const D: usize> Clone for Array<'_, T, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, const D: usize> Copy for Array<'_, T, D> {}

impl<'a, T, const D: usize> Array<'a, T, D> {
    pub fn size(&self) -> [usize; D] {
        self.size
    }

    pub fn position(&self) -> [usize; D] {
        self.position
    }

    fn absolute(&self, offset: [usize; D]) -> [usize; D] {
        array::from_fn(|axis| self.position[axis] + offset[axis])
    }

    pub fn get(&self, offset: [usize; D]) -> Option<&'a T> {
        if (0..D).any(|axis| offset[axis] >= self.size[axis]) {
            return None;
        }
        self.buffer.get(self.absolute(offset))
    }

    /// Relative coordinates of every cell in the view.
    pub fn indices(&self) -> CartesianIter<D> {
        IndexSpace::new(self.size).iter()
    }

    /// Iterates the values of the view in linear order.
    pub fn values(&self) -> impl Iterator<Item = &'a T> + 'a {
        let buffer = self.buffer;
        let position = self.position;
        IndexSpace::new(self.size)
            .iter()
            .map(move |offset| &buffer[array::from_fn(|axis| position[axis] + offset[axis])])
    }

    /// Binds a getter to the cell at `offset` relative to the view's origin.
    pub fn getter(&self, offset: [usize; D]) -> Getter<'a, T, D> {
        self.buffer.getter(self.absolute(offset))
    }
}

impl<T, const D: usize> Index<[usize; D]> for Array<'_, T, D> {
    type Output = T;

    fn index(&self, offset: [usize; D]) -> &T {
        debug_assert!((0..D).all(|axis| offset[axis] < self.size[axis]));
        &self.buffer[self.absolute(offset)]
    }
}

/// Mutable view of a rectangular sub-region of a buffer.
#[derive(Debug)]
pub struct ArrayMut<'a, T, const D: usize> {
    buffer: &'a mut Buffer<T, D>,
    position: [usize; D],
    size: [usize; D],
}

impl<T, const D: usize> ArrayMut<'_, T, D> {
    pub fn size(&self) -> [usize; D] {
        self.size
    }

    pub fn position(&self) -> [usize; D] {
        self.position
    }

    fn absolute(&self, offset: [usize; D]) -> [usize; D] {
        array::from_fn(|axis| self.position[axis] + offset[axis])
    }

    /// Shortens the lifetime of this view so it can be passed on without being consumed.
    pub fn reborrow(&mut self) -> ArrayMut<'_, T, D> {
        ArrayMut {
            buffer: &mut *self.buffer,
            position: self.position,
            size: self.size,
        }
    }

    pub fn as_array(&self) -> Array<'_, T, D> {
        Array {
            buffer: &*self.buffer,
            position: self.position,
            size: self.size,
        }
    }

    pub fn get_mut(&mut self, offset: [usize; D]) -> Option<&mut T> {
        if (0..D).any(|axis| offset[axis] >= self.size[axis]) {
            return None;
        }
        let coords = self.absolute(offset);
        self.buffer.get_mut(coords)
    }

    pub fn indices(&self) -> CartesianIter<D> {
        IndexSpace::new(self.size).iter()
    }

    pub fn getter_mut(&mut self, offset: [usize; D]) -> GetterMut<'_, T, D> {
        let coords = self.absolute(offset);
        self.buffer.getter_mut(coords)
    }
}

impl<T: Clone, const D: usize> ArrayMut<'_, T, D> {
    /// Sets every cell of the window to `value`.
    pub fn fill(&mut self, value: T) {
        for offset in self.indices() {
            self[offset] = value.clone();
        }
    }
}

impl<T, const D: usize> Index<[usize; D]> for ArrayMut<'_, T, D> {
    type Output = T;

    fn index(&self, offset: [usize; D]) -> &T {
        debug_assert!((0..D).all(|axis| offset[axis] < self.size[axis]));
        &self.buffer[self.absolute(offset)]
    }
}

impl<T, const D: usize> IndexMut<[usize; D]> for ArrayMut<'_, T, D> {
    fn index_mut(&mut self, offset: [usize; D]) -> &mut T {
        debug_assert!((0..D).all(|axis| offset[axis] < self.size[axis]));
        let coords = self.absolute(offset);
        &mut self.buffer[coords]
    }
}

fn shift<const D: usize>(size: &[usize; D], base: [usize; D], offset: [isize; D]) -> [usize; D] {
    array::from_fn(|axis| {
        let coord = base[axis] as isize + offset[axis];
        debug_assert!(
            coord >= 0 && (coord as usize) < size[axis],
            "offset {offset:?} from {base:?} leaves extents {size:?}"
        );
        coord as usize
    })
}

/// Read access relative to a base cell.
#[derive(Debug)]
pub struct Getter<'a, T, const D: usize> {
    data: &'a [T],
    size: [usize; D],
    stride: [usize; D],
    base: [usize; D],
}

impl<T, const D: usize> Clone for Getter<'_, T, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, const D: usize> Copy for Getter<'_, T, D> {}

impl<'a, T, const D: usize> Getter<'a, T, D> {
    /// Wraps a dense slice of extents `size`, for instance a scratch patch.
    pub fn from_slice(data: &'a [T], size: [usize; D], base: [usize; D]) -> Self {
        let stride = strides(size);
        debug_assert_eq!(data.len(), size.iter().product::<usize>());
        Self {
            data,
            size,
            stride,
            base,
        }
    }

    pub fn base(&self) -> [usize; D] {
        self.base
    }

    pub fn get(&self, offset: [isize; D]) -> &'a T {
        &self.data[flatten(&self.stride, shift(&self.size, self.base, offset))]
    }

    /// The same data bound to a different base cell.
    pub fn shifted(&self, offset: [isize; D]) -> Self {
        Self {
            base: shift(&self.size, self.base, offset),
            ..*self
        }
    }
}

/// Read and write access relative to a base cell.
#[derive(Debug)]
pub struct GetterMut<'a, T, const D: usize> {
    data: &'a mut [T],
    size: [usize; D],
    stride: [usize; D],
    base: [usize; D],
}

impl<'a, T, const D: usize> GetterMut<'a, T, D> {
    pub fn from_slice(data: &'a mut [T], size: [usize; D], base: [usize; D]) -> Self {
        let stride = strides(size);
        debug_assert_eq!(data.len(), size.iter().product::<usize>());
        Self {
            data,
            size,
            stride,
            base,
        }
    }

    pub fn base(&self) -> [usize; D] {
        self.base
    }

    pub fn get(&self, offset: [isize; D]) -> &T {
        &self.data[flatten(&self.stride, shift(&self.size, self.base, offset))]
    }

    pub fn get_mut(&mut self, offset: [isize; D]) -> &mut T {
        &mut self.data[flatten(&self.stride, shift(&self.size, self.base, offset))]
    }

    pub fn set(&mut self, offset: [isize; D], value: T) {
        *self.get_mut(offset) = value;
    }

    pub fn as_getter(&self) -> Getter<'_, T, D> {
        Getter {
            data: &*self.data,
            size: self.size,
            stride: self.stride,
            base: self.base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_law() -> eyre::Result<()> {
        let buffer = Buffer::<f64, 4>::new([4, 5, 6, 7])?;
        assert_eq!(buffer.strides(), [4, 20, 120, 840]);
        assert_eq!(buffer.len(), 840);
        Ok(())
    }

    #[test]
    fn construction() {
        assert_eq!(
            Buffer::<f64, 2>::new([0, 5]),
            Err(BufferError::ZeroExtent { axis: 0 })
        );
        assert_eq!(
            Buffer::<i64, 4>::new([3, 0, 4, 6]),
            Err(BufferError::ZeroExtent { axis: 1 })
        );
        assert_eq!(Buffer::<f64, 0>::new([]), Err(BufferError::ZeroDimensions));
        assert!(Buffer::<f64, 5>::new([1, 1, 1, 1, 1]).is_ok());
        assert!(Buffer::<f64, 5>::new([6, 2, 4, 3, 10]).is_ok());
    }

    #[test]
    fn indexing() -> eyre::Result<()> {
        let mut buffer = Buffer::<usize, 3>::new([2, 3, 4])?;
        for (linear, index) in buffer.space().iter().enumerate() {
            buffer[index] = linear;
        }

        assert_eq!(buffer[[1, 2, 3]], 1 + 2 * 2 + 3 * 6);
        assert_eq!(buffer.get([1, 2, 3]), Some(&23));
        assert_eq!(buffer.get([2, 0, 0]), None);
        assert_eq!(buffer.linear()[7], 7);

        *buffer.get_mut([0, 0, 1]).unwrap() = 100;
        assert_eq!(buffer[[0, 0, 1]], 100);
        Ok(())
    }

    #[test]
    fn windows() -> eyre::Result<()> {
        let mut buffer = Buffer::<i64, 2>::new([4, 4])?;
        assert_eq!(
            buffer.window([2, 1], [3, 1]).err(),
            Some(BufferError::OutOfBounds { axis: 0 })
        );

        let mut window = buffer.window_mut([1, 1], [2, 2])?;
        window.fill(3);
        window[[1, 0]] = 5;
        assert_eq!(window.get_mut([2, 0]), None);

        assert_eq!(buffer[[2, 1]], 5);
        assert_eq!(buffer[[0, 0]], 0);

        let inner = buffer.window([1, 1], [2, 2])?;
        assert_eq!(inner.values().copied().sum::<i64>(), 3 * 3 + 5);
        assert_eq!(inner[[0, 1]], 3);
        assert_eq!(inner.get([0, 2]), None);
        assert_eq!(buffer.array().values().count(), 16);
        Ok(())
    }

    #[test]
    fn getters() -> eyre::Result<()> {
        let mut buffer = Buffer::<f64, 2>::new([3, 3])?;
        {
            let mut getter = buffer.getter_mut([1, 1]);
            getter.set([-1, 0], 1.0);
            getter.set([0, 1], 2.0);
            *getter.get_mut([1, -1]) += 4.0;
            assert_eq!(*getter.as_getter().get([0, 1]), 2.0);
        }

        assert_eq!(buffer[[0, 1]], 1.0);
        assert_eq!(buffer[[1, 2]], 2.0);
        assert_eq!(buffer[[2, 0]], 4.0);

        let getter = buffer.getter([0, 0]).shifted([1, 1]);
        assert_eq!(getter.base(), [1, 1]);
        assert_eq!(*getter.get([0, 1]), 2.0);

        let scratch = [1.0, 2.0, 3.0, 4.0];
        let patch = Getter::from_slice(&scratch, [2, 2], [0, 0]);
        assert_eq!(*patch.get([1, 1]), 4.0);
        assert_eq!(*patch.get([0, 1]), 3.0);
        Ok(())
    }
}
