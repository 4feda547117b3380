/// A dense box of cartesian indices `[0, size)`. Linear order has axis 0 varying fastest,
/// matching the layout of block storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpace<const N: usize> {
    size: [usize; N],
}

impl<const N: usize> IndexSpace<N> {
    pub const fn new(size: [usize; N]) -> Self {
        Self { size }
    }

    pub fn size(self) -> [usize; N] {
        self.size
    }

    /// Number of cells in the box.
    pub fn len(self) -> usize {
        self.size.iter().product()
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub fn linear_from_cartesian(self, cartesian: [usize; N]) -> usize {
        debug_assert!((0..N).all(|axis| cartesian[axis] < self.size[axis]));

        cartesian
            .iter()
            .zip(self.size)
            .rev()
            .fold(0, |acc, (&coord, extent)| acc * extent + coord)
    }

    /// Visits every index in linear order.
    pub fn iter(self) -> CartesianIter<N> {
        CartesianIter {
            size: self.size,
            linear: 0,
            len: self.len(),
        }
    }
}

impl<const N: usize> IntoIterator for IndexSpace<N> {
    type IntoIter = CartesianIter<N>;
    type Item = [usize; N];

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A box of indices offset from the origin of some larger space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexWindow<const N: usize> {
    /// Lowest index covered by the window.
    pub origin: [usize; N],
    pub size: [usize; N],
}

impl<const N: usize> IndexWindow<N> {
    pub fn new(origin: [usize; N], size: [usize; N]) -> Self {
        Self { origin, size }
    }

    pub fn contains(&self, index: [usize; N]) -> bool {
        (0..N).all(|axis| {
            index[axis]
                .checked_sub(self.origin[axis])
                .is_some_and(|offset| offset < self.size[axis])
        })
    }
}

/// Iterator over the indices of an [`IndexSpace`].
#[derive(Debug, Clone)]
pub struct CartesianIter<const N: usize> {
    size: [usize; N],
    linear: usize,
    len: usize,
}

impl<const N: usize> Iterator for CartesianIter<N> {
    type Item = [usize; N];

    fn next(&mut self) -> Option<Self::Item> {
        if self.linear >= self.len {
            return None;
        }

        let mut rest = self.linear;
        let mut result = [0; N];
        for axis in 0..N {
            result[axis] = rest % self.size[axis];
            rest /= self.size[axis];
        }

        self.linear += 1;
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len - self.linear.min(self.len);
        (remaining, Some(remaining))
    }
}

impl<const N: usize> ExactSizeIterator for CartesianIter<N> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_zero_varies_fastest() {
        let cells = IndexSpace::new([3, 2]).iter().collect::<Vec<_>>();
        assert_eq!(
            cells,
            vec![[0, 0], [1, 0], [2, 0], [0, 1], [1, 1], [2, 1]]
        );

        assert_eq!(IndexSpace::new([0, 10]).iter().next(), None);
        assert!(IndexSpace::new([4, 0, 2]).is_empty());
        assert_eq!(IndexSpace::new([2, 3, 4]).iter().len(), 24);
    }

    #[test]
    fn linear_order_matches_iteration() {
        let space = IndexSpace::new([2, 4, 3]);
        assert_eq!(space.linear_from_cartesian([1, 0, 0]), 1);
        assert_eq!(space.linear_from_cartesian([0, 1, 0]), 2);
        assert_eq!(space.linear_from_cartesian([1, 1, 2]), 16 + 2 + 1);

        for (linear, index) in space.iter().enumerate() {
            assert_eq!(space.linear_from_cartesian(index), linear);
        }
    }

    #[test]
    fn window_containment() {
        let window = IndexWindow::new([2, 3], [2, 1]);
        assert!(window.contains([2, 3]));
        assert!(window.contains([3, 3]));
        assert!(!window.contains([1, 3]));
        assert!(!window.contains([4, 3]));
        assert!(!window.contains([2, 4]));
    }
}
