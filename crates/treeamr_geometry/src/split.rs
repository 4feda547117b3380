use crate::Face;

/// Identifies one of the `2^N` children of a subdivided node. Bit `axis` is set if
/// the child lies on the positive half of that axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Split<const N: usize>(usize);

impl<const N: usize> Split<N> {
    /// Number of children produced by subdividing every axis once.
    pub const COUNT: usize = 2usize.pow(N as u32);

    /// Iterates all splits in linear order.
    pub const fn enumerate() -> SplitIter<N> {
        SplitIter { cursor: 0 }
    }

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn from_linear(linear: usize) -> Self {
        debug_assert!(linear < Self::COUNT);
        Self(linear)
    }

    pub fn to_linear(self) -> usize {
        self.0
    }

    pub fn pack(bits: [bool; N]) -> Self {
        let mut result = Self::empty();

        for (axis, bit) in bits.into_iter().enumerate() {
            result.set_to(axis, bit);
        }

        result
    }

    /// Recovers the split of a child from its global index (the parity of each coordinate).
    pub fn from_index(index: [usize; N]) -> Self {
        Self::pack(std::array::from_fn(|axis| index[axis] % 2 == 1))
    }

    pub fn set_to(&mut self, axis: usize, value: bool) {
        self.0 &= !(1 << axis);
        self.0 |= (value as usize) << axis;
    }

    pub fn toggled(mut self, axis: usize) -> Self {
        self.0 ^= 1 << axis;
        self
    }

    pub fn is_set(self, axis: usize) -> bool {
        (self.0 & (1 << axis)) != 0
    }

    /// Offset of this child in units of child blocks (0 or 1 along each axis).
    pub fn offset(self) -> [usize; N] {
        std::array::from_fn(|axis| self.is_set(axis) as usize)
    }

    /// True if crossing `face` leads to a sibling within the same parent.
    pub fn is_inner_face(self, face: Face<N>) -> bool {
        self.is_set(face.axis) != face.side
    }

    /// True if `face` lies on the boundary of the parent.
    pub fn is_outer_face(self, face: Face<N>) -> bool {
        self.is_set(face.axis) == face.side
    }
}

#[derive(Debug, Clone)]
pub struct SplitIter<const N: usize> {
    cursor: usize,
}

impl<const N: usize> Iterator for SplitIter<N> {
    type Item = Split<N>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= Split::<N>::COUNT {
            return None;
        }

        let result = self.cursor;
        self.cursor += 1;
        Some(Split(result))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = Split::<N>::COUNT - self.cursor;
        (remaining, Some(remaining))
    }
}

impl<const N: usize> ExactSizeIterator for SplitIter<N> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration() {
        assert_eq!(Split::<3>::COUNT, 8);
        assert_eq!(Split::<3>::enumerate().len(), 8);

        let splits = Split::<2>::enumerate().collect::<Vec<_>>();
        assert_eq!(splits[1].offset(), [1, 0]);
        assert!(splits[2].is_set(1) && !splits[2].is_set(0));
        assert_eq!(Split::<2>::pack([true, true]).to_linear(), 3);
    }

    #[test]
    fn faces_of_children() {
        let split = Split::<2>::pack([true, false]);

        assert!(split.is_inner_face(Face::negative(0)));
        assert!(split.is_outer_face(Face::positive(0)));
        assert!(split.is_inner_face(Face::positive(1)));
        assert!(split.is_outer_face(Face::negative(1)));

        assert_eq!(Split::<2>::from_index([5, 2]), split);
        assert_eq!(split.toggled(0), Split::empty());
    }
}
