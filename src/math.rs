
//! Simple math utilities.

use std::fmt::Debug;
use std::ops::{Add, Mul};

/// Simple two-dimensional vector of any numerical type.
/// Supports only few mathematical operations
/// as this is used mainly as data struct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Vec2<T>(pub T, pub T);

impl<T> Vec2<T> {

    /// The first component of this 2D vector.
    #[inline]
    pub fn x(self) -> T where T: Copy { self.0 }

    /// The second component of this 2D vector.
    #[inline]
    pub fn y(self) -> T where T: Copy { self.1 }

    /// The first component of this 2D vector.
    #[inline]
    pub fn width(self) -> T where T: Copy { self.0 }

    /// The second component of this 2D vector.
    #[inline]
    pub fn height(self) -> T where T: Copy { self.1 }

    /// Seeing this vector as a dimension or size (width and height),
    /// this returns the area that this dimensions contains (`width * height`).
    #[inline]
    pub fn area(self) -> T where T: Copy + Mul<T, Output = T> {
        self.0 * self.1
    }

    /// Convert this two-dimensional coordinate to an index suited for
    /// one-dimensional flattened arrays that store rows one after another.
    /// In debug mode, panics for an index out of bounds.
    #[inline]
    pub fn flat_index_for_size(self, resolution: Vec2<T>) -> T
        where T: Copy + Debug + Ord + Mul<Output = T> + Add<Output = T>
    {
        debug_assert!(
            self.x() < resolution.width() && self.y() < resolution.height(),
            "Vec2 index {:?} is invalid for resolution {:?}", self, resolution
        );

        let Vec2(x, y) = self;
        y * resolution.width() + x
    }
}

/// Integer division, rounded up instead of down.
#[inline]
pub fn ceil_div(dividend: usize, divisor: usize) -> usize {
    debug_assert_ne!(divisor, 0, "division by zero");
    (dividend + divisor - 1) / divisor
}

/// Number of bits required to represent `value`: zero for zero,
/// otherwise `floor(log2(value)) + 1`.
#[inline]
pub fn bit_length(value: usize) -> usize {
    (usize::leading_zeros(0) - value.leading_zeros()) as usize
}

/// Smallest `n` such that `2^n >= value`. Zero for values below two.
#[inline]
pub fn ceil_log2(value: usize) -> usize {
    if value <= 1 { 0 }
    else { bit_length(value - 1) }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rounding(){
        assert_eq!(ceil_div(0, 8), 0);
        assert_eq!(ceil_div(1, 8), 1);
        assert_eq!(ceil_div(8, 8), 1);
        assert_eq!(ceil_div(9, 8), 2);
    }

    #[test]
    fn logarithms(){
        assert_eq!(bit_length(0), 0);
        assert_eq!(bit_length(1), 1);
        assert_eq!(bit_length(2), 2);
        assert_eq!(bit_length(255), 8);
        assert_eq!(bit_length(256), 9);

        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(4096), 12);
    }
}
