// Shape — dimension sizes of a tensor
//
// A quantized block keeps the Shape of the tensor it came from so that
// dequantization rebuilds the same layout after the group padding is
// stripped. The elementwise tensor ops broadcast trailing-aligned shapes,
// e.g. a [1, out] bias against a [batch, out] activation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Dimension sizes of a tensor, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of elements; 1 for a scalar, 0 if any dimension is 0.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major strides.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.rank()];
        for i in (1..self.rank()).rev() {
            strides[i - 1] = strides[i] * self.0[i];
        }
        strides
    }

    /// Shape both operands broadcast to, aligning trailing dimensions.
    pub fn broadcast(&self, other: &Shape) -> Result<Shape> {
        let rank = self.rank().max(other.rank());
        let padded = |s: &Shape, i: usize| {
            let lead = rank - s.rank();
            if i < lead { 1 } else { s.0[i - lead] }
        };
        let dims = (0..rank)
            .map(|i| match (padded(self, i), padded(other, i)) {
                (a, b) if a == b || b == 1 => Ok(a),
                (1, b) => Ok(b),
                _ => Err(Error::msg(format!("cannot broadcast {self} with {other}"))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Shape(dims))
    }

    /// Strides that read this shape as if it were `target`: broadcast
    /// dimensions get stride 0.
    pub fn strides_in(&self, target: &Shape) -> Vec<usize> {
        let own = self.strides();
        let lead = target.rank() - self.rank();
        let mut out = vec![0usize; target.rank()];
        for (i, (&d, &s)) in self.0.iter().zip(&own).enumerate() {
            if d == target.0[i + lead] {
                out[i + lead] = s;
            }
        }
        out
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_strides() {
        assert_eq!(Shape::from(()).elem_count(), 1);
        assert!(Shape::from(()).strides().is_empty());
        assert_eq!(Shape::from((2, 3, 4)).strides(), vec![12, 4, 1]);
        assert_eq!(Shape::from((0, 4)).elem_count(), 0);
    }

    #[test]
    fn test_bias_broadcast() {
        let act = Shape::from((3, 4));
        let bias = Shape::from((1, 4));
        assert_eq!(act.broadcast(&bias).unwrap(), act);
        assert_eq!(bias.strides_in(&act), vec![0, 1]);
        assert_eq!(Shape::from(4).strides_in(&act), vec![0, 1]);
        assert!(Shape::from(3).broadcast(&Shape::from(4)).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Shape::from((3, 4)).to_string(), "[3, 4]");
    }
}
