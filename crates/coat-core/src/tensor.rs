use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::shape::Shape;

// Tensor — dense n-dimensional array owned by the caller
//
// A Tensor is a handle: a stable identity (TensorId), a shape, a dtype and a
// shared storage buffer. Cloning a handle is O(1) and the clone observes every
// in-place write, which is how optimizer updates reach the layers that hold
// the same parameter.
//
// MEMORY MODEL:
//
//   Storage is an Arc<RwLock<Vec<f64>>>. Values are kept widened to f64 in
//   memory but are rounded to the tensor's dtype on every write, so an F32 or
//   BF16 tensor carries exactly the information its dtype can represent.
//
//   reshape() returns a view sharing the same storage; every other op
//   allocates a fresh contiguous buffer. All tensors are contiguous and
//   row-major.

/// Unique identifier for a tensor handle (and all its clones).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Generate a new unique id from a global atomic counter.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

struct TensorInner {
    id: TensorId,
    storage: Arc<RwLock<Vec<f64>>>,
    shape: Shape,
    dtype: DType,
}

/// A dense n-dimensional array of floating-point values.
///
/// # Example
/// ```ignore
/// use coat_core::{DType, Tensor};
///
/// let a = Tensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F32)?;
/// let b = Tensor::ones((2, 2), DType::F32)?;
/// let c = a.add(&b)?;
/// ```
pub struct Tensor {
    inner: Arc<TensorInner>,
}

impl Clone for Tensor {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={})",
            self.inner.id, self.inner.shape, self.inner.dtype,
        )
    }
}

impl Tensor {
    fn from_storage(storage: Arc<RwLock<Vec<f64>>>, shape: Shape, dtype: DType) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage,
                shape,
                dtype,
            }),
        }
    }

    /// Build a tensor from owned data, rounding each value to `dtype`.
    fn from_vec_rounded(mut data: Vec<f64>, shape: Shape, dtype: DType) -> Result<Self> {
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        if dtype != DType::F64 {
            for v in data.iter_mut() {
                *v = dtype.round(*v);
            }
        }
        Ok(Self::from_storage(Arc::new(RwLock::new(data)), shape, dtype))
    }

    // Accessors

    /// Unique tensor ID.
    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    /// The shape of this tensor.
    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    /// The dimensions as a slice.
    pub fn dims(&self) -> &[usize] {
        self.inner.shape.dims()
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.inner.shape.rank()
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.inner.shape.elem_count()
    }

    /// Data type of the elements.
    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// Bytes this tensor would occupy stored at its dtype.
    pub fn size_in_bytes(&self) -> usize {
        self.elem_count() * self.dtype().size_in_bytes()
    }

    fn read_storage(&self) -> Result<RwLockReadGuard<'_, Vec<f64>>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn write_storage(&self) -> Result<RwLockWriteGuard<'_, Vec<f64>>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    // In-place mutation

    /// Overwrite the contents in place.
    ///
    /// Every clone of this handle (and every reshape view) sees the new
    /// values. `new_data` must have exactly `elem_count()` elements; values
    /// are rounded to the tensor's dtype.
    pub fn update_data_inplace(&self, new_data: &[f64]) -> Result<()> {
        let expected = self.elem_count();
        if new_data.len() != expected {
            return Err(Error::ElementCountMismatch {
                shape: self.shape().clone(),
                expected,
                got: new_data.len(),
            });
        }
        let dtype = self.dtype();
        let mut guard = self.write_storage()?;
        for (dst, &src) in guard.iter_mut().zip(new_data) {
            *dst = dtype.round(src);
        }
        Ok(())
    }

    // Creation methods

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        Self::full(shape, 0.0, dtype)
    }

    /// Create a tensor filled with ones.
    pub fn ones(shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        Self::full(shape, 1.0, dtype)
    }

    /// Create a tensor filled with a constant value.
    pub fn full(shape: impl Into<Shape>, val: f64, dtype: DType) -> Result<Self> {
        let shape = shape.into();
        let data = vec![val; shape.elem_count()];
        Self::from_vec_rounded(data, shape, dtype)
    }

    /// Create a tensor from a flat slice of f64 values, converted to `dtype`.
    pub fn from_f64_slice(data: &[f64], shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        Self::from_vec_rounded(data.to_vec(), shape.into(), dtype)
    }

    /// Create a tensor from owned f64 values, converted to `dtype`.
    pub fn from_f64_vec(data: Vec<f64>, shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        Self::from_vec_rounded(data, shape.into(), dtype)
    }

    /// Create a tensor from a typed slice; the dtype follows the element type.
    pub fn from_slice<T: WithDType>(data: &[T], shape: impl Into<Shape>) -> Result<Self> {
        let values = data.iter().map(|v| v.to_f64()).collect();
        Self::from_vec_rounded(values, shape.into(), T::DTYPE)
    }

    /// Random uniform values in [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        let shape = shape.into();
        let mut rng = rand::thread_rng();
        let data = (0..shape.elem_count()).map(|_| rng.gen::<f64>()).collect();
        Self::from_vec_rounded(data, shape, dtype)
    }

    /// Random normal values from a seeded generator (reproducible).
    pub fn randn_seeded(shape: impl Into<Shape>, dtype: DType, seed: u64) -> Result<Self> {
        let shape = shape.into();
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..shape.elem_count())
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        Self::from_vec_rounded(data, shape, dtype)
    }

    /// Zeros with the same shape and dtype as `other`.
    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape().clone(), other.dtype())
    }

    // Shape manipulation

    /// View with a new shape sharing the same storage.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        if new_shape.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: new_shape.elem_count(),
                dst_shape: new_shape,
            });
        }
        Ok(Self::from_storage(
            Arc::clone(&self.inner.storage),
            new_shape,
            self.dtype(),
        ))
    }

    /// Transpose a 2-D tensor (copies into a new contiguous buffer).
    pub fn t(&self) -> Result<Self> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        let (rows, cols) = (self.dims()[0], self.dims()[1]);
        let data = self.read_storage()?;
        let mut out = vec![0.0f64; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = data[r * cols + c];
            }
        }
        drop(data);
        Self::from_vec_rounded(out, Shape::from((cols, rows)), self.dtype())
    }

    // Elementwise unary ops

    fn map_unary(&self, f: impl Fn(f64) -> f64) -> Result<Self> {
        let data: Vec<f64> = self.read_storage()?.iter().map(|&v| f(v)).collect();
        Self::from_vec_rounded(data, self.shape().clone(), self.dtype())
    }

    pub fn abs(&self) -> Result<Self> {
        self.map_unary(f64::abs)
    }

    /// Elementwise sign: -1, 0 or +1.
    pub fn sign(&self) -> Result<Self> {
        self.map_unary(|v| {
            if v > 0.0 {
                1.0
            } else if v < 0.0 {
                -1.0
            } else {
                0.0
            }
        })
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.map_unary(f64::sqrt)
    }

    pub fn square(&self) -> Result<Self> {
        self.map_unary(|v| v * v)
    }

    pub fn powf(&self, exponent: f64) -> Result<Self> {
        self.map_unary(|v| v.powf(exponent))
    }

    pub fn relu(&self) -> Result<Self> {
        self.map_unary(|v| v.max(0.0))
    }

    pub fn sigmoid(&self) -> Result<Self> {
        self.map_unary(|v| 1.0 / (1.0 + (-v).exp()))
    }

    pub fn tanh(&self) -> Result<Self> {
        self.map_unary(f64::tanh)
    }

    /// GELU, tanh approximation.
    pub fn gelu(&self) -> Result<Self> {
        const SQRT_2_OVER_PI: f64 = 0.797_884_560_802_865_4;
        self.map_unary(|v| 0.5 * v * (1.0 + (SQRT_2_OVER_PI * (v + 0.044715 * v * v * v)).tanh()))
    }

    /// SiLU / Swish: x · σ(x).
    pub fn silu(&self) -> Result<Self> {
        self.map_unary(|v| v / (1.0 + (-v).exp()))
    }

    /// `x * mul + add`.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        self.map_unary(|v| v * mul + add)
    }

    // Elementwise binary ops (NumPy broadcasting; result takes lhs dtype)

    fn broadcast_binary(&self, rhs: &Self, f: impl Fn(f64, f64) -> f64) -> Result<Self> {
        let lhs_data = self.read_storage()?;
        let rhs_data = rhs.read_storage()?;

        if self.shape() == rhs.shape() {
            let out = lhs_data
                .iter()
                .zip(rhs_data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Self::from_vec_rounded(out, self.shape().clone(), self.dtype());
        }

        let out_shape = self.shape().broadcast(rhs.shape())?;
        let l_strides = self.shape().strides_in(&out_shape);
        let r_strides = rhs.shape().strides_in(&out_shape);
        let out_strides = out_shape.strides();

        let n = out_shape.elem_count();
        let mut out = Vec::with_capacity(n);
        for flat in 0..n {
            let mut rem = flat;
            let (mut li, mut ri) = (0usize, 0usize);
            for d in 0..out_strides.len() {
                let idx = rem / out_strides[d];
                rem %= out_strides[d];
                li += idx * l_strides[d];
                ri += idx * r_strides[d];
            }
            out.push(f(lhs_data[li], rhs_data[ri]));
        }
        Self::from_vec_rounded(out, out_shape, self.dtype())
    }

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.broadcast_binary(rhs, |a, b| a + b)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.broadcast_binary(rhs, |a, b| a - b)
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.broadcast_binary(rhs, |a, b| a * b)
    }

    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.broadcast_binary(rhs, |a, b| a / b)
    }

    // Reductions

    /// Sum of all elements.
    pub fn sum_all(&self) -> Result<f64> {
        Ok(self.read_storage()?.iter().sum())
    }

    /// Mean of all elements (0 for an empty tensor).
    pub fn mean_all(&self) -> Result<f64> {
        let n = self.elem_count();
        if n == 0 {
            return Ok(0.0);
        }
        Ok(self.sum_all()? / n as f64)
    }

    /// Largest absolute value (0 for an empty tensor). NaNs are ignored.
    pub fn max_abs(&self) -> Result<f64> {
        Ok(self
            .read_storage()?
            .iter()
            .fold(0.0f64, |acc, &v| acc.max(v.abs())))
    }

    /// Mean along `dim`.
    pub fn mean(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        let dims = self.dims();
        if dim >= dims.len() {
            return Err(Error::DimOutOfRange {
                dim,
                rank: dims.len(),
            });
        }
        let outer: usize = dims[..dim].iter().product();
        let size = dims[dim];
        let inner: usize = dims[dim + 1..].iter().product();

        let data = self.read_storage()?;
        let mut out = vec![0.0f64; outer * inner];
        for o in 0..outer {
            for j in 0..size {
                let base = (o * size + j) * inner;
                for i in 0..inner {
                    out[o * inner + i] += data[base + i];
                }
            }
        }
        drop(data);
        if size > 0 {
            for v in out.iter_mut() {
                *v /= size as f64;
            }
        }

        let mut out_dims = dims.to_vec();
        if keep_dim {
            out_dims[dim] = 1;
        } else {
            out_dims.remove(dim);
        }
        Self::from_vec_rounded(out, Shape::new(out_dims), self.dtype())
    }

    // Matrix multiplication

    /// `[..., m, k] @ [k, n] → [..., m, n]`.
    ///
    /// Leading dimensions of the left operand are treated as a batch.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        if self.rank() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        if rhs.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: rhs.rank(),
            });
        }
        let ldims = self.dims();
        let m = ldims[ldims.len() - 2];
        let k = ldims[ldims.len() - 1];
        let (k2, n) = (rhs.dims()[0], rhs.dims()[1]);
        if k != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1: k, k2, n });
        }
        let batch: usize = ldims[..ldims.len() - 2].iter().product();

        let a = self.read_storage()?;
        let b = rhs.read_storage()?;
        let mut out = vec![0.0f64; batch * m * n];
        for bi in 0..batch {
            let a_off = bi * m * k;
            let c_off = bi * m * n;
            for i in 0..m {
                for p in 0..k {
                    let av = a[a_off + i * k + p];
                    if av == 0.0 {
                        continue;
                    }
                    let b_row = &b[p * n..(p + 1) * n];
                    let c_row = &mut out[c_off + i * n..c_off + (i + 1) * n];
                    for (c, &bv) in c_row.iter_mut().zip(b_row) {
                        *c += av * bv;
                    }
                }
            }
        }
        drop(a);
        drop(b);

        let mut out_dims = ldims[..ldims.len() - 1].to_vec();
        out_dims.push(n);
        Self::from_vec_rounded(out, Shape::new(out_dims), self.dtype())
    }

    // Export

    /// Copy the contents out as f64.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        Ok(self.read_storage()?.clone())
    }

    /// The single value of a one-element tensor.
    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::msg(format!(
                "not a scalar: tensor has shape {}",
                self.shape()
            )));
        }
        Ok(self.read_storage()?[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creation_and_rounding() {
        let t = Tensor::from_f64_slice(&[0.1, 0.2, 0.3], 3, DType::F32).unwrap();
        assert_eq!(t.dims(), &[3]);
        assert_eq!(t.to_f64_vec().unwrap()[0], 0.1f32 as f64);

        let err = Tensor::from_f64_slice(&[1.0, 2.0], (2, 2), DType::F32).unwrap_err();
        assert!(matches!(err, Error::ElementCountMismatch { .. }));
    }

    #[test]
    fn test_clone_shares_storage() {
        let t = Tensor::zeros((2, 2), DType::F64).unwrap();
        let alias = t.clone();
        t.update_data_inplace(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(alias.to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(alias.id(), t.id());
    }

    #[test]
    fn test_reshape_is_view() {
        let t = Tensor::zeros((2, 3), DType::F64).unwrap();
        let flat = t.reshape(6).unwrap();
        flat.update_data_inplace(&[1.0; 6]).unwrap();
        assert_eq!(t.sum_all().unwrap(), 6.0);
        assert!(t.reshape((4, 2)).is_err());
    }

    #[test]
    fn test_broadcast_add() {
        let x = Tensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64).unwrap();
        let b = Tensor::from_f64_slice(&[10.0, 20.0, 30.0], (1, 3), DType::F64).unwrap();
        let y = x.add(&b).unwrap();
        assert_eq!(
            y.to_f64_vec().unwrap(),
            vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
        );
    }

    #[test]
    fn test_matmul() {
        let a = Tensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64).unwrap();
        let b = Tensor::from_f64_slice(&[5.0, 6.0, 7.0, 8.0], (2, 2), DType::F64).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.to_f64_vec().unwrap(), vec![19.0, 22.0, 43.0, 50.0]);

        let bad = Tensor::zeros((3, 2), DType::F64).unwrap();
        assert!(matches!(
            a.matmul(&bad),
            Err(Error::MatmulShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_transpose() {
        let a = Tensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64).unwrap();
        let t = a.t().unwrap();
        assert_eq!(t.dims(), &[3, 2]);
        assert_eq!(t.to_f64_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_mean_keep_dim() {
        let a = Tensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64).unwrap();
        let m = a.mean(1, true).unwrap();
        assert_eq!(m.dims(), &[2, 1]);
        assert_eq!(m.to_f64_vec().unwrap(), vec![2.0, 5.0]);
        let m0 = a.mean(0, false).unwrap();
        assert_eq!(m0.to_f64_vec().unwrap(), vec![2.5, 3.5, 4.5]);
    }

    #[test]
    fn test_unary_ops() {
        let a = Tensor::from_f64_slice(&[-2.0, 0.0, 3.0], 3, DType::F64).unwrap();
        assert_eq!(a.sign().unwrap().to_f64_vec().unwrap(), vec![-1.0, 0.0, 1.0]);
        assert_eq!(a.relu().unwrap().to_f64_vec().unwrap(), vec![0.0, 0.0, 3.0]);
        assert_eq!(a.max_abs().unwrap(), 3.0);
        assert_eq!(a.affine(2.0, 1.0).unwrap().to_f64_vec().unwrap(), vec![-3.0, 1.0, 7.0]);
    }

    #[test]
    fn test_seeded_randn_is_reproducible() {
        let a = Tensor::randn_seeded(16, DType::F32, 7).unwrap();
        let b = Tensor::randn_seeded(16, DType::F32, 7).unwrap();
        assert_eq!(a.to_f64_vec().unwrap(), b.to_f64_vec().unwrap());
    }
}
