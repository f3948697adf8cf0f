// Dynamic range expansion
//
// FP8 has a narrow dynamic range (E4M3: 448 / 2^-9 ≈ 2.3e5) but optimizer
// moments often occupy only a small fraction of it: a group whose largest
// magnitude is 10× its smallest wastes most of the representable exponents.
// Range expansion stretches a group before quantization:
//
//   expand(x, k)   = sign(x) · |x|^k
//   contract(x, k) = sign(x) · |x|^(1/k)
//
// with k chosen so the group's dynamic range roughly matches the format's:
//
//   dyn_target = max_value / min_normal
//   dyn_input  = max|x| / (min|x| + ε)      over elements with |x| > ε
//   k          = clamp(ln(dyn_target) / (ln(dyn_input) + ε), 1, 3)
//
// A group with no element above ε (all zero) gets k = 1. k never drops
// below 1, so expansion can only widen a range.

use coat_core::error::Result;
use coat_core::fp8::Fp8Format;
use coat_core::tensor::Tensor;

/// Default ε used when picking the exponent.
pub const DEFAULT_EPSILON: f64 = 1e-8;

/// Smallest exponent ever produced.
pub const MIN_EXPONENT: f64 = 1.0;

/// Largest exponent ever produced.
pub const MAX_EXPONENT: f64 = 3.0;

/// Compute the expansion exponent `k ∈ [1, 3]` for a group of values.
pub fn exponent_for(values: &[f64], format: Fp8Format, epsilon: f64) -> f64 {
    let mut x_max = 0.0f64;
    let mut x_min = f64::INFINITY;
    let mut seen = false;
    for &v in values {
        let a = v.abs();
        if a > epsilon {
            seen = true;
            x_max = x_max.max(a);
            x_min = x_min.min(a);
        }
    }
    if !seen || !x_max.is_finite() {
        return 1.0;
    }

    let dyn_target = format.dynamic_range();
    let dyn_input = x_max / (x_min + epsilon);
    let k = dyn_target.ln() / (dyn_input.ln() + epsilon);
    if k.is_nan() {
        return MIN_EXPONENT;
    }
    k.clamp(MIN_EXPONENT, MAX_EXPONENT)
}

/// `sign(x) · |x|^k` in place.
pub fn expand_in_place(values: &mut [f64], k: f64) {
    if k == 1.0 {
        return;
    }
    for v in values.iter_mut() {
        *v = v.signum() * v.abs().powf(k);
    }
}

/// `sign(x) · |x|^(1/k)` in place.
pub fn contract_in_place(values: &mut [f64], k: f64) {
    if k == 1.0 {
        return;
    }
    let inv = 1.0 / k;
    for v in values.iter_mut() {
        *v = v.signum() * v.abs().powf(inv);
    }
}

/// Tensor-level range expansion with a fixed ε.
///
/// # Example
/// ```ignore
/// let expander = RangeExpander::default();
/// let k = expander.compute_exponent(&moment, Fp8Format::E4M3)?;
/// let stretched = expander.expand(&moment, k)?;
/// let restored = expander.contract(&stretched, k)?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeExpander {
    epsilon: f64,
}

impl Default for RangeExpander {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
        }
    }
}

impl RangeExpander {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Exponent for the whole tensor treated as one group.
    pub fn compute_exponent(&self, x: &Tensor, format: Fp8Format) -> Result<f64> {
        Ok(exponent_for(&x.to_f64_vec()?, format, self.epsilon))
    }

    /// Elementwise `sign(x) · |x|^k`.
    pub fn expand(&self, x: &Tensor, k: f64) -> Result<Tensor> {
        let mut data = x.to_f64_vec()?;
        expand_in_place(&mut data, k);
        Tensor::from_f64_vec(data, x.shape().clone(), x.dtype())
    }

    /// Elementwise `sign(x) · |x|^(1/k)`, the inverse of [`expand`](Self::expand).
    pub fn contract(&self, x: &Tensor, k: f64) -> Result<Tensor> {
        let mut data = x.to_f64_vec()?;
        contract_in_place(&mut data, k);
        Tensor::from_f64_vec(data, x.shape().clone(), x.dtype())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coat_core::DType;
    use proptest::prelude::*;

    #[test]
    fn test_zero_group_exponent_is_one() {
        assert_eq!(exponent_for(&[0.0; 8], Fp8Format::E4M3, DEFAULT_EPSILON), 1.0);
        assert_eq!(exponent_for(&[], Fp8Format::E4M3, DEFAULT_EPSILON), 1.0);
    }

    #[test]
    fn test_narrow_group_is_stretched_to_max() {
        // dynamic range 2 is tiny compared with 2.3e5
        let k = exponent_for(&[1.0, 2.0, -1.5], Fp8Format::E4M3, DEFAULT_EPSILON);
        assert_eq!(k, MAX_EXPONENT);
    }

    #[test]
    fn test_wide_group_is_left_alone() {
        let k = exponent_for(&[1e-6, 1.0, 1e3], Fp8Format::E4M3, DEFAULT_EPSILON);
        assert_eq!(k, MIN_EXPONENT);
    }

    #[test]
    fn test_intermediate_exponent() {
        // dyn_input = 100 → k = ln(229376) / ln(100) ≈ 2.68
        let k = exponent_for(&[0.01, 1.0], Fp8Format::E4M3, 0.0);
        let expected = Fp8Format::E4M3.dynamic_range().ln() / 100f64.ln();
        assert!((k - expected).abs() < 1e-9);
        assert!(k > 2.6 && k < 2.7);
    }

    #[test]
    fn test_expand_keeps_sign_and_zero() {
        let mut v = vec![-2.0, 0.0, 3.0];
        expand_in_place(&mut v, 2.0);
        assert_eq!(v, vec![-4.0, 0.0, 9.0]);
        contract_in_place(&mut v, 2.0);
        assert_eq!(v, vec![-2.0, 0.0, 3.0]);
    }

    #[test]
    fn test_tensor_api_preserves_shape() {
        let x = Tensor::from_f64_slice(&[0.5, -0.25, 0.125, 1.0], (2, 2), DType::F64).unwrap();
        let ex = RangeExpander::default();
        let k = ex.compute_exponent(&x, Fp8Format::E4M3).unwrap();
        let y = ex.contract(&ex.expand(&x, k).unwrap(), k).unwrap();
        assert_eq!(y.dims(), &[2, 2]);
        for (a, b) in x.to_f64_vec().unwrap().iter().zip(y.to_f64_vec().unwrap()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    proptest! {
        #[test]
        fn prop_exponent_in_bounds(values in prop::collection::vec(-1e6f64..1e6, 0..64)) {
            for format in [Fp8Format::E4M3, Fp8Format::E5M2] {
                let k = exponent_for(&values, format, DEFAULT_EPSILON);
                prop_assert!((MIN_EXPONENT..=MAX_EXPONENT).contains(&k));
            }
        }

        #[test]
        fn prop_contract_inverts_expand(
            values in prop::collection::vec(-1e3f64..1e3, 1..64),
            k in 1.0f64..=3.0,
        ) {
            let mut v = values.clone();
            expand_in_place(&mut v, k);
            contract_in_place(&mut v, k);
            for (a, b) in values.iter().zip(&v) {
                prop_assert!((a - b).abs() <= 1e-9 * a.abs().max(1.0));
            }
        }
    }
}
