// LayerNorm — Layer Normalization
//
// FORMULA:
//   y = (x - mean(x)) / sqrt(var(x) + ε) * γ + β
//
// mean and var are taken over the last dimension, γ (weight) and β (bias)
// are learnable with shape [normalized_size].
//
// SHAPES:
//   Input:  [*, normalized_size]
//   Output: same shape as input
//
// LayerNorm declares UnitKind::Normalization, so the FP8 activation flow
// quantizes its input and output per group.

use coat_core::dtype::DType;
use coat_core::error::{Error, Result};
use coat_core::tensor::Tensor;

use crate::module::{Module, UnitKind};

/// Layer Normalization over the last dimension.
///
/// # Example
/// ```ignore
/// let ln = LayerNorm::new(512, 1e-5, DType::F32)?;
/// let x = Tensor::rand((2, 10, 512), DType::F32)?;
/// let y = ln.forward(&x)?; // same shape, normalized
/// ```
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    normalized_size: usize,
    eps: f64,
}

impl LayerNorm {
    /// Create a LayerNorm with γ = 1 and β = 0.
    pub fn new(normalized_size: usize, eps: f64, dtype: DType) -> Result<Self> {
        let weight = Tensor::ones(normalized_size, dtype)?;
        let bias = Tensor::zeros(normalized_size, dtype)?;
        Ok(LayerNorm {
            weight,
            bias,
            normalized_size,
            eps,
        })
    }

    /// Create from existing weight and bias tensors.
    pub fn from_tensors(weight: Tensor, bias: Tensor, eps: f64) -> Result<Self> {
        if weight.shape() != bias.shape() {
            return Err(Error::ShapeMismatch {
                expected: weight.shape().clone(),
                got: bias.shape().clone(),
            });
        }
        let normalized_size = weight.elem_count();
        Ok(LayerNorm {
            weight,
            bias,
            normalized_size,
            eps,
        })
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    pub fn normalized_size(&self) -> usize {
        self.normalized_size
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let rank = x.rank();
        if rank == 0 {
            coat_core::bail!("LayerNorm: input must have at least 1 dimension");
        }
        let last_dim = rank - 1;
        if x.dims()[last_dim] != self.normalized_size {
            coat_core::bail!(
                "LayerNorm: expected last dim {}, got shape {}",
                self.normalized_size,
                x.shape()
            );
        }

        let mu = x.mean(last_dim, true)?;
        let centered = x.sub(&mu)?;
        let variance = centered.square()?.mean(last_dim, true)?;
        let std = variance.affine(1.0, self.eps)?.sqrt()?;
        let x_norm = centered.div(&std)?;

        x_norm.mul(&self.weight)?.add(&self.bias)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Normalization
    }

    fn name(&self) -> String {
        format!("LayerNorm({})", self.normalized_size)
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        vec![
            ("weight".to_string(), self.weight.clone()),
            ("bias".to_string(), self.bias.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_rows() {
        let ln = LayerNorm::new(4, 1e-5, DType::F64).unwrap();
        let x = Tensor::from_f64_slice(
            &[1.0, 2.0, 3.0, 4.0, 10.0, 10.0, 20.0, 20.0],
            (2, 4),
            DType::F64,
        )
        .unwrap();
        let y = ln.forward(&x).unwrap().to_f64_vec().unwrap();
        for row in y.chunks(4) {
            let mean: f64 = row.iter().sum::<f64>() / 4.0;
            let var: f64 = row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 4.0;
            assert!(mean.abs() < 1e-9);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_rejects_wrong_width() {
        let ln = LayerNorm::new(4, 1e-5, DType::F32).unwrap();
        let x = Tensor::zeros((2, 3), DType::F32).unwrap();
        let err = ln.forward(&x).unwrap_err();
        assert!(matches!(err, Error::Msg(ref m) if m.contains("expected last dim 4")));
    }
}
