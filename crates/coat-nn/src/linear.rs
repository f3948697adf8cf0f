// Linear — Fully-connected (dense) layer
//
// y = x @ W^T + b
//
// Linear(in_features, out_features) maps [..., in_features] to
// [..., out_features]: a matrix multiplication followed by an optional bias.
//
// WEIGHT INITIALIZATION:
//
// Uniform U(-k, k) with k = sqrt(1/in_features), the usual default for dense
// layers, keeps the output variance roughly independent of fan-in.
//
// PARAMETER SHAPES:
//
//   weight: [out_features, in_features]
//   bias:   [1, out_features]            — broadcast across the batch
//
// Linear declares UnitKind::Linear, which is what the FP8 activation flow
// keys on to choose whole-tensor scaling.

use coat_core::dtype::DType;
use coat_core::error::{Error, Result};
use coat_core::tensor::Tensor;

use crate::module::{Module, UnitKind};

/// A fully-connected (dense) layer: y = xW^T + b.
///
/// # Examples
/// ```ignore
/// let linear = Linear::new(784, 128, true, DType::F32)?;
/// let x = Tensor::rand((32, 784), DType::F32)?;
/// let y = linear.forward(&x)?; // shape: [32, 128]
/// ```
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Create a new Linear layer with uniform initialization.
    pub fn new(in_features: usize, out_features: usize, use_bias: bool, dtype: DType) -> Result<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(Error::invalid(format!(
                "Linear features must be positive, got in={in_features} out={out_features}"
            )));
        }
        let k = (1.0 / in_features as f64).sqrt();

        // rand ∈ [0, 1) → [-k, k)
        let weight = Tensor::rand((out_features, in_features), dtype)?.affine(2.0 * k, -k)?;
        let bias = if use_bias {
            Some(Tensor::rand((1, out_features), dtype)?.affine(2.0 * k, -k)?)
        } else {
            None
        };

        Ok(Linear {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    /// Create a Linear layer from existing weight and bias tensors.
    pub fn from_tensors(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let dims = weight.dims();
        if dims.len() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: dims.len(),
            });
        }
        let out_features = dims[0];
        let in_features = dims[1];
        if let Some(b) = &bias {
            if b.elem_count() != out_features {
                return Err(Error::ShapeMismatch {
                    expected: (1, out_features).into(),
                    got: b.shape().clone(),
                });
            }
        }
        let bias = bias.map(|b| b.reshape((1, out_features))).transpose()?;
        Ok(Linear {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

impl Module for Linear {
    /// Input `[batch, in_features]` → output `[batch, out_features]`.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let output = x.matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(bias) => output.add(bias),
            None => Ok(output),
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref b) = self.bias {
            params.push(b.clone());
        }
        params
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Linear
    }

    fn name(&self) -> String {
        format!("Linear({}→{})", self.in_features, self.out_features)
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut named = vec![("weight".to_string(), self.weight.clone())];
        if let Some(ref b) = self.bias {
            named.push(("bias".to_string(), b.clone()));
        }
        named
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_known_weights() {
        let w = Tensor::from_f64_slice(&[1.0, 0.0, 0.0, 2.0, 1.0, 1.0], (3, 2), DType::F64).unwrap();
        let b = Tensor::from_f64_slice(&[0.5, 0.5, 0.5], 3, DType::F64).unwrap();
        let linear = Linear::from_tensors(w, Some(b)).unwrap();
        let x = Tensor::from_f64_slice(&[1.0, 2.0], (1, 2), DType::F64).unwrap();
        let y = linear.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 3]);
        assert_eq!(y.to_f64_vec().unwrap(), vec![1.5, 4.5, 3.5]);
    }

    #[test]
    fn test_init_range_and_kind() {
        let linear = Linear::new(16, 4, true, DType::F32).unwrap();
        assert_eq!(linear.kind(), UnitKind::Linear);
        assert_eq!(linear.num_parameters(), 16 * 4 + 4);
        let k = (1.0f64 / 16.0).sqrt();
        assert!(linear.weight().max_abs().unwrap() <= k + 1e-6);
    }

    #[test]
    fn test_rejects_bad_bias() {
        let w = Tensor::zeros((3, 2), DType::F32).unwrap();
        let b = Tensor::zeros(2, DType::F32).unwrap();
        assert!(matches!(
            Linear::from_tensors(w, Some(b)),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
