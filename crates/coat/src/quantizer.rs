// GroupQuantizer — grouped FP8 quantize / dequantize
//
// QUANTIZE:
//
//   1. Flatten to N values, n_groups = ceil(N / group_size), zero-pad to
//      n_groups * group_size.
//   2. Per group, independently (rayon):
//        k     = compute_exponent(group)   if expansion is on, else 1
//        g     = expand(group, k)
//        scale = max|g| / max_value        (1.0 for an all-zero group)
//        codes = cast(g / scale)           FP8, or bf16 without FP8 storage
//   3. Return the block with scales, exponents (whenever expansion was on)
//      and the original shape / dtype.
//
// DEQUANTIZE reverses it: widen, multiply by scale, contract by k when
// k ≠ 1, drop the padding, reshape.
//
// Padding is zero, so it can never raise a group's max and therefore never
// changes any scale. Quantization is deterministic.

use rayon::prelude::*;

use coat_core::capability::NumericCapabilities;
use coat_core::error::{Error, Result};
use coat_core::fp8::Fp8Format;
use coat_core::tensor::Tensor;

use crate::block::{NarrowCodes, QuantizedBlock};
use crate::expansion::{contract_in_place, expand_in_place, exponent_for, DEFAULT_EPSILON};

/// Default number of elements per quantization group.
pub const DEFAULT_GROUP_SIZE: usize = 128;

/// Scale and exponent chosen for one group.
struct GroupParams {
    scale: f32,
    exponent: f32,
}

/// Pick k (stored as f32), expand the group in place and compute its scale.
fn prepare_group(values: &mut [f64], format: Fp8Format, use_expansion: bool) -> GroupParams {
    let max_value = format.max_value();

    let mut k = if use_expansion {
        exponent_for(values, format, DEFAULT_EPSILON) as f32 as f64
    } else {
        1.0
    };
    let raw_max = values.iter().fold(0.0f64, |acc, &v| acc.max(v.abs()));
    // An expanded group whose scale would overflow f32 is stored unexpanded.
    if k != 1.0 && !((raw_max.powf(k) / max_value) as f32).is_finite() {
        k = 1.0;
    }
    expand_in_place(values, k);

    let max = if k == 1.0 {
        raw_max
    } else {
        values.iter().fold(0.0f64, |acc, &v| acc.max(v.abs()))
    };
    let scale = if max > 0.0 {
        (max / max_value) as f32
    } else {
        1.0
    };
    // Groups too small for an f32 scale are treated as zero groups.
    let scale = if scale > 0.0 && scale.is_finite() {
        scale
    } else {
        1.0
    };

    GroupParams {
        scale,
        exponent: k as f32,
    }
}

/// Grouped quantizer for arbitrary tensors.
///
/// # Example
/// ```ignore
/// let q = GroupQuantizer::new(128, NumericCapabilities::detect())?;
/// let block = q.quantize(&moment, Fp8Format::E4M3, true)?;
/// let restored = q.dequantize(&block)?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupQuantizer {
    group_size: usize,
    caps: NumericCapabilities,
}

impl GroupQuantizer {
    /// `InvalidArgument` if `group_size` is 0.
    pub fn new(group_size: usize, caps: NumericCapabilities) -> Result<Self> {
        if group_size == 0 {
            return Err(Error::invalid("group_size must be positive, got 0"));
        }
        Ok(Self { group_size, caps })
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn capabilities(&self) -> NumericCapabilities {
        self.caps
    }

    /// Quantize a tensor into a [`QuantizedBlock`].
    pub fn quantize(&self, tensor: &Tensor, format: Fp8Format, use_expansion: bool) -> Result<QuantizedBlock> {
        let gs = self.group_size;
        let mut values = tensor.to_f64_vec()?;
        let n_groups = values.len().div_ceil(gs);
        values.resize(n_groups * gs, 0.0);

        let params: Vec<GroupParams> = values
            .par_chunks_mut(gs)
            .map(|group| prepare_group(group, format, use_expansion))
            .collect();

        let codes = if self.caps.has_fp8() {
            let mut codes = vec![0u8; values.len()];
            codes
                .par_chunks_mut(gs)
                .zip(values.par_chunks(gs))
                .zip(params.par_iter())
                .for_each(|((out, group), p)| {
                    let scale = p.scale as f64;
                    for (c, &v) in out.iter_mut().zip(group) {
                        *c = format.encode((v / scale) as f32);
                    }
                });
            NarrowCodes::Fp8(codes)
        } else {
            let mut codes = vec![half::bf16::ZERO; values.len()];
            codes
                .par_chunks_mut(gs)
                .zip(values.par_chunks(gs))
                .zip(params.par_iter())
                .for_each(|((out, group), p)| {
                    let scale = p.scale as f64;
                    for (c, &v) in out.iter_mut().zip(group) {
                        *c = half::bf16::from_f64(v / scale);
                    }
                });
            NarrowCodes::Bf16(codes)
        };

        let scales = params.iter().map(|p| p.scale).collect();
        let exponents = use_expansion.then(|| params.iter().map(|p| p.exponent).collect());

        QuantizedBlock::from_parts(
            format,
            gs,
            codes,
            scales,
            exponents,
            tensor.shape().clone(),
            tensor.dtype(),
        )
    }

    /// Reconstruct the flattened, unpadded values of a block.
    pub(crate) fn decode_values(block: &QuantizedBlock) -> Result<Vec<f64>> {
        block.validate()?;
        let gs = block.group_size();
        let format = block.format();
        let codes = block.codes();
        let scales = block.scales();
        let exponents = block.exponents();

        let mut values = vec![0.0f64; codes.len()];
        values
            .par_chunks_mut(gs)
            .enumerate()
            .for_each(|(g, out)| {
                let scale = scales[g] as f64;
                for (i, v) in out.iter_mut().enumerate() {
                    *v = codes.decode(format, g * gs + i) * scale;
                }
                if let Some(exps) = exponents {
                    contract_in_place(out, exps[g] as f64);
                }
            });
        values.truncate(block.original_length());
        Ok(values)
    }

    /// Dequantize a block into a new tensor with the original shape and dtype.
    pub fn dequantize(&self, block: &QuantizedBlock) -> Result<Tensor> {
        let values = Self::decode_values(block)?;
        Tensor::from_f64_vec(values, block.original_shape().clone(), block.original_dtype())
    }

    /// Dequantize a block into an existing tensor.
    ///
    /// `ShapeMismatch` if `target` does not have the block's original shape.
    pub fn dequantize_into(&self, block: &QuantizedBlock, target: &Tensor) -> Result<()> {
        if target.shape() != block.original_shape() {
            return Err(Error::ShapeMismatch {
                expected: block.original_shape().clone(),
                got: target.shape().clone(),
            });
        }
        let values = Self::decode_values(block)?;
        target.update_data_inplace(&values)
    }
}
