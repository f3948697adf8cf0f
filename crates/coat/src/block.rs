// QuantizedBlock — a tensor stored in a narrow format, group by group
//
// LAYOUT:
//
//   codes      [n_groups * group_size]  narrow codes, row-major by group
//   scales     [n_groups]               per-group scale, f32
//   exponents  [n_groups] (optional)    per-group range-expansion exponent
//
// The flattened tensor is zero-padded to a multiple of group_size. Padding
// codes encode zero and are dropped on dequantize. A block records the shape
// and dtype of the tensor it came from so dequantize restores both exactly.
//
// Codes are FP8 bytes when the runtime has FP8 storage and bfloat16 values
// otherwise; the enum keeps both cases in one type so states and caches
// never branch on capability outside the codec.
//
// Blocks are immutable once produced. `from_parts` and `validate` exist for
// blocks that come back from serialization.

use serde::{Deserialize, Serialize};

use coat_core::dtype::DType;
use coat_core::error::{Error, Result};
use coat_core::fp8::Fp8Format;
use coat_core::shape::Shape;

/// Narrow storage for the codes of a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NarrowCodes {
    /// FP8 bit patterns in the block's format.
    Fp8(Vec<u8>),
    /// bfloat16 fallback when FP8 storage is unavailable.
    Bf16(Vec<half::bf16>),
}

impl NarrowCodes {
    pub fn len(&self) -> usize {
        match self {
            NarrowCodes::Fp8(c) => c.len(),
            NarrowCodes::Bf16(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes per code.
    fn code_bytes(&self) -> usize {
        match self {
            NarrowCodes::Fp8(_) => 1,
            NarrowCodes::Bf16(_) => 2,
        }
    }

    /// Decode the code at `index` in the given format.
    #[inline]
    pub(crate) fn decode(&self, format: Fp8Format, index: usize) -> f64 {
        match self {
            NarrowCodes::Fp8(c) => format.decode(c[index]) as f64,
            NarrowCodes::Bf16(c) => c[index].to_f32() as f64,
        }
    }
}

/// A tensor quantized into fixed-size groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedBlock {
    format: Fp8Format,
    group_size: usize,
    codes: NarrowCodes,
    scales: Vec<f32>,
    exponents: Option<Vec<f32>>,
    original_shape: Shape,
    original_dtype: DType,
}

impl QuantizedBlock {
    /// Assemble a block from its parts, checking that they agree.
    pub fn from_parts(
        format: Fp8Format,
        group_size: usize,
        codes: NarrowCodes,
        scales: Vec<f32>,
        exponents: Option<Vec<f32>>,
        original_shape: Shape,
        original_dtype: DType,
    ) -> Result<Self> {
        let block = Self {
            format,
            group_size,
            codes,
            scales,
            exponents,
            original_shape,
            original_dtype,
        };
        block.validate()?;
        Ok(block)
    }

    /// Check the structural invariants of the block.
    ///
    /// Returns `CorruptBlock` when the code count, scale count, exponent
    /// count and original length disagree, or a scale/exponent is unusable.
    pub fn validate(&self) -> Result<()> {
        if self.group_size == 0 {
            return Err(Error::CorruptBlock("group_size is 0".into()));
        }
        let n_groups = self.scales.len();
        let len = self.original_length();
        if n_groups != len.div_ceil(self.group_size) {
            return Err(Error::CorruptBlock(format!(
                "{n_groups} groups of {} cannot hold exactly {len} elements",
                self.group_size
            )));
        }
        if self.codes.len() != n_groups * self.group_size {
            return Err(Error::CorruptBlock(format!(
                "expected {} codes for {n_groups} groups of {}, got {}",
                n_groups * self.group_size,
                self.group_size,
                self.codes.len()
            )));
        }
        if let Some(&s) = self.scales.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(Error::CorruptBlock(format!("invalid scale {s}")));
        }
        if let Some(exps) = &self.exponents {
            if exps.len() != n_groups {
                return Err(Error::CorruptBlock(format!(
                    "expected {n_groups} exponents, got {}",
                    exps.len()
                )));
            }
            if let Some(&k) = exps.iter().find(|k| !(k.is_finite() && **k >= 1.0)) {
                return Err(Error::CorruptBlock(format!("invalid exponent {k}")));
            }
        }
        Ok(())
    }

    pub fn format(&self) -> Fp8Format {
        self.format
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn n_groups(&self) -> usize {
        self.scales.len()
    }

    pub fn codes(&self) -> &NarrowCodes {
        &self.codes
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    /// Per-group expansion exponents, present when range expansion was used.
    pub fn exponents(&self) -> Option<&[f32]> {
        self.exponents.as_deref()
    }

    pub fn original_shape(&self) -> &Shape {
        &self.original_shape
    }

    /// Number of real (non-padding) elements.
    pub fn original_length(&self) -> usize {
        self.original_shape.elem_count()
    }

    pub fn original_dtype(&self) -> DType {
        self.original_dtype
    }

    /// Whether codes are stored in FP8 (as opposed to the bf16 fallback).
    pub fn is_fp8(&self) -> bool {
        matches!(self.codes, NarrowCodes::Fp8(_))
    }

    /// Storage footprint: codes + scales + exponents.
    pub fn size_bytes(&self) -> usize {
        let codes = self.codes.len() * self.codes.code_bytes();
        let scales = self.scales.len() * std::mem::size_of::<f32>();
        let exps = self
            .exponents
            .as_ref()
            .map_or(0, |e| e.len() * std::mem::size_of::<f32>());
        codes + scales + exps
    }

    /// FP32 bytes of the original tensor divided by [`size_bytes`](Self::size_bytes).
    pub fn compression_ratio(&self) -> f64 {
        let size = self.size_bytes();
        if size == 0 {
            return 1.0;
        }
        (self.original_length() * 4) as f64 / size as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n: usize, gs: usize) -> Result<QuantizedBlock> {
        let groups = n.div_ceil(gs);
        QuantizedBlock::from_parts(
            Fp8Format::E4M3,
            gs,
            NarrowCodes::Fp8(vec![0; groups * gs]),
            vec![1.0; groups],
            Some(vec![1.0; groups]),
            Shape::from(n),
            DType::F32,
        )
    }

    #[test]
    fn test_valid_block_accounting() {
        let b = block(300, 128).unwrap();
        assert_eq!(b.n_groups(), 3);
        assert_eq!(b.original_length(), 300);
        // 384 codes + 3 scales + 3 exponents
        assert_eq!(b.size_bytes(), 384 + 12 + 12);
        assert!(b.is_fp8());
        assert!((b.compression_ratio() - 1200.0 / 408.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_block() {
        let b = block(0, 128).unwrap();
        assert_eq!(b.n_groups(), 0);
        assert_eq!(b.size_bytes(), 0);
        assert_eq!(b.compression_ratio(), 1.0);
    }

    #[test]
    fn test_rejects_inconsistent_parts() {
        let err = QuantizedBlock::from_parts(
            Fp8Format::E4M3,
            4,
            NarrowCodes::Fp8(vec![0; 7]),
            vec![1.0, 1.0],
            None,
            Shape::from(6),
            DType::F32,
        )
        .unwrap_err();
        assert!(matches!(err, Error::CorruptBlock(_)));

        let err = QuantizedBlock::from_parts(
            Fp8Format::E4M3,
            4,
            NarrowCodes::Fp8(vec![0; 8]),
            vec![1.0, 0.0],
            None,
            Shape::from(6),
            DType::F32,
        )
        .unwrap_err();
        assert!(matches!(err, Error::CorruptBlock(_)));

        let err = QuantizedBlock::from_parts(
            Fp8Format::E4M3,
            4,
            NarrowCodes::Fp8(vec![0; 8]),
            vec![1.0, 1.0],
            Some(vec![1.0]),
            Shape::from(6),
            DType::F32,
        )
        .unwrap_err();
        assert!(matches!(err, Error::CorruptBlock(_)));
    }
}
