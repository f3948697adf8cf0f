use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fp8::Fp8Format;

// DType — Supported numeric data types
//
// Every tensor carries a DType that fixes the precision its contents are
// rounded to on write. Storage is always widened to f64 in memory; the dtype
// decides how many bits of that f64 survive:
//
//   F64    — 64-bit float, exact
//   F32    — 32-bit float, the default workhorse
//   F16    — 16-bit IEEE half float
//   BF16   — 16-bit brain float, the fallback when FP8 is unavailable
//   F8E4M3 — 8-bit float, 4 exponent / 3 mantissa bits (range ±448)
//   F8E5M2 — 8-bit float, 5 exponent / 2 mantissa bits (range ±57344)

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F8E4M3,
    F8E5M2,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F8E4M3 | DType::F8E5M2 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    /// Whether this is a half-precision type (F16 or BF16).
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// Whether this is one of the 8-bit float formats.
    pub fn is_fp8(&self) -> bool {
        matches!(self, DType::F8E4M3 | DType::F8E5M2)
    }

    /// Round an f64 to the nearest value representable in this dtype.
    ///
    /// FP8 dtypes saturate at their maximum finite value.
    pub fn round(&self, v: f64) -> f64 {
        match self {
            DType::F64 => v,
            DType::F32 => v as f32 as f64,
            DType::F16 => half::f16::from_f64(v).to_f32() as f64,
            DType::BF16 => half::bf16::from_f64(v).to_f32() as f64,
            DType::F8E4M3 => Fp8Format::E4M3.round(v as f32) as f64,
            DType::F8E5M2 => Fp8Format::E5M2.round(v as f32) as f64,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F8E4M3 => "f8e4m3",
            DType::F8E5M2 => "f8e5m2",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        write!(f, "{}", s)
    }
}

// WithDType — connects Rust element types to the DType enum
//
// Lets generic constructors like `Tensor::from_slice::<f32>` pick the dtype
// from the element type instead of taking it as an argument.

/// Trait implemented by Rust types that can seed a tensor.
pub trait WithDType: Copy + Send + Sync + 'static + std::fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64.
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::bf16::from_f64(v)
    }
}
