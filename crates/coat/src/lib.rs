//! # COAT
//!
//! FP8 training memory compression: quantized optimizer states and
//! quantized forward activations, on CPU, in Rust.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use coat::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `coat-core` | Tensor, Shape, DType, FP8 codec, numeric capabilities |
//! | `coat-nn` | Module trait, unit kinds, Linear, LayerNorm, activations, Sequential |
//! | `coat` | Grouped quantizer, range expansion, FP8 AdamW, precision flow, trainer |
//!
//! ## Modules
//!
//! - [`expansion`] — per-group dynamic range expansion (`x → sign(x)·|x|^k`)
//! - [`block`] — `QuantizedBlock`, the narrow codes + scales of one tensor
//! - [`quantizer`] — grouped FP8 quantize / dequantize with bf16 fallback
//! - [`optim`] — AdamW whose moments live in FP8 between steps
//! - [`activation`] — per-tensor / per-group activation quantization
//! - [`flow`] — precision flow cache, `Fp8Linear`, linear unit replacement
//! - [`trainer`] — `CoatTrainer` tying both halves together with memory stats

/// Re-export core types.
pub use coat_core::{
    DType, Error, Fp8Format, NumericCapabilities, Result, Shape, Tensor, TensorId, WithDType,
    DISABLE_FP8_ENV, F8E4M3, F8E5M2,
};

/// Re-export neural network modules.
pub mod nn {
    pub use coat_nn::*;
}

/// Dynamic range expansion.
pub mod expansion;

/// Quantized block storage.
pub mod block;

/// Grouped FP8 quantizer.
pub mod quantizer;

/// FP8 AdamW and its quantization config.
pub mod optim;

/// Mixed-granularity activation quantization.
pub mod activation;

/// Precision flow: cached FP8 activations across a forward pass.
pub mod flow;

/// COAT trainer and memory reporting.
pub mod trainer;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::activation::{ActivationConfig, ActivationQuantizer, Granularity};
    pub use crate::block::{NarrowCodes, QuantizedBlock};
    pub use crate::expansion::RangeExpander;
    pub use crate::flow::{replace_linear_units, CacheEntry, Fp8Linear, PrecisionFlowCache};
    pub use crate::nn::{
        GeLU, Identity, LayerNorm, Linear, Module, ReLU, Sequential, SiLU, Sigmoid, Tanh, UnitKind,
    };
    pub use crate::optim::{
        AdamParams, Fp8AdamState, Fp8AdamW, MomentStorage, Optimizer, OptimizerState,
        QuantizationConfig,
    };
    pub use crate::quantizer::{GroupQuantizer, DEFAULT_GROUP_SIZE};
    pub use crate::trainer::{
        CoatConfig, CoatTrainer, MemoryReport, MemorySample, StepMetrics, StepPhase, TrainingPass,
    };
    pub use crate::{DType, Error, Fp8Format, NumericCapabilities, Result, Shape, Tensor};
}
