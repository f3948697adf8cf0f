// ActivationQuantizer — mixed-granularity FP8 activations
//
// Forward-pass activations are quantized with a granularity picked from the
// kind of unit that consumes / produces them:
//
//   Linear units            → per-tensor: one scale for the whole tensor,
//                             the layout a tensor-core GEMM consumes directly
//   Normalization/Nonlinear → per-group: one scale per group_size elements,
//                             more precise on outlier-heavy activations
//
// Per-group scaling is two-stage: a max reduction per group first, then the
// per-group scale is applied. Activations never use range expansion.
//
// Both modes produce an ordinary QuantizedBlock: per-tensor is simply a
// single group spanning the whole tensor.

use serde::{Deserialize, Serialize};

use coat_core::capability::NumericCapabilities;
use coat_core::error::{Error, Result};
use coat_core::fp8::Fp8Format;
use coat_core::tensor::Tensor;
use coat_nn::UnitKind;

use crate::block::QuantizedBlock;
use crate::quantizer::{GroupQuantizer, DEFAULT_GROUP_SIZE};

/// How many scales an activation tensor gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One scale for the whole tensor.
    PerTensor,
    /// One scale per `group_size` elements.
    PerGroup,
}

/// Activation quantization settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    pub format: Fp8Format,
    pub group_size: usize,
    pub linear_granularity: Granularity,
    pub nonlinear_granularity: Granularity,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            format: Fp8Format::E4M3,
            group_size: DEFAULT_GROUP_SIZE,
            linear_granularity: Granularity::PerTensor,
            nonlinear_granularity: Granularity::PerGroup,
        }
    }
}

impl ActivationConfig {
    pub fn with_format(mut self, format: Fp8Format) -> Self {
        self.format = format;
        self
    }

    pub fn with_group_size(mut self, group_size: usize) -> Self {
        self.group_size = group_size;
        self
    }

    pub fn with_linear_granularity(mut self, g: Granularity) -> Self {
        self.linear_granularity = g;
        self
    }

    pub fn with_nonlinear_granularity(mut self, g: Granularity) -> Self {
        self.nonlinear_granularity = g;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_size == 0 {
            return Err(Error::invalid("activation group_size must be positive, got 0"));
        }
        Ok(())
    }

    /// Granularity for a unit kind; `None` for kinds that are not quantized.
    pub fn granularity_for(&self, kind: UnitKind) -> Option<Granularity> {
        match kind {
            UnitKind::Linear => Some(self.linear_granularity),
            UnitKind::Normalization | UnitKind::Nonlinear => Some(self.nonlinear_granularity),
            UnitKind::Other => None,
        }
    }
}

/// Quantizes activations with the granularity their unit kind calls for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivationQuantizer {
    config: ActivationConfig,
    groups: GroupQuantizer,
}

impl ActivationQuantizer {
    pub fn new(config: ActivationConfig, caps: NumericCapabilities) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            groups: GroupQuantizer::new(config.group_size, caps)?,
        })
    }

    pub fn config(&self) -> &ActivationConfig {
        &self.config
    }

    /// Whole-tensor mode: scale = max|x| / max_value (or 1.0).
    pub fn quantize_per_tensor(&self, x: &Tensor) -> Result<QuantizedBlock> {
        let whole = GroupQuantizer::new(x.elem_count().max(1), self.groups.capabilities())?;
        whole.quantize(x, self.config.format, false)
    }

    /// Grouped mode: per-group max, then per-group scale.
    pub fn quantize_per_group(&self, x: &Tensor) -> Result<QuantizedBlock> {
        self.groups.quantize(x, self.config.format, false)
    }

    pub fn quantize(&self, x: &Tensor, granularity: Granularity) -> Result<QuantizedBlock> {
        match granularity {
            Granularity::PerTensor => self.quantize_per_tensor(x),
            Granularity::PerGroup => self.quantize_per_group(x),
        }
    }

    /// Quantize with the granularity configured for `kind`.
    ///
    /// Returns `None` for [`UnitKind::Other`], whose activations stay in full
    /// precision.
    pub fn quantize_for(&self, kind: UnitKind, x: &Tensor) -> Result<Option<QuantizedBlock>> {
        self.config
            .granularity_for(kind)
            .map(|g| self.quantize(x, g))
            .transpose()
    }

    /// Reconstruct the full-precision tensor of either mode.
    pub fn dequantize(&self, block: &QuantizedBlock) -> Result<Tensor> {
        self.groups.dequantize(block)
    }
}
