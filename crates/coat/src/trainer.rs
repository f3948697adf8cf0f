// CoatTrainer — FP8 optimizer states + FP8 activations in one training loop
//
// CoatConfig gathers the knobs of both halves:
//
//   optimizer   → Fp8AdamW with quantized first / second moments
//   activations → PrecisionFlowCache + Fp8Linear wrappers
//
// A training step is:
//
//   clear flow cache ─▶ [before_forward]
//   closure(pass)    ─▶ forward + loss + gradients through the cache
//                     ─▶ [after_backward]
//   optimizer.step   ─▶ [after_optimizer_step]
//
// Each bracket records a MemorySample (optimizer state bytes, cached
// activation bytes) when log_memory_stats is set. Only the most recent
// memory_sample_capacity samples are kept; peaks and sums are folded in as
// samples arrive, so memory_report() still covers the whole run.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use coat_core::capability::NumericCapabilities;
use coat_core::error::Result;
use coat_core::fp8::Fp8Format;
use coat_core::tensor::Tensor;
use coat_nn::{Module, Sequential};

use crate::activation::{ActivationConfig, ActivationQuantizer};
use crate::flow::{replace_linear_units, PrecisionFlowCache};
use crate::optim::{AdamParams, Fp8AdamW, Optimizer, QuantizationConfig};
use crate::quantizer::DEFAULT_GROUP_SIZE;

/// Configuration of a COAT training run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoatConfig {
    /// Store Adam moments in FP8.
    pub use_fp8_optimizer: bool,
    pub optimizer_m1_format: Fp8Format,
    pub optimizer_m2_format: Fp8Format,
    pub optimizer_block_size: usize,
    pub use_dynamic_range_expansion: bool,
    /// Quantize forward activations and wrap linear units.
    pub use_fp8_activation: bool,
    pub activation: ActivationConfig,
    /// Record a memory sample at every phase of a training step.
    pub log_memory_stats: bool,
    /// How many recent samples [`CoatTrainer::memory_samples`] keeps.
    pub memory_sample_capacity: usize,
}

/// Recent samples kept by default: about 340 training steps.
pub const DEFAULT_MEMORY_SAMPLE_CAPACITY: usize = 1024;

impl Default for CoatConfig {
    fn default() -> Self {
        Self {
            use_fp8_optimizer: true,
            optimizer_m1_format: Fp8Format::E4M3,
            optimizer_m2_format: Fp8Format::E4M3,
            optimizer_block_size: DEFAULT_GROUP_SIZE,
            use_dynamic_range_expansion: true,
            use_fp8_activation: true,
            activation: ActivationConfig::default(),
            log_memory_stats: true,
            memory_sample_capacity: DEFAULT_MEMORY_SAMPLE_CAPACITY,
        }
    }
}

impl CoatConfig {
    pub fn with_fp8_optimizer(mut self, enabled: bool) -> Self {
        self.use_fp8_optimizer = enabled;
        self
    }

    pub fn with_fp8_activation(mut self, enabled: bool) -> Self {
        self.use_fp8_activation = enabled;
        self
    }

    pub fn with_optimizer_formats(mut self, m1: Fp8Format, m2: Fp8Format) -> Self {
        self.optimizer_m1_format = m1;
        self.optimizer_m2_format = m2;
        self
    }

    pub fn with_optimizer_block_size(mut self, block_size: usize) -> Self {
        self.optimizer_block_size = block_size;
        self
    }

    pub fn with_range_expansion(mut self, enabled: bool) -> Self {
        self.use_dynamic_range_expansion = enabled;
        self
    }

    pub fn with_activation(mut self, activation: ActivationConfig) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_memory_stats(mut self, enabled: bool) -> Self {
        self.log_memory_stats = enabled;
        self
    }

    pub fn with_memory_sample_capacity(mut self, capacity: usize) -> Self {
        self.memory_sample_capacity = capacity;
        self
    }

    /// Optimizer quantization settings implied by this config.
    pub fn to_quant_config(&self) -> QuantizationConfig {
        QuantizationConfig::default()
            .with_fp8_moments(self.use_fp8_optimizer, self.use_fp8_optimizer)
            .with_formats(self.optimizer_m1_format, self.optimizer_m2_format)
            .with_block_size(self.optimizer_block_size)
            .with_range_expansion(self.use_dynamic_range_expansion)
    }

    pub fn validate(&self) -> Result<()> {
        self.to_quant_config().validate()?;
        self.activation.validate()
    }
}

/// Where in a training step a memory sample was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    BeforeForward,
    AfterBackward,
    AfterOptimizerStep,
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepPhase::BeforeForward => "before_forward",
            StepPhase::AfterBackward => "after_backward",
            StepPhase::AfterOptimizerStep => "after_optimizer_step",
        };
        f.write_str(s)
    }
}

/// Memory held by the trainer's quantized buffers at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySample {
    pub step: u64,
    pub phase: StepPhase,
    pub optimizer_state_bytes: usize,
    pub activation_cache_bytes: usize,
}

impl MemorySample {
    pub fn total_bytes(&self) -> usize {
        self.optimizer_state_bytes + self.activation_cache_bytes
    }
}

/// Peak and average figures over every recorded sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryReport {
    pub peak_optimizer_state_bytes: usize,
    pub peak_activation_cache_bytes: usize,
    pub peak_total_bytes: usize,
    pub avg_optimizer_state_bytes: f64,
    pub avg_activation_cache_bytes: f64,
    pub total_samples: usize,
}

/// Running peaks and sums over every sample, including evicted ones.
#[derive(Debug, Clone, Copy, Default)]
struct MemoryTotals {
    count: usize,
    sum_optimizer: f64,
    sum_activation: f64,
    peak_optimizer: usize,
    peak_activation: usize,
    peak_total: usize,
}

impl MemoryTotals {
    fn record(&mut self, sample: &MemorySample) {
        self.count += 1;
        self.sum_optimizer += sample.optimizer_state_bytes as f64;
        self.sum_activation += sample.activation_cache_bytes as f64;
        self.peak_optimizer = self.peak_optimizer.max(sample.optimizer_state_bytes);
        self.peak_activation = self.peak_activation.max(sample.activation_cache_bytes);
        self.peak_total = self.peak_total.max(sample.total_bytes());
    }
}

/// Metrics from a single COAT training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    pub step: u64,
    pub loss: f64,
    /// Optimizer state bytes after the update.
    pub optimizer_state_bytes: usize,
    /// Cached activation bytes after the backward closure.
    pub activation_cache_bytes: usize,
}

/// Forward access handed to the step closure.
///
/// Routes every layer through the flow cache when activation quantization
/// is on, and through the plain model otherwise.
pub struct TrainingPass<'a> {
    model: &'a Sequential,
    cache: Option<&'a PrecisionFlowCache>,
}

impl<'a> TrainingPass<'a> {
    pub fn model(&self) -> &'a Sequential {
        self.model
    }

    pub fn cache(&self) -> Option<&'a PrecisionFlowCache> {
        self.cache
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self.cache {
            Some(cache) => cache.forward_sequential(self.model, x),
            None => self.model.forward(x),
        }
    }
}

/// Drives FP8 optimizer states and FP8 activations together.
///
/// # Example
/// ```ignore
/// let mut trainer = CoatTrainer::new(CoatConfig::default(), NumericCapabilities::detect())?;
/// trainer.prepare_model(&mut model)?;
/// let mut opt = trainer.create_optimizer(model.parameters(), 1e-4)?;
///
/// for (step, (x, y)) in data.enumerate() {
///     let metrics = trainer.training_step(&model, &mut opt, step as u64, |pass| {
///         let out = pass.forward(&x)?;
///         loss_and_grads(&out, &y)
///     })?;
///     println!("loss={:.4}", metrics.loss);
/// }
/// println!("{:?}", trainer.memory_report());
/// ```
pub struct CoatTrainer {
    config: CoatConfig,
    caps: NumericCapabilities,
    quantizer: ActivationQuantizer,
    flow: Option<PrecisionFlowCache>,
    samples: VecDeque<MemorySample>,
    totals: MemoryTotals,
}

impl CoatTrainer {
    /// `InvalidArgument` if any part of `config` is out of range.
    pub fn new(config: CoatConfig, caps: NumericCapabilities) -> Result<Self> {
        config.validate()?;
        let quantizer = ActivationQuantizer::new(config.activation, caps)?;
        let flow = config
            .use_fp8_activation
            .then(|| PrecisionFlowCache::new(quantizer));
        Ok(Self {
            config,
            caps,
            quantizer,
            flow,
            samples: VecDeque::new(),
            totals: MemoryTotals::default(),
        })
    }

    pub fn config(&self) -> &CoatConfig {
        &self.config
    }

    pub fn capabilities(&self) -> NumericCapabilities {
        self.caps
    }

    /// The flow cache, present when activation quantization is enabled.
    pub fn flow_cache(&self) -> Option<&PrecisionFlowCache> {
        self.flow.as_ref()
    }

    /// The most recent samples, oldest first.
    pub fn memory_samples(&self) -> &VecDeque<MemorySample> {
        &self.samples
    }

    /// AdamW over `params` with the configured moment quantization.
    pub fn create_optimizer(&self, params: Vec<Tensor>, lr: f64) -> Result<Fp8AdamW> {
        self.create_optimizer_with(params, AdamParams::new(lr))
    }

    /// Like [`create_optimizer`](Self::create_optimizer) with full hyperparameters.
    pub fn create_optimizer_with(&self, params: Vec<Tensor>, hp: AdamParams) -> Result<Fp8AdamW> {
        let quant = if self.config.use_fp8_optimizer {
            self.config.to_quant_config()
        } else {
            QuantizationConfig::full_precision()
        };
        tracing::info!(
            params = params.len(),
            lr = hp.lr,
            fp8_moments = self.config.use_fp8_optimizer,
            "creating optimizer"
        );
        Fp8AdamW::new(params, hp, quant, self.caps)
    }

    /// Wrap every linear unit of `model` for FP8 activations.
    ///
    /// Returns the number of units wrapped; 0 when activation quantization
    /// is disabled.
    pub fn prepare_model(&self, model: &mut Sequential) -> Result<usize> {
        if !self.config.use_fp8_activation {
            return Ok(0);
        }
        let replaced = replace_linear_units(model, true, &self.quantizer);
        tracing::info!(replaced, "wrapped linear units for fp8 activations");
        Ok(replaced)
    }

    /// Run one step: clear the cache, evaluate `closure` for the loss and
    /// gradients, then update `optimizer`.
    pub fn training_step<F>(
        &mut self,
        model: &Sequential,
        optimizer: &mut Fp8AdamW,
        step: u64,
        closure: F,
    ) -> Result<StepMetrics>
    where
        F: FnOnce(&TrainingPass<'_>) -> Result<(f64, Vec<Option<Tensor>>)>,
    {
        if let Some(cache) = &self.flow {
            cache.clear_cache()?;
        }
        self.log_memory(step, StepPhase::BeforeForward, optimizer)?;

        let pass = TrainingPass {
            model,
            cache: self.flow.as_ref(),
        };
        let (loss, grads) = closure(&pass)?;
        if !loss.is_finite() {
            tracing::warn!(step, loss, "non-finite loss");
        }
        let activation_cache_bytes = self.activation_bytes()?;
        self.log_memory(step, StepPhase::AfterBackward, optimizer)?;

        optimizer.step(&grads)?;
        self.log_memory(step, StepPhase::AfterOptimizerStep, optimizer)?;

        Ok(StepMetrics {
            step,
            loss,
            optimizer_state_bytes: optimizer.state_memory_bytes(),
            activation_cache_bytes,
        })
    }

    fn activation_bytes(&self) -> Result<usize> {
        match &self.flow {
            Some(cache) => cache.memory_bytes(),
            None => Ok(0),
        }
    }

    fn log_memory(&mut self, step: u64, phase: StepPhase, optimizer: &Fp8AdamW) -> Result<()> {
        if !self.config.log_memory_stats {
            return Ok(());
        }
        let sample = MemorySample {
            step,
            phase,
            optimizer_state_bytes: optimizer.state_memory_bytes(),
            activation_cache_bytes: self.activation_bytes()?,
        };
        tracing::info!(
            step,
            %phase,
            optimizer_state_bytes = sample.optimizer_state_bytes,
            activation_cache_bytes = sample.activation_cache_bytes,
            "memory"
        );
        self.totals.record(&sample);
        if self.config.memory_sample_capacity > 0 {
            if self.samples.len() == self.config.memory_sample_capacity {
                self.samples.pop_front();
            }
            self.samples.push_back(sample);
        }
        Ok(())
    }

    /// Peak / average memory over every sample since the last reset,
    /// including those no longer kept; `None` before the first one.
    pub fn memory_report(&self) -> Option<MemoryReport> {
        let t = &self.totals;
        if t.count == 0 {
            return None;
        }
        Some(MemoryReport {
            peak_optimizer_state_bytes: t.peak_optimizer,
            peak_activation_cache_bytes: t.peak_activation,
            peak_total_bytes: t.peak_total,
            avg_optimizer_state_bytes: t.sum_optimizer / t.count as f64,
            avg_activation_cache_bytes: t.sum_activation / t.count as f64,
            total_samples: t.count,
        })
    }

    /// Forget every recorded sample.
    pub fn reset_memory_stats(&mut self) {
        self.samples.clear();
        self.totals = MemoryTotals::default();
    }
}

impl std::fmt::Debug for CoatTrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoatTrainer")
            .field("config", &self.config)
            .field("caps", &self.caps)
            .field("samples", &self.totals.count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coat_core::{DType, Error};
    use coat_nn::{Linear, ReLU};

    fn config() -> CoatConfig {
        CoatConfig::default()
            .with_optimizer_block_size(4)
            .with_activation(ActivationConfig::default().with_group_size(4))
    }

    fn model() -> Sequential {
        let w1 = Tensor::randn_seeded((4, 4), DType::F32, 1).unwrap();
        let w2 = Tensor::randn_seeded((2, 4), DType::F32, 2).unwrap();
        Sequential::new()
            .add(Linear::from_tensors(w1, None).unwrap())
            .add(ReLU)
            .add(Linear::from_tensors(w2, None).unwrap())
    }

    #[test]
    fn test_quant_config_follows_flags() {
        let q = config().to_quant_config();
        assert!(q.use_fp8_m1 && q.use_fp8_m2);
        assert_eq!(q.block_size, 4);

        let q = config().with_fp8_optimizer(false).to_quant_config();
        assert!(!q.use_fp8_m1 && !q.use_fp8_m2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = config().with_optimizer_block_size(0);
        assert!(matches!(
            CoatTrainer::new(cfg, NumericCapabilities::fp8()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_prepare_model() {
        let trainer = CoatTrainer::new(config(), NumericCapabilities::fp8()).unwrap();
        let mut m = model();
        assert_eq!(trainer.prepare_model(&mut m).unwrap(), 2);

        let plain = CoatTrainer::new(config().with_fp8_activation(false), NumericCapabilities::fp8())
            .unwrap();
        let mut m = model();
        assert_eq!(plain.prepare_model(&mut m).unwrap(), 0);
        assert!(plain.flow_cache().is_none());
    }

    #[test]
    fn test_training_step_records_phases() {
        let mut trainer = CoatTrainer::new(config(), NumericCapabilities::fp8()).unwrap();
        let mut m = model();
        trainer.prepare_model(&mut m).unwrap();
        let mut opt = trainer.create_optimizer(m.parameters(), 1e-3).unwrap();
        assert!(opt.quant_config().use_fp8_m1);

        let x = Tensor::randn_seeded((3, 4), DType::F32, 7).unwrap();
        let before = m.parameters()[0].to_f64_vec().unwrap();
        let metrics = trainer
            .training_step(&m, &mut opt, 0, |pass| {
                let out = pass.forward(&x)?;
                let loss = out.square()?.mean_all()?;
                let grads = pass
                    .model()
                    .parameters()
                    .iter()
                    .map(|p| Tensor::ones(p.shape().clone(), p.dtype()).map(Some))
                    .collect::<Result<Vec<_>>>()?;
                Ok((loss, grads))
            })
            .unwrap();

        assert!(metrics.loss.is_finite());
        assert!(metrics.activation_cache_bytes > 0);
        assert!(metrics.optimizer_state_bytes > 0);
        assert_ne!(m.parameters()[0].to_f64_vec().unwrap(), before);

        let phases: Vec<_> = trainer.memory_samples().iter().map(|s| s.phase).collect();
        assert_eq!(
            phases,
            vec![
                StepPhase::BeforeForward,
                StepPhase::AfterBackward,
                StepPhase::AfterOptimizerStep
            ]
        );
        // states are created lazily by the first update
        assert_eq!(trainer.memory_samples()[1].optimizer_state_bytes, 0);

        let report = trainer.memory_report().unwrap();
        assert_eq!(report.total_samples, 3);
        assert_eq!(report.peak_optimizer_state_bytes, metrics.optimizer_state_bytes);
        assert_eq!(report.peak_activation_cache_bytes, metrics.activation_cache_bytes);
    }

    #[test]
    fn test_sample_history_is_bounded() {
        let cfg = config().with_memory_sample_capacity(2);
        let mut trainer = CoatTrainer::new(cfg, NumericCapabilities::fp8()).unwrap();
        let m = model();
        let mut opt = trainer.create_optimizer(m.parameters(), 1e-3).unwrap();
        for step in 0..2 {
            trainer
                .training_step(&m, &mut opt, step, |pass| {
                    let grads = pass
                        .model()
                        .parameters()
                        .iter()
                        .map(|p| Tensor::ones(p.shape().clone(), p.dtype()).map(Some))
                        .collect::<Result<Vec<_>>>()?;
                    Ok((1.0, grads))
                })
                .unwrap();
        }

        let kept: Vec<_> = trainer.memory_samples().iter().map(|s| (s.step, s.phase)).collect();
        assert_eq!(
            kept,
            vec![(1, StepPhase::AfterBackward), (1, StepPhase::AfterOptimizerStep)]
        );
        // the report still covers the evicted samples
        let report = trainer.memory_report().unwrap();
        assert_eq!(report.total_samples, 6);
        assert_eq!(report.peak_optimizer_state_bytes, opt.state_memory_bytes());
        // states appear after the first update: 0, 0, s, s, s, s
        let s = opt.state_memory_bytes() as f64;
        assert!((report.avg_optimizer_state_bytes - s * 4.0 / 6.0).abs() < 1e-9);

        trainer.reset_memory_stats();
        assert!(trainer.memory_report().is_none());
        assert!(trainer.memory_samples().is_empty());
    }

    #[test]
    fn test_no_report_without_samples() {
        let mut trainer =
            CoatTrainer::new(config().with_memory_stats(false), NumericCapabilities::fp8()).unwrap();
        let m = model();
        let mut opt = trainer.create_optimizer(m.parameters(), 1e-3).unwrap();
        trainer
            .training_step(&m, &mut opt, 0, |_| Ok((0.0, vec![None, None])))
            .unwrap();
        assert!(trainer.memory_report().is_none());
        assert_eq!(opt.steps(), 1);
    }
}
