// Fp8AdamW — AdamW with optimizer states stored in FP8
//
// Adam keeps two moments per parameter, doubling (in FP32, tripling with
// master weights) the memory of the model itself. Fp8AdamW keeps both moments
// as grouped FP8 blocks between steps and widens them only for the update:
//
//   for every parameter with a gradient:
//     1. state ← arena[i], created lazily (zero moments, step 0)
//     2. t ← t + 1
//     3. p ← p · (1 - lr · weight_decay)          (decoupled decay)
//     4. m, v ← dequantize(state)
//     5. m ← β1·m + (1-β1)·g
//        v ← β2·v + (1-β2)·g²
//     6. p ← p - (lr / (1-β1^t)) · m / (sqrt(v) / sqrt(1-β2^t) + ε)
//     7. state ← quantize(m), quantize(v)          (or full precision)
//
// Each parameter is updated independently; the arena is updated in parallel
// with rayon, every slot exclusively owned by one worker.
//
// With both moments disabled in QuantizationConfig this is plain AdamW.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use coat_core::capability::NumericCapabilities;
use coat_core::dtype::DType;
use coat_core::error::{Error, Result};
use coat_core::fp8::Fp8Format;
use coat_core::shape::Shape;
use coat_core::tensor::Tensor;

use crate::block::QuantizedBlock;
use crate::quantizer::{GroupQuantizer, DEFAULT_GROUP_SIZE};

/// Trait every optimizer in this crate implements.
pub trait Optimizer {
    /// Apply one update. `grads[i]` belongs to the i-th parameter given at
    /// construction; `None` skips that parameter.
    fn step(&mut self, grads: &[Option<Tensor>]) -> Result<()>;

    /// Current learning rate.
    fn learning_rate(&self) -> f64;

    /// Replace the learning rate (e.g. from a scheduler).
    fn set_learning_rate(&mut self, lr: f64);
}

// Configuration

/// AdamW hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamParams {
    pub lr: f64,
    pub betas: (f64, f64),
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

impl AdamParams {
    /// Defaults with the given learning rate.
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            ..Self::default()
        }
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.betas = (beta1, beta2);
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// `InvalidArgument` for a negative lr, a beta outside [0, 1), a
    /// non-positive eps or a negative weight decay.
    pub fn validate(&self) -> Result<()> {
        if !(self.lr >= 0.0) {
            return Err(Error::invalid(format!("invalid learning rate: {}", self.lr)));
        }
        let (b1, b2) = self.betas;
        if !(0.0..1.0).contains(&b1) {
            return Err(Error::invalid(format!("invalid beta parameter at index 0: {b1}")));
        }
        if !(0.0..1.0).contains(&b2) {
            return Err(Error::invalid(format!("invalid beta parameter at index 1: {b2}")));
        }
        if !(self.eps > 0.0) {
            return Err(Error::invalid(format!("invalid epsilon value: {}", self.eps)));
        }
        if !(self.weight_decay >= 0.0) {
            return Err(Error::invalid(format!(
                "invalid weight_decay value: {}",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

/// How the two Adam moments are stored between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    /// Store the first moment in FP8.
    pub use_fp8_m1: bool,
    /// Store the second moment in FP8.
    pub use_fp8_m2: bool,
    pub m1_format: Fp8Format,
    pub m2_format: Fp8Format,
    /// Elements per quantization group.
    pub block_size: usize,
    pub use_dynamic_range_expansion: bool,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            use_fp8_m1: true,
            use_fp8_m2: true,
            m1_format: Fp8Format::E4M3,
            m2_format: Fp8Format::E4M3,
            block_size: DEFAULT_GROUP_SIZE,
            use_dynamic_range_expansion: true,
        }
    }
}

impl QuantizationConfig {
    /// Both moments in full precision.
    pub fn full_precision() -> Self {
        Self {
            use_fp8_m1: false,
            use_fp8_m2: false,
            ..Self::default()
        }
    }

    pub fn with_fp8_moments(mut self, m1: bool, m2: bool) -> Self {
        self.use_fp8_m1 = m1;
        self.use_fp8_m2 = m2;
        self
    }

    pub fn with_formats(mut self, m1: Fp8Format, m2: Fp8Format) -> Self {
        self.m1_format = m1;
        self.m2_format = m2;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_range_expansion(mut self, enabled: bool) -> Self {
        self.use_dynamic_range_expansion = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::invalid("block_size must be positive, got 0"));
        }
        Ok(())
    }
}

// State

/// Storage of one moment buffer.
#[derive(Debug, Clone)]
pub enum MomentStorage {
    Full(Tensor),
    Quantized(QuantizedBlock),
}

impl MomentStorage {
    fn zeros(param: &Tensor) -> Result<Self> {
        Ok(MomentStorage::Full(Tensor::zeros_like(param)?))
    }

    /// Widened values of the moment.
    fn load(&self) -> Result<Vec<f64>> {
        match self {
            MomentStorage::Full(t) => t.to_f64_vec(),
            MomentStorage::Quantized(b) => GroupQuantizer::decode_values(b),
        }
    }

    fn store(
        values: Vec<f64>,
        param: &Tensor,
        quantize: Option<Fp8Format>,
        use_expansion: bool,
        quantizer: &GroupQuantizer,
    ) -> Result<Self> {
        let t = Tensor::from_f64_vec(values, param.shape().clone(), param.dtype())?;
        match quantize {
            Some(format) => Ok(MomentStorage::Quantized(quantizer.quantize(
                &t,
                format,
                use_expansion,
            )?)),
            None => Ok(MomentStorage::Full(t)),
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, MomentStorage::Quantized(_))
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            MomentStorage::Full(t) => t.size_in_bytes(),
            MomentStorage::Quantized(b) => b.size_bytes(),
        }
    }

    /// Dequantized (or copied) contents as a tensor.
    pub fn to_tensor(&self) -> Result<Tensor> {
        match self {
            MomentStorage::Full(t) => Tensor::from_f64_vec(t.to_f64_vec()?, t.shape().clone(), t.dtype()),
            MomentStorage::Quantized(b) => Tensor::from_f64_vec(
                GroupQuantizer::decode_values(b)?,
                b.original_shape().clone(),
                b.original_dtype(),
            ),
        }
    }

    fn shape(&self) -> &Shape {
        match self {
            MomentStorage::Full(t) => t.shape(),
            MomentStorage::Quantized(b) => b.original_shape(),
        }
    }
}

/// Per-parameter Adam state.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub step_count: u64,
    pub exp_avg: MomentStorage,
    pub exp_avg_sq: MomentStorage,
}

impl OptimizerState {
    fn zeros(param: &Tensor) -> Result<Self> {
        Ok(Self {
            step_count: 0,
            exp_avg: MomentStorage::zeros(param)?,
            exp_avg_sq: MomentStorage::zeros(param)?,
        })
    }

    pub fn size_bytes(&self) -> usize {
        self.exp_avg.size_bytes() + self.exp_avg_sq.size_bytes()
    }
}

struct ParamSlot {
    param: Tensor,
    state: Option<OptimizerState>,
}

/// Inputs shared by every slot update within one step.
struct StepContext<'a> {
    hp: AdamParams,
    quant: &'a QuantizationConfig,
    quantizer: &'a GroupQuantizer,
}

fn check_grad_shape(param: &Tensor, grad: &Tensor) -> Result<()> {
    if grad.shape() != param.shape() {
        return Err(Error::ShapeMismatch {
            expected: param.shape().clone(),
            got: grad.shape().clone(),
        });
    }
    Ok(())
}

fn update_slot(slot: &mut ParamSlot, grad: &Tensor, ctx: &StepContext<'_>) -> Result<()> {
    if slot.state.is_none() {
        slot.state = Some(OptimizerState::zeros(&slot.param)?);
    }
    let Some(state) = slot.state.as_mut() else {
        return Err(Error::msg("optimizer state missing after initialization"));
    };
    state.step_count += 1;

    let AdamParams {
        lr,
        betas: (beta1, beta2),
        eps,
        weight_decay,
    } = ctx.hp;

    let mut p = slot.param.to_f64_vec()?;
    if weight_decay != 0.0 {
        let decay = 1.0 - lr * weight_decay;
        p.iter_mut().for_each(|v| *v *= decay);
    }

    let mut m = state.exp_avg.load()?;
    let mut v = state.exp_avg_sq.load()?;
    let g = grad.to_f64_vec()?;

    let t = state.step_count as i32;
    let bc1 = 1.0 - beta1.powi(t);
    let bc2_sqrt = (1.0 - beta2.powi(t)).sqrt();
    let step_size = lr / bc1;

    for i in 0..p.len() {
        m[i] = beta1 * m[i] + (1.0 - beta1) * g[i];
        v[i] = beta2 * v[i] + (1.0 - beta2) * g[i] * g[i];
        let denom = v[i].sqrt() / bc2_sqrt + eps;
        p[i] -= step_size * m[i] / denom;
    }
    slot.param.update_data_inplace(&p)?;

    let q = ctx.quant;
    let expand = q.use_dynamic_range_expansion;
    state.exp_avg = MomentStorage::store(
        m,
        &slot.param,
        q.use_fp8_m1.then_some(q.m1_format),
        expand,
        ctx.quantizer,
    )?;
    state.exp_avg_sq = MomentStorage::store(
        v,
        &slot.param,
        q.use_fp8_m2.then_some(q.m2_format),
        expand,
        ctx.quantizer,
    )?;
    Ok(())
}

/// AdamW whose moments live in grouped FP8 between steps.
///
/// # Example
/// ```ignore
/// let mut opt = Fp8AdamW::new(
///     model.parameters(),
///     AdamParams::new(1e-3),
///     QuantizationConfig::default(),
///     NumericCapabilities::detect(),
/// )?;
/// for batch in data {
///     let grads = compute_gradients(&model, batch)?;
///     opt.step(&grads)?;
/// }
/// ```
pub struct Fp8AdamW {
    slots: Vec<ParamSlot>,
    hp: AdamParams,
    quant: QuantizationConfig,
    quantizer: GroupQuantizer,
    steps: u64,
}

impl Fp8AdamW {
    /// `InvalidArgument` if the hyperparameters or the quantization config
    /// are out of range.
    pub fn new(
        params: Vec<Tensor>,
        hp: AdamParams,
        quant: QuantizationConfig,
        caps: NumericCapabilities,
    ) -> Result<Self> {
        hp.validate()?;
        quant.validate()?;
        let quantizer = GroupQuantizer::new(quant.block_size, caps)?;
        let slots = params
            .into_iter()
            .map(|param| ParamSlot { param, state: None })
            .collect();
        Ok(Self {
            slots,
            hp,
            quant,
            quantizer,
            steps: 0,
        })
    }

    /// The parameter handles, in construction order.
    pub fn params(&self) -> Vec<Tensor> {
        self.slots.iter().map(|s| s.param.clone()).collect()
    }

    pub fn num_params(&self) -> usize {
        self.slots.len()
    }

    pub fn hyperparams(&self) -> &AdamParams {
        &self.hp
    }

    pub fn quant_config(&self) -> &QuantizationConfig {
        &self.quant
    }

    /// Number of `step` calls so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// State of the `index`-th parameter, `None` before its first update.
    pub fn state(&self, index: usize) -> Option<&OptimizerState> {
        self.slots.get(index).and_then(|s| s.state.as_ref())
    }

    /// Bytes held by every optimizer state.
    pub fn state_memory_bytes(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.state.as_ref())
            .map(OptimizerState::size_bytes)
            .sum()
    }

    /// Evaluate `closure` for the loss and gradients, then step.
    pub fn step_with<F>(&mut self, closure: F) -> Result<f64>
    where
        F: FnOnce() -> Result<(f64, Vec<Option<Tensor>>)>,
    {
        let (loss, grads) = closure()?;
        Optimizer::step(self, &grads)?;
        Ok(loss)
    }

    /// Snapshot of hyperparameters and every per-parameter state.
    pub fn export_state(&self) -> Result<Fp8AdamState> {
        let params = self
            .slots
            .iter()
            .map(|slot| slot.state.as_ref().map(ParamStateSnapshot::capture).transpose())
            .collect::<Result<Vec<_>>>()?;
        Ok(Fp8AdamState {
            hyperparams: self.hp,
            quantization: self.quant,
            steps: self.steps,
            params,
        })
    }

    /// Restore a snapshot produced by [`export_state`](Self::export_state).
    ///
    /// The snapshot must describe the same number of parameters with the
    /// same shapes; nothing is modified when it does not.
    pub fn load_state(&mut self, state: Fp8AdamState) -> Result<()> {
        state.hyperparams.validate()?;
        state.quantization.validate()?;
        if state.params.len() != self.slots.len() {
            return Err(Error::invalid(format!(
                "state has {} parameters, optimizer has {}",
                state.params.len(),
                self.slots.len()
            )));
        }

        let restored = self
            .slots
            .iter()
            .zip(state.params)
            .map(|(slot, snap)| snap.map(|s| s.restore(&slot.param)).transpose())
            .collect::<Result<Vec<_>>>()?;

        self.quantizer =
            GroupQuantizer::new(state.quantization.block_size, self.quantizer.capabilities())?;
        self.hp = state.hyperparams;
        self.quant = state.quantization;
        self.steps = state.steps;
        for (slot, s) in self.slots.iter_mut().zip(restored) {
            slot.state = s;
        }
        Ok(())
    }
}

impl Optimizer for Fp8AdamW {
    fn step(&mut self, grads: &[Option<Tensor>]) -> Result<()> {
        if grads.len() != self.slots.len() {
            return Err(Error::invalid(format!(
                "expected {} gradients, got {}",
                self.slots.len(),
                grads.len()
            )));
        }
        // All shapes are checked before any slot moves, so a failed step
        // leaves every parameter and state as it was.
        for (slot, grad) in self.slots.iter().zip(grads) {
            if let Some(g) = grad {
                check_grad_shape(&slot.param, g)?;
            }
        }
        let ctx = StepContext {
            hp: self.hp,
            quant: &self.quant,
            quantizer: &self.quantizer,
        };
        self.slots
            .par_iter_mut()
            .zip(grads.par_iter())
            .try_for_each(|(slot, grad)| match grad {
                Some(g) => update_slot(slot, g, &ctx),
                None => Ok(()),
            })?;

        self.steps += 1;
        tracing::debug!(
            step = self.steps,
            updated = grads.iter().filter(|g| g.is_some()).count(),
            state_bytes = self.state_memory_bytes(),
            "fp8 adamw step"
        );
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.hp.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.hp.lr = lr;
    }
}

// Serializable state

/// Serializable form of one moment buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MomentSnapshot {
    Full {
        shape: Shape,
        dtype: DType,
        values: Vec<f64>,
    },
    Quantized(QuantizedBlock),
}

impl MomentSnapshot {
    fn capture(m: &MomentStorage) -> Result<Self> {
        Ok(match m {
            MomentStorage::Full(t) => MomentSnapshot::Full {
                shape: t.shape().clone(),
                dtype: t.dtype(),
                values: t.to_f64_vec()?,
            },
            MomentStorage::Quantized(b) => MomentSnapshot::Quantized(b.clone()),
        })
    }

    fn restore(self, param: &Tensor) -> Result<MomentStorage> {
        let storage = match self {
            MomentSnapshot::Full {
                shape,
                dtype,
                values,
            } => MomentStorage::Full(Tensor::from_f64_vec(values, shape, dtype)?),
            MomentSnapshot::Quantized(b) => {
                b.validate()?;
                MomentStorage::Quantized(b)
            }
        };
        if storage.shape() != param.shape() {
            return Err(Error::ShapeMismatch {
                expected: param.shape().clone(),
                got: storage.shape().clone(),
            });
        }
        Ok(storage)
    }
}

/// Serializable form of one [`OptimizerState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamStateSnapshot {
    pub step_count: u64,
    pub exp_avg: MomentSnapshot,
    pub exp_avg_sq: MomentSnapshot,
}

impl ParamStateSnapshot {
    fn capture(s: &OptimizerState) -> Result<Self> {
        Ok(Self {
            step_count: s.step_count,
            exp_avg: MomentSnapshot::capture(&s.exp_avg)?,
            exp_avg_sq: MomentSnapshot::capture(&s.exp_avg_sq)?,
        })
    }

    fn restore(self, param: &Tensor) -> Result<OptimizerState> {
        Ok(OptimizerState {
            step_count: self.step_count,
            exp_avg: self.exp_avg.restore(param)?,
            exp_avg_sq: self.exp_avg_sq.restore(param)?,
        })
    }
}

/// Everything needed to resume an [`Fp8AdamW`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fp8AdamState {
    pub hyperparams: AdamParams,
    pub quantization: QuantizationConfig,
    pub steps: u64,
    /// One entry per parameter; `None` for parameters never updated.
    pub params: Vec<Option<ParamStateSnapshot>>,
}
