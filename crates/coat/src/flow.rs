// Precision flow — FP8 activations across a model pass
//
// PrecisionFlowCache wraps every unit invocation of a forward pass:
//
//   x ──quantize(kind)──▶ x_q ──dequantize──▶ unit.forward ──quantize(kind)──▶ y_q
//                          │                                                  │
//                          └────────── cached under invocation index ─────────┘
//
// The caller gets back the dequantized y_q, so the next unit sees exactly
// what would have been stored. Units of kind Other, and units that already
// quantize their own activations (Fp8Linear), run unwrapped but still
// consume an invocation index, so indices match the position in the pass.
//
// The cache is keyed by a monotonically increasing counter; clear_cache()
// resets the counter and frees every entry. Interior state sits behind a
// Mutex so a cache can be shared by reference with a forward closure.
//
// Fp8Linear is the same idea applied to one linear unit permanently, and
// replace_linear_units() rewrites a module tree to wrap every linear leaf.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use coat_core::error::{Error, Result};
use coat_core::tensor::Tensor;
use coat_nn::{Identity, Module, Sequential, UnitKind};

use crate::activation::ActivationQuantizer;
use crate::block::QuantizedBlock;

/// Quantized input and output of one unit invocation.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub index: usize,
    pub kind: UnitKind,
    pub unit: String,
    pub input: QuantizedBlock,
    pub output: QuantizedBlock,
}

impl CacheEntry {
    pub fn size_bytes(&self) -> usize {
        self.input.size_bytes() + self.output.size_bytes()
    }
}

#[derive(Debug, Default)]
struct FlowState {
    counter: usize,
    entries: BTreeMap<usize, CacheEntry>,
}

/// Per-pass cache of quantized activations.
#[derive(Debug)]
pub struct PrecisionFlowCache {
    quantizer: ActivationQuantizer,
    state: Mutex<FlowState>,
}

impl PrecisionFlowCache {
    pub fn new(quantizer: ActivationQuantizer) -> Self {
        Self {
            quantizer,
            state: Mutex::new(FlowState::default()),
        }
    }

    pub fn quantizer(&self) -> &ActivationQuantizer {
        &self.quantizer
    }

    fn lock(&self) -> Result<MutexGuard<'_, FlowState>> {
        self.state
            .lock()
            .map_err(|_| Error::msg("precision flow cache lock poisoned"))
    }

    /// Run one unit through the FP8 precision flow.
    ///
    /// Units whose [`Module::quantizes_activations`] is true are run as-is
    /// and leave no entry, so their activations are never quantized twice.
    pub fn forward(&self, unit: &dyn Module, x: &Tensor) -> Result<Tensor> {
        let index = {
            let mut state = self.lock()?;
            let index = state.counter;
            state.counter += 1;
            index
        };

        if unit.quantizes_activations() {
            return unit.forward(x);
        }
        let kind = unit.kind();
        let Some(input) = self.quantizer.quantize_for(kind, x)? else {
            return unit.forward(x);
        };
        let x_hat = self.quantizer.dequantize(&input)?;
        let y = unit.forward(&x_hat)?;
        let output = self
            .quantizer
            .quantize_for(kind, &y)?
            .ok_or_else(|| Error::msg(format!("unit kind {kind} lost its granularity")))?;
        let y_hat = self.quantizer.dequantize(&output)?;

        tracing::trace!(index, %kind, unit = %unit.name(), "cached activations");
        self.lock()?.entries.insert(
            index,
            CacheEntry {
                index,
                kind,
                unit: unit.name(),
                input,
                output,
            },
        );
        Ok(y_hat)
    }

    /// Run every layer of a `Sequential` through the cache, in order.
    pub fn forward_sequential(&self, model: &Sequential, x: &Tensor) -> Result<Tensor> {
        let mut out = x.clone();
        for layer in model.layers() {
            out = self.forward(&**layer, &out)?;
        }
        Ok(out)
    }

    /// Drop every entry and reset the invocation counter.
    pub fn clear_cache(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.entries.clear();
        state.counter = 0;
        Ok(())
    }

    /// Number of invocations since the last clear.
    pub fn invocations(&self) -> Result<usize> {
        Ok(self.lock()?.counter)
    }

    /// Number of cached entries.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.entries.is_empty())
    }

    /// The entry recorded for invocation `index`, if that unit was quantized.
    pub fn entry(&self, index: usize) -> Result<Option<CacheEntry>> {
        Ok(self.lock()?.entries.get(&index).cloned())
    }

    /// Bytes held by all cached blocks.
    pub fn memory_bytes(&self) -> Result<usize> {
        Ok(self.lock()?.entries.values().map(CacheEntry::size_bytes).sum())
    }
}

// Fp8Linear

/// A linear unit whose input and output pass through FP8.
///
/// The wrapped unit still runs in full precision on the dequantized input.
pub struct Fp8Linear {
    inner: Box<dyn Module>,
    quantizer: ActivationQuantizer,
}

impl Fp8Linear {
    pub fn new(inner: Box<dyn Module>, quantizer: ActivationQuantizer) -> Self {
        Self { inner, quantizer }
    }

    pub fn inner(&self) -> &dyn Module {
        self.inner.as_ref()
    }

    pub fn into_inner(self) -> Box<dyn Module> {
        self.inner
    }

    fn round_trip(&self, x: &Tensor) -> Result<Tensor> {
        let g = self.quantizer.config().linear_granularity;
        self.quantizer.dequantize(&self.quantizer.quantize(x, g)?)
    }
}

impl Module for Fp8Linear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_hat = self.round_trip(x)?;
        let y = self.inner.forward(&x_hat)?;
        self.round_trip(&y)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.inner.parameters()
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Linear
    }

    fn quantizes_activations(&self) -> bool {
        true
    }

    fn name(&self) -> String {
        format!("Fp8({})", self.inner.name())
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        self.inner.named_parameters()
    }
}

/// Wrap every linear child of `model` in an [`Fp8Linear`].
///
/// With `recursive`, containers are descended into; without it only direct
/// children are considered. Units that already quantize their activations
/// are left alone.
///
/// The model is rewritten in place through `&mut`, so instead of handing the
/// model back this returns the number of units replaced.
pub fn replace_linear_units(
    model: &mut dyn Module,
    recursive: bool,
    quantizer: &ActivationQuantizer,
) -> usize {
    let mut replaced = 0;
    for slot in model.children_mut() {
        if slot.kind() == UnitKind::Linear && !slot.quantizes_activations() {
            let inner = std::mem::replace(slot, Box::new(Identity) as Box<dyn Module>);
            *slot = Box::new(Fp8Linear::new(inner, *quantizer));
            replaced += 1;
        } else if recursive {
            replaced += replace_linear_units(&mut **slot, true, quantizer);
        }
    }
    replaced
}
