//! # coat-nn
//!
//! Computation units for the COAT FP8 training engine, following the
//! [`Module`] trait pattern:
//!
//! 1. **Module trait** — every unit implements `forward()` and declares a [`UnitKind`]
//! 2. **Linear** — fully connected: `y = xW^T + b`
//! 3. **LayerNorm** — normalization over the last dimension
//! 4. **Activations** — ReLU, GELU, SiLU, Sigmoid, Tanh as modules
//! 5. **Sequential** / **Identity** — containers and passthroughs
//!
//! The unit kind is what the FP8 activation flow uses to pick between
//! whole-tensor and grouped scaling.

pub mod activation;
pub mod layernorm;
pub mod linear;
pub mod module;
pub mod sequential;

pub use activation::{GeLU, Identity, ReLU, SiLU, Sigmoid, Tanh};
pub use layernorm::LayerNorm;
pub use linear::Linear;
pub use module::{Module, UnitKind};
pub use sequential::Sequential;
