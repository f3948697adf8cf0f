// Activation modules — Wrappers around tensor activation functions
//
// Thin wrappers that turn tensor-level activations (tensor.relu(), ...) into
// Module implementations so they compose in Sequential. All of them declare
// UnitKind::Nonlinear.
//
// Identity is the odd one out: a parameterless passthrough of kind Other,
// handy as a placeholder while a tree rewrite moves a child out of its slot.

use coat_core::error::Result;
use coat_core::tensor::Tensor;

use crate::module::{Module, UnitKind};

macro_rules! nonlinear_unit {
    ($(#[$doc:meta])* $name:ident, $op:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Module for $name {
            fn forward(&self, x: &Tensor) -> Result<Tensor> {
                x.$op()
            }
            fn parameters(&self) -> Vec<Tensor> {
                vec![]
            }
            fn kind(&self) -> UnitKind {
                UnitKind::Nonlinear
            }
            fn name(&self) -> String {
                stringify!($name).to_string()
            }
        }
    };
}

nonlinear_unit!(
    /// ReLU activation: max(0, x)
    ReLU,
    relu
);

nonlinear_unit!(
    /// GELU activation (tanh approximation), used in transformer MLPs
    GeLU,
    gelu
);

nonlinear_unit!(
    /// SiLU / Swish activation: x * σ(x)
    SiLU,
    silu
);

nonlinear_unit!(
    /// Sigmoid activation: 1 / (1 + e^(-x))
    Sigmoid,
    sigmoid
);

nonlinear_unit!(
    /// Tanh activation
    Tanh,
    tanh
);

/// Passthrough unit: returns its input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Module for Identity {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.clone())
    }
    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
    fn name(&self) -> String {
        "Identity".to_string()
    }
}
