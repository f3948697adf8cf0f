// Module trait — The interface every computation unit implements
//
// Every layer is a plain struct implementing `Module`. The key method is
// forward(); parameters() hands the trainable tensors to an optimizer.
//
// UNIT KIND:
//
// Activation quantization picks its granularity from what a unit *is*, not
// from its concrete type. Each unit declares one tag from a closed set:
//
//   Linear        — matmul-like units: whole-tensor scaling
//   Normalization — LayerNorm and friends: grouped scaling
//   Nonlinear     — elementwise activations: grouped scaling
//   Other         — containers and passthroughs, executed as-is
//
// TREE WALKING:
//
// Containers expose their child slots through children_mut() so a pass can
// swap a child in place (e.g. wrap every Linear with an FP8 wrapper) without
// knowing the container's concrete type.

use coat_core::error::Result;
use coat_core::tensor::Tensor;

/// Closed classification of computation units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Linear,
    Normalization,
    Nonlinear,
    Other,
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnitKind::Linear => "linear",
            UnitKind::Normalization => "normalization",
            UnitKind::Nonlinear => "nonlinear",
            UnitKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// The fundamental trait for all computation units.
///
/// # Example
/// ```ignore
/// struct MyBlock {
///     linear: Linear,
/// }
///
/// impl Module for MyBlock {
///     fn forward(&self, x: &Tensor) -> Result<Tensor> {
///         self.linear.forward(x)?.relu()
///     }
///     fn parameters(&self) -> Vec<Tensor> {
///         self.linear.parameters()
///     }
/// }
/// ```
pub trait Module {
    /// Compute the output tensor from the input tensor.
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Return all trainable parameters of this module.
    ///
    /// The returned handles share storage with the module, so an optimizer
    /// updating them in place updates the module.
    fn parameters(&self) -> Vec<Tensor>;

    /// The kind of computation this unit performs (default: `Other`).
    fn kind(&self) -> UnitKind {
        UnitKind::Other
    }

    /// Whether this unit already quantizes its own input and output.
    ///
    /// Wrappers return true so tree rewrites never wrap them twice.
    fn quantizes_activations(&self) -> bool {
        false
    }

    /// Mutable access to child slots. Leaf units have none.
    fn children_mut(&mut self) -> Vec<&mut Box<dyn Module>> {
        Vec::new()
    }

    /// Short human-readable unit name used in logs.
    fn name(&self) -> String {
        self.kind().to_string()
    }

    /// Total number of scalar parameters in this module.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.elem_count()).sum()
    }

    /// Return all trainable parameters with human-readable names.
    ///
    /// The default uses positional indices (`param_0`, `param_1`, …).
    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        self.parameters()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("param_{i}"), p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display() {
        assert_eq!(UnitKind::Normalization.to_string(), "normalization");
        assert_eq!(UnitKind::Other.to_string(), "other");
    }
}
