// Sequential — A chain of modules applied one after another
//
//   let model = Sequential::new()
//       .add(linear1)
//       .add(ReLU)
//       .add(linear2);
//
//   let output = model.forward(&input)?;
//
// The output of each layer becomes the input to the next. Sequential is
// itself a Module (kind Other), so it nests, and it exposes its layer slots
// through children_mut() for tree rewrites.

use coat_core::error::Result;
use coat_core::tensor::Tensor;

use crate::module::Module;

/// A container that chains modules sequentially.
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    /// Create an empty Sequential.
    pub fn new() -> Self {
        Sequential { layers: Vec::new() }
    }

    /// Add a layer to the end of the sequence. Returns self for chaining.
    #[allow(clippy::should_implement_trait)]
    pub fn add<M: Module + 'static>(mut self, module: M) -> Self {
        self.layers.push(Box::new(module));
        self
    }

    /// Append an already boxed layer.
    pub fn push(&mut self, module: Box<dyn Module>) {
        self.layers.push(module);
    }

    /// The layers in execution order.
    pub fn layers(&self) -> &[Box<dyn Module>] {
        &self.layers
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the sequential is empty.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Default for Sequential {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for Sequential {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut out = x.clone();
        for layer in &self.layers {
            out = layer.forward(&out)?;
        }
        Ok(out)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn children_mut(&mut self) -> Vec<&mut Box<dyn Module>> {
        self.layers.iter_mut().collect()
    }

    fn name(&self) -> String {
        format!("Sequential[{}]", self.layers.len())
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut named = Vec::new();
        for (i, layer) in self.layers.iter().enumerate() {
            for (k, v) in layer.named_parameters() {
                named.push((format!("layers.{i}.{k}"), v));
            }
        }
        named
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Linear, ReLU};
    use coat_core::DType;

    #[test]
    fn test_chain_and_names() {
        let w = Tensor::from_f64_slice(&[1.0, -1.0], (1, 2), DType::F64).unwrap();
        let model = Sequential::new()
            .add(Linear::from_tensors(w, None).unwrap())
            .add(ReLU);
        let x = Tensor::from_f64_slice(&[1.0, 3.0, 3.0, 1.0], (2, 2), DType::F64).unwrap();
        let y = model.forward(&x).unwrap();
        assert_eq!(y.to_f64_vec().unwrap(), vec![0.0, 2.0]);

        let names: Vec<String> = model.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["layers.0.weight".to_string()]);
    }

    #[test]
    fn test_children_mut_exposes_slots() {
        let mut model = Sequential::new().add(ReLU).add(ReLU);
        assert_eq!(model.children_mut().len(), 2);
    }
}
