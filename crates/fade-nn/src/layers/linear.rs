// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::layers::lora::{LoraAdapter, LoraConfig};
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use fade_config::determinism;
use std::collections::BTreeMap;

/// Fully-connected layer `x @ W + b` that can host named low-rank adapters.
///
/// Only adapters listed as active take part in forward and backward passes.
/// Gradients are not divided by the batch size; losses already average.
#[derive(Clone, Debug)]
pub struct Linear {
    name: String,
    weight: Parameter,
    bias: Option<Parameter>,
    adapters: BTreeMap<String, LoraAdapter>,
    active: Vec<String>,
}

impl Linear {
    /// Creates a layer with weights drawn uniformly from `±1/sqrt(input_dim)`.
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        bias: bool,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: output_dim,
            });
        }
        let name = name.into();
        let bound = 1.0 / (input_dim as f32).sqrt();
        let seed = seed.map(|seed| determinism::derive_seed(seed, &name));
        let weights = Tensor::random_uniform(input_dim, output_dim, -bound, bound, seed)?;
        Self::from_weights(name, weights, bias)
    }

    /// Creates a layer around explicit weights with a zero bias.
    pub fn from_weights(name: impl Into<String>, weights: Tensor, bias: bool) -> PureResult<Self> {
        let name = name.into();
        let bias = if bias {
            Some(Parameter::new(
                format!("{name}.bias"),
                Tensor::zeros(1, weights.shape().1)?,
            ))
        } else {
            None
        };
        Ok(Self {
            weight: Parameter::new(format!("{name}.weight"), weights),
            bias,
            adapters: BTreeMap::new(),
            active: Vec::new(),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    pub fn adapter(&self, name: &str) -> Option<&LoraAdapter> {
        self.adapters.get(name)
    }

    pub fn adapter_names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    /// Attaches a fresh adapter. It stays inactive until selected.
    pub fn add_adapter(&mut self, adapter: &str, config: &LoraConfig) -> PureResult<()> {
        if self.adapters.contains_key(adapter) {
            return Err(TensorError::InvalidValue {
                label: "duplicate_adapter",
            });
        }
        let (input_dim, output_dim) = self.weight.value().shape();
        let lora = LoraAdapter::new(&self.name, adapter, input_dim, output_dim, config)?;
        self.adapters.insert(adapter.to_string(), lora);
        Ok(())
    }

    /// Selects which adapters take part in the next passes. Names this layer
    /// does not carry are ignored so callers can broadcast one selection to
    /// every layer.
    pub fn set_active_adapters(&mut self, adapters: &[&str]) {
        self.active = adapters
            .iter()
            .filter(|name| self.adapters.contains_key(**name))
            .map(|name| name.to_string())
            .collect();
    }

    pub fn active_adapters(&self) -> &[String] {
        &self.active
    }

    /// Removes an adapter without touching the base weight.
    pub fn delete_adapter(&mut self, adapter: &str) -> bool {
        self.active.retain(|name| name != adapter);
        self.adapters.remove(adapter).is_some()
    }

    /// Folds an adapter into the base weight and removes it.
    pub fn merge_adapter(&mut self, adapter: &str) -> PureResult<bool> {
        let Some(lora) = self.adapters.get(adapter) else {
            return Ok(false);
        };
        let delta = lora.delta()?;
        self.weight.value_mut().add_scaled(&delta, 1.0)?;
        self.delete_adapter(adapter);
        Ok(true)
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.shape().1 != self.weight.value().shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: self.weight.value().shape(),
            });
        }
        let mut out = input.matmul(self.weight.value())?;
        if let Some(bias) = self.bias.as_ref() {
            out.add_row_inplace(bias.value().data())?;
        }
        for name in &self.active {
            if let Some(lora) = self.adapters.get(name) {
                lora.forward_into(input, &mut out)?;
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape().0 != grad_output.shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        if self.weight.requires_grad() {
            let grad_w = input.transpose().matmul(grad_output)?;
            self.weight.accumulate_euclidean(&grad_w)?;
        }
        if let Some(bias) = self.bias.as_mut() {
            if bias.requires_grad() {
                let summed = grad_output.sum_axis0();
                let grad_b = Tensor::from_vec(1, summed.len(), summed)?;
                bias.accumulate_euclidean(&grad_b)?;
            }
        }

        let mut grad_input = grad_output.matmul(&self.weight.value().transpose())?;
        for name in &self.active {
            if let Some(lora) = self.adapters.get_mut(name) {
                lora.backward_into(input, grad_output, &mut grad_input)?;
            }
        }
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = self.bias.as_ref() {
            visitor(bias)?;
        }
        for lora in self.adapters.values() {
            lora.visit(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = self.bias.as_mut() {
            visitor(bias)?;
        }
        for lora in self.adapters.values_mut() {
            lora.visit_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer() -> Linear {
        let weights = Tensor::from_vec(3, 2, vec![0.1, -0.2, 0.3, 0.4, -0.5, 0.6]).unwrap();
        Linear::from_weights("fc", weights, true).unwrap()
    }

    #[test]
    fn linear_forward_matches_manual() {
        let layer = layer();
        let input = Tensor::from_vec(1, 3, vec![1.0, -2.0, 0.5]).unwrap();
        let output = layer.forward(&input).unwrap();
        let expected = input.matmul(layer.weight.value()).unwrap();
        assert_eq!(output, expected);
    }

    #[test]
    fn inactive_adapters_are_invisible() {
        let mut layer = layer();
        layer
            .add_adapter("adv_lora", &LoraConfig::new(1).with_seed(1))
            .unwrap();
        let input = Tensor::from_vec(2, 3, vec![1.0, 0.0, -1.0, 0.5, 0.5, 0.5]).unwrap();
        let before = layer.forward(&input).unwrap();

        let grad = Tensor::from_vec(2, 2, vec![1.0, 1.0, 1.0, 1.0]).unwrap();
        layer.backward(&input, &grad).unwrap();
        let lora = layer.adapter("adv_lora").unwrap();
        assert!(lora.a().gradient().is_none());
        assert!(lora.b().gradient().is_none());
        assert_eq!(layer.forward(&input).unwrap(), before);
    }

    #[test]
    fn backward_matches_finite_differences_with_adapter() {
        let mut layer = layer();
        layer
            .add_adapter("ret_lora", &LoraConfig::new(2).with_seed(5))
            .unwrap();
        layer.set_active_adapters(&["ret_lora"]);
        // Give B a non-zero value so both factors carry gradient.
        layer
            .visit_parameters_mut(&mut |param| {
                if param.name().ends_with("lora_b") {
                    let shape = param.value().shape();
                    let value = Tensor::from_fn(shape.0, shape.1, |r, c| 0.1 * (r + c + 1) as f32)?;
                    param.load_value(&value)?;
                }
                Ok(())
            })
            .unwrap();

        let input = Tensor::from_vec(2, 3, vec![0.3, -0.7, 1.1, 0.2, 0.4, -0.9]).unwrap();
        // loss = sum(output), so grad_output is all ones.
        let ones = Tensor::from_vec(2, 2, vec![1.0; 4]).unwrap();
        let grad_input = layer.backward(&input, &ones).unwrap();

        let loss = |layer: &Linear, input: &Tensor| -> f32 {
            layer.forward(input).unwrap().data().iter().sum()
        };
        let eps = 1e-3f32;
        for idx in 0..input.len() {
            let mut plus = input.clone();
            plus.data_mut()[idx] += eps;
            let mut minus = input.clone();
            minus.data_mut()[idx] -= eps;
            let numeric = (loss(&layer, &plus) - loss(&layer, &minus)) / (2.0 * eps);
            assert!((numeric - grad_input.data()[idx]).abs() < 1e-2);
        }

        let grads = layer.gradients().unwrap();
        let grad_a = &grads["fc.ret_lora.lora_a"];
        let mut nudged = layer.clone();
        nudged
            .visit_parameters_mut(&mut |param| {
                if param.name() == "fc.ret_lora.lora_a" {
                    param.value_mut().data_mut()[0] += eps;
                }
                Ok(())
            })
            .unwrap();
        let numeric = (loss(&nudged, &input) - loss(&layer, &input)) / eps;
        assert!((numeric - grad_a.data()[0]).abs() < 1e-2);
    }

    #[test]
    fn merge_folds_adapter_into_weight() {
        let mut layer = layer();
        layer
            .add_adapter("ret_lora", &LoraConfig::new(1).with_seed(2))
            .unwrap();
        layer.set_active_adapters(&["ret_lora"]);
        layer
            .visit_parameters_mut(&mut |param| {
                if param.name().ends_with("lora_b") {
                    param.value_mut().data_mut()[0] = 0.25;
                }
                Ok(())
            })
            .unwrap();
        let input = Tensor::from_vec(1, 3, vec![1.0, 2.0, 3.0]).unwrap();
        let with_adapter = layer.forward(&input).unwrap();
        assert!(layer.merge_adapter("ret_lora").unwrap());
        assert!(layer.adapter("ret_lora").is_none());
        assert!(layer.active_adapters().is_empty());
        let merged = layer.forward(&input).unwrap();
        for (a, b) in with_adapter.data().iter().zip(merged.data()) {
            assert!((a - b).abs() < 1e-5);
        }
        assert!(!layer.merge_adapter("ret_lora").unwrap());
    }
}
