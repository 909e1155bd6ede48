// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Token models the unlearning loop can drive.

use crate::dataset::TokenBatch;
use crate::layers::embedding::Embedding;
use crate::layers::linear::Linear;
use crate::layers::lora::LoraConfig;
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};

/// Causal token model whose linear layers can host named adapters.
///
/// Implementors expose their linear layers through the two visitors; adapter
/// management is derived from them.
pub trait LanguageModel: Module {
    fn vocab_size(&self) -> usize;

    fn visit_linears(&self, visitor: &mut dyn FnMut(&Linear) -> PureResult<()>) -> PureResult<()>;

    fn visit_linears_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Linear) -> PureResult<()>,
    ) -> PureResult<()>;

    /// `(batch * seq_len, vocab)` next-token logits.
    fn logits(&self, batch: &TokenBatch) -> PureResult<Tensor> {
        self.forward(&batch.to_tensor()?)
    }

    /// Accumulates parameter gradients for a loss whose gradient with respect
    /// to the logits is `grad_logits`.
    fn backward_logits(&mut self, batch: &TokenBatch, grad_logits: &Tensor) -> PureResult<()> {
        self.backward(&batch.to_tensor()?, grad_logits)?;
        Ok(())
    }

    fn linear_names(&self) -> PureResult<Vec<String>> {
        let mut names = Vec::new();
        self.visit_linears(&mut |linear| {
            names.push(linear.name().to_string());
            Ok(())
        })?;
        Ok(names)
    }

    /// Attaches adapter `name` to every targeted linear layer and returns how
    /// many layers received it. Matching nothing is an error.
    fn add_adapter(&mut self, name: &str, config: &LoraConfig) -> PureResult<usize> {
        let mut targeted = 0usize;
        self.visit_linears(&mut |linear| {
            if !config.targets(linear.name()) {
                return Ok(());
            }
            if linear.adapter(name).is_some() {
                return Err(TensorError::InvalidValue {
                    label: "duplicate_adapter",
                });
            }
            targeted += 1;
            Ok(())
        })?;
        if targeted == 0 {
            return Err(TensorError::InvalidValue {
                label: "lora_target_modules",
            });
        }
        self.visit_linears_mut(&mut |linear| {
            if config.targets(linear.name()) {
                linear.add_adapter(name, config)?;
            }
            Ok(())
        })?;
        tracing::debug!(adapter = name, rank = config.rank, layers = targeted, "attached adapter");
        Ok(targeted)
    }

    /// Drops adapter `name` everywhere, returning how many layers carried it.
    fn delete_adapter(&mut self, name: &str) -> PureResult<usize> {
        let mut removed = 0usize;
        self.visit_linears_mut(&mut |linear| {
            if linear.delete_adapter(name) {
                removed += 1;
            }
            Ok(())
        })?;
        Ok(removed)
    }

    /// Folds adapter `name` into the base weights everywhere.
    fn merge_adapter(&mut self, name: &str) -> PureResult<usize> {
        let mut merged = 0usize;
        self.visit_linears_mut(&mut |linear| {
            if linear.merge_adapter(name)? {
                merged += 1;
            }
            Ok(())
        })?;
        tracing::debug!(adapter = name, layers = merged, "merged adapter into base weights");
        Ok(merged)
    }

    fn set_active_adapters(&mut self, names: &[&str]) -> PureResult<()> {
        self.visit_linears_mut(&mut |linear| {
            linear.set_active_adapters(names);
            Ok(())
        })
    }

    /// Union of the adapters active on any layer, sorted.
    fn active_adapters(&self) -> PureResult<Vec<String>> {
        let mut active = std::collections::BTreeSet::new();
        self.visit_linears(&mut |linear| {
            active.extend(linear.active_adapters().iter().cloned());
            Ok(())
        })?;
        Ok(active.into_iter().collect())
    }
}

/// Shape of a [`TinyLm`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TinyLmConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub d_hidden: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for TinyLmConfig {
    fn default() -> Self {
        TinyLmConfig {
            vocab_size: 64,
            d_model: 16,
            d_hidden: 32,
            seed: Some(0),
        }
    }
}

/// One residual MLP block between an embedding table and an output head.
///
/// ```text
/// h      = embed[x]
/// logits = head(h + mlp.down(relu(mlp.up(h))))
/// ```
///
/// Each position only sees its own token, which keeps backward passes exact
/// and cheap while still giving the unlearning loop attention-free layers to
/// intervene on.
#[derive(Clone, Debug)]
pub struct TinyLm {
    config: TinyLmConfig,
    embed: Embedding,
    up: Linear,
    down: Linear,
    head: Linear,
}

impl TinyLm {
    pub fn new(config: TinyLmConfig) -> PureResult<Self> {
        let seed = config.seed;
        Ok(Self {
            embed: Embedding::new("embed", config.vocab_size, config.d_model, seed)?,
            up: Linear::new("mlp.up", config.d_model, config.d_hidden, true, seed)?,
            down: Linear::new("mlp.down", config.d_hidden, config.d_model, true, seed)?,
            head: Linear::new("head", config.d_model, config.vocab_size, false, seed)?,
            config,
        })
    }

    /// Every weight zero. Logits are uniform whatever the input.
    pub fn zeros(config: TinyLmConfig) -> PureResult<Self> {
        let (v, d, h) = (config.vocab_size, config.d_model, config.d_hidden);
        Ok(Self {
            embed: Embedding::from_weights("embed", Tensor::zeros(v, d)?)?,
            up: Linear::from_weights("mlp.up", Tensor::zeros(d, h)?, true)?,
            down: Linear::from_weights("mlp.down", Tensor::zeros(h, d)?, true)?,
            head: Linear::from_weights("head", Tensor::zeros(d, v)?, false)?,
            config,
        })
    }

    pub fn config(&self) -> &TinyLmConfig {
        &self.config
    }

    fn activations(&self, input: &Tensor) -> PureResult<Activations> {
        let hidden = self.embed.forward(input)?;
        let pre = self.up.forward(&hidden)?;
        let mut act = pre.clone();
        act.relu_inplace();
        let mut residual = self.down.forward(&act)?;
        residual.add_scaled(&hidden, 1.0)?;
        Ok(Activations {
            hidden,
            pre,
            act,
            residual,
        })
    }
}

struct Activations {
    hidden: Tensor,
    pre: Tensor,
    act: Tensor,
    residual: Tensor,
}

impl Module for TinyLm {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let acts = self.activations(input)?;
        self.head.forward(&acts.residual)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let acts = self.activations(input)?;
        let grad_residual = self.head.backward(&acts.residual, grad_output)?;
        let grad_act = self.down.backward(&acts.act, &grad_residual)?;
        let grad_pre = grad_act.zip_map(&acts.pre, |g, u| if u > 0.0 { g } else { 0.0 })?;
        let mut grad_hidden = self.up.backward(&acts.hidden, &grad_pre)?;
        grad_hidden.add_scaled(&grad_residual, 1.0)?;
        self.embed.backward(input, &grad_hidden)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.embed.visit_parameters(visitor)?;
        self.up.visit_parameters(visitor)?;
        self.down.visit_parameters(visitor)?;
        self.head.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.embed.visit_parameters_mut(visitor)?;
        self.up.visit_parameters_mut(visitor)?;
        self.down.visit_parameters_mut(visitor)?;
        self.head.visit_parameters_mut(visitor)
    }
}

impl LanguageModel for TinyLm {
    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn visit_linears(&self, visitor: &mut dyn FnMut(&Linear) -> PureResult<()>) -> PureResult<()> {
        visitor(&self.up)?;
        visitor(&self.down)?;
        visitor(&self.head)
    }

    fn visit_linears_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Linear) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.up)?;
        visitor(&mut self.down)?;
        visitor(&mut self.head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::TokenLoss;

    fn small() -> TinyLm {
        TinyLm::new(TinyLmConfig {
            vocab_size: 5,
            d_model: 3,
            d_hidden: 4,
            seed: Some(11),
        })
        .unwrap()
    }

    fn batch() -> TokenBatch {
        TokenBatch::new(vec![vec![0, 3, 1, 4], vec![2, 2, 0, 1]]).unwrap()
    }

    fn loss(model: &TinyLm, batch: &TokenBatch) -> f32 {
        let logits = model.logits(batch).unwrap();
        TokenLoss::CrossEntropy.forward(&logits, batch).unwrap()
    }

    fn perturbed(model: &TinyLm, name: &str, index: usize, delta: f32) -> TinyLm {
        let mut nudged = model.clone();
        nudged
            .visit_parameters_mut(&mut |param| {
                if param.name() == name {
                    param.value_mut().data_mut()[index] += delta;
                }
                Ok(())
            })
            .unwrap();
        nudged
    }

    #[test]
    fn zero_model_predicts_uniformly() {
        let model = TinyLm::zeros(TinyLmConfig {
            vocab_size: 7,
            d_model: 2,
            d_hidden: 2,
            seed: None,
        })
        .unwrap();
        let batch = TokenBatch::new(vec![vec![1, 2, 3], vec![6, 5, 4]]).unwrap();
        assert!((loss(&model, &batch) - 7f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut model = small();
        let batch = batch();
        let logits = model.logits(&batch).unwrap();
        let (_, grad_logits) = TokenLoss::CrossEntropy
            .forward_backward(&logits, &batch)
            .unwrap();
        model.backward_logits(&batch, &grad_logits).unwrap();
        let grads = model.gradients().unwrap();

        // Parameters past the nonlinearity never move a pre-activation, so
        // their central differences are free of relu kinks.
        let mut checks = vec![("head.weight", 0usize), ("head.weight", 7), ("mlp.down.weight", 2)];
        let pre = model
            .up
            .forward(&model.embed.forward(&batch.to_tensor().unwrap()).unwrap())
            .unwrap();
        let clear_of_kink = pre.data().iter().all(|u| u.abs() > 1e-2);
        if clear_of_kink {
            checks.extend([("mlp.up.weight", 1usize), ("mlp.up.bias", 0), ("embed.weight", 6)]);
        }

        let eps = 1e-3f32;
        for (name, index) in checks {
            let numeric = (loss(&perturbed(&model, name, index, eps), &batch)
                - loss(&perturbed(&model, name, index, -eps), &batch))
                / (2.0 * eps);
            let analytic = grads[name].data()[index];
            assert!(
                (numeric - analytic).abs() < 5e-3,
                "{name}[{index}]: numeric {numeric} analytic {analytic}"
            );
        }
    }

    #[test]
    fn adapters_follow_target_modules() {
        let mut model = small();
        let config = LoraConfig::new(1).with_targets(["up"]).with_seed(3);
        assert_eq!(model.add_adapter("relearn_lora", &config).unwrap(), 1);
        assert!(model.add_adapter("relearn_lora", &config).is_err());
        assert!(model
            .add_adapter("x", &LoraConfig::new(1).with_targets(["attn"]))
            .is_err());

        model.set_active_adapters(&["relearn_lora"]).unwrap();
        assert_eq!(model.active_adapters().unwrap(), vec!["relearn_lora"]);
        let names = model.parameter_names().unwrap();
        assert!(names.contains(&"mlp.up.relearn_lora.lora_a".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("head.relearn_lora")));

        assert_eq!(model.delete_adapter("relearn_lora").unwrap(), 1);
        assert!(model.active_adapters().unwrap().is_empty());
    }

    #[test]
    fn merged_adapter_keeps_outputs() {
        let mut model = small();
        model
            .add_adapter("ret_lora", &LoraConfig::new(2).with_seed(8))
            .unwrap();
        model.set_active_adapters(&["ret_lora"]).unwrap();
        model
            .visit_parameters_mut(&mut |param| {
                if param.name().ends_with("lora_b") {
                    let shape = param.value().shape();
                    param.load_value(&Tensor::from_fn(shape.0, shape.1, |r, c| {
                        0.05 * (r as f32 - c as f32)
                    })?)?;
                }
                Ok(())
            })
            .unwrap();
        let batch = batch();
        let before = model.logits(&batch).unwrap();
        assert_eq!(model.merge_adapter("ret_lora").unwrap(), 3);
        let after = model.logits(&batch).unwrap();
        for (a, b) in before.data().iter().zip(after.data()) {
            assert!((a - b).abs() < 1e-4);
        }
        assert_eq!(model.linear_names().unwrap(), vec!["mlp.up", "mlp.down", "head"]);
    }
}
