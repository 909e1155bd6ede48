// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Parameter;
use crate::{PureResult, Tensor, TensorError};
use fade_config::determinism;
use serde::{Deserialize, Serialize};

fn default_alpha() -> f32 {
    8.0
}

/// Shape and placement of a low-rank adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub rank: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    /// Linear layers that receive the adapter. An entry matches a layer whose
    /// name equals it or ends with `.<entry>`; an empty list targets every
    /// linear layer.
    #[serde(default)]
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl LoraConfig {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            alpha: default_alpha(),
            target_modules: Vec::new(),
            seed: None,
        }
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_modules = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Whether a linear layer called `layer` should carry this adapter.
    pub fn targets(&self, layer: &str) -> bool {
        if self.target_modules.is_empty() {
            return true;
        }
        self.target_modules.iter().any(|target| {
            layer == target
                || layer
                    .strip_suffix(target.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

/// Low-rank update `scale * A @ B` attached to one linear layer.
///
/// `A` starts from a small uniform draw and `B` from zero, so a freshly
/// attached adapter leaves the layer output unchanged.
#[derive(Clone, Debug)]
pub struct LoraAdapter {
    a: Parameter,
    b: Parameter,
    scale: f32,
}

impl LoraAdapter {
    pub fn new(
        layer: &str,
        adapter: &str,
        input_dim: usize,
        output_dim: usize,
        config: &LoraConfig,
    ) -> PureResult<Self> {
        if config.rank == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: config.rank,
            });
        }
        if !config.alpha.is_finite() || config.alpha <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "lora_alpha",
            });
        }
        let label = format!("{layer}.{adapter}");
        let seed = config
            .seed
            .map(|seed| determinism::derive_seed(seed, &label));
        let bound = 1.0 / (input_dim as f32).sqrt();
        let a = Tensor::random_uniform(input_dim, config.rank, -bound, bound, seed)?;
        let b = Tensor::zeros(config.rank, output_dim)?;
        Ok(Self {
            a: Parameter::new(format!("{label}.lora_a"), a),
            b: Parameter::new(format!("{label}.lora_b"), b),
            scale: config.alpha / config.rank as f32,
        })
    }

    pub fn a(&self) -> &Parameter {
        &self.a
    }

    pub fn b(&self) -> &Parameter {
        &self.b
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Dense update this adapter contributes to the base weight.
    pub fn delta(&self) -> PureResult<Tensor> {
        self.a.value().matmul(self.b.value())?.scale(self.scale)
    }

    /// Adds `scale * input @ A @ B` to `out`.
    pub(crate) fn forward_into(&self, input: &Tensor, out: &mut Tensor) -> PureResult<()> {
        let hidden = input.matmul(self.a.value())?;
        let update = hidden.matmul(self.b.value())?;
        out.add_scaled(&update, self.scale)
    }

    /// Accumulates adapter gradients and adds the adapter's share of the
    /// input gradient into `grad_input`.
    pub(crate) fn backward_into(
        &mut self,
        input: &Tensor,
        grad_output: &Tensor,
        grad_input: &mut Tensor,
    ) -> PureResult<()> {
        let grad_hidden = grad_output.matmul(&self.b.value().transpose())?;
        if self.b.requires_grad() {
            let hidden = input.matmul(self.a.value())?;
            let grad_b = hidden.transpose().matmul(grad_output)?.scale(self.scale)?;
            self.b.accumulate_euclidean(&grad_b)?;
        }
        if self.a.requires_grad() {
            let grad_a = input.transpose().matmul(&grad_hidden)?.scale(self.scale)?;
            self.a.accumulate_euclidean(&grad_a)?;
        }
        let through = grad_hidden.matmul(&self.a.value().transpose())?;
        grad_input.add_scaled(&through, self.scale)
    }

    pub(crate) fn visit(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.a)?;
        visitor(&self.b)
    }

    pub(crate) fn visit_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.a)?;
        visitor(&mut self.b)
    }
}
