// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use fade_config::determinism;

fn token_to_index(value: f32, vocab_size: usize) -> PureResult<usize> {
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
        return Err(TensorError::NonFiniteValue {
            label: "embedding_token",
            value,
        });
    }
    let idx = value as usize;
    if idx >= vocab_size {
        return Err(TensorError::TokenOutOfRange {
            token: idx,
            vocab: vocab_size,
        });
    }
    Ok(idx)
}

/// Embedding lookup table.
///
/// Inputs are integer token ids stored as floats in a `(tokens, 1)` tensor;
/// outputs are `(tokens, embed_dim)`. Unlike a clamping lookup, ids outside
/// the vocabulary are rejected.
#[derive(Clone, Debug)]
pub struct Embedding {
    weight: Parameter,
    vocab_size: usize,
    embed_dim: usize,
}

impl Embedding {
    pub fn new(
        name: impl Into<String>,
        vocab_size: usize,
        embed_dim: usize,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if vocab_size == 0 || embed_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: vocab_size,
                cols: embed_dim,
            });
        }
        let name = name.into();
        let seed = seed.map(|seed| determinism::derive_seed(seed, &name));
        let weight = Tensor::random_normal(vocab_size, embed_dim, 0.0, 0.5, seed)?;
        Self::from_weights(name, weight)
    }

    pub fn from_weights(name: impl Into<String>, weight: Tensor) -> PureResult<Self> {
        let (vocab_size, embed_dim) = weight.shape();
        Ok(Self {
            weight: Parameter::new(format!("{}.weight", name.into()), weight),
            vocab_size,
            embed_dim,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }
}

impl Module for Embedding {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.shape().1 != 1 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (input.shape().0, 1),
            });
        }
        let weights = self.weight.value().data();
        let mut out = Vec::with_capacity(input.len() * self.embed_dim);
        for &token in input.data() {
            let start = token_to_index(token, self.vocab_size)? * self.embed_dim;
            out.extend_from_slice(&weights[start..start + self.embed_dim]);
        }
        Tensor::from_vec(input.len(), self.embed_dim, out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let tokens = input.len();
        if grad_output.shape() != (tokens, self.embed_dim) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (tokens, self.embed_dim),
            });
        }
        if self.weight.requires_grad() {
            let mut grad_weight = vec![0.0f32; self.vocab_size * self.embed_dim];
            for (row, &token) in input.data().iter().enumerate() {
                let base = token_to_index(token, self.vocab_size)? * self.embed_dim;
                for (slot, value) in grad_weight[base..base + self.embed_dim]
                    .iter_mut()
                    .zip(grad_output.row(row))
                {
                    *slot += value;
                }
            }
            let grad_w = Tensor::from_vec(self.vocab_size, self.embed_dim, grad_weight)?;
            self.weight.accumulate_euclidean(&grad_w)?;
        }
        Tensor::zeros(tokens, 1)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)
    }
}
