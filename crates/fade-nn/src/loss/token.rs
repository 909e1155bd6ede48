// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::dataset::TokenBatch;
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Next-token objectives over `(batch * seq_len, vocab)` logits.
///
/// Row `b * seq_len + t` predicts token `t + 1` of sequence `b`, so the last
/// position of every sequence carries no target and receives zero gradient.
/// Every variant averages over the `batch * (seq_len - 1)` predicting rows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenLoss {
    /// Mean negative log-likelihood of the true next token.
    #[default]
    CrossEntropy,
    /// Mean raw logit of the true next token.
    CorrectLogit,
    /// Mean of the true-token logit clipped below at zero.
    ClippedCorrectLogit,
}

impl TokenLoss {
    pub const ALL: [TokenLoss; 3] = [
        TokenLoss::CrossEntropy,
        TokenLoss::CorrectLogit,
        TokenLoss::ClippedCorrectLogit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenLoss::CrossEntropy => "cross_entropy",
            TokenLoss::CorrectLogit => "correct_logit",
            TokenLoss::ClippedCorrectLogit => "clipped_correct_logit",
        }
    }

    /// Loss value only.
    pub fn forward(&self, logits: &Tensor, batch: &TokenBatch) -> PureResult<f32> {
        Ok(self.evaluate(logits, batch, false)?.0)
    }

    /// Loss value together with its gradient with respect to `logits`.
    pub fn forward_backward(
        &self,
        logits: &Tensor,
        batch: &TokenBatch,
    ) -> PureResult<(f32, Tensor)> {
        let (value, grad) = self.evaluate(logits, batch, true)?;
        let grad = match grad {
            Some(grad) => grad,
            None => Tensor::zeros(logits.shape().0, logits.shape().1)?,
        };
        Ok((value, grad))
    }

    fn evaluate(
        &self,
        logits: &Tensor,
        batch: &TokenBatch,
        with_grad: bool,
    ) -> PureResult<(f32, Option<Tensor>)> {
        let (rows, vocab) = logits.shape();
        let seq_len = batch.seq_len();
        if rows != batch.tokens().len() {
            return Err(TensorError::DataLength {
                expected: batch.tokens().len(),
                got: rows,
            });
        }
        if seq_len < 2 {
            return Err(TensorError::EmptyInput("next-token targets"));
        }
        let pairs = batch.batch_size() * (seq_len - 1);
        let inv = 1.0 / pairs as f64;
        let mut total = 0.0f64;
        let mut grad = if with_grad {
            Some(vec![0.0f32; rows * vocab])
        } else {
            None
        };

        for b in 0..batch.batch_size() {
            let sequence = batch.sequence(b);
            for t in 0..seq_len - 1 {
                let row = b * seq_len + t;
                let target = sequence[t + 1] as usize;
                if target >= vocab {
                    return Err(TensorError::TokenOutOfRange {
                        token: target,
                        vocab,
                    });
                }
                let row_logits = logits.row(row);
                let grad_row = grad
                    .as_mut()
                    .map(|g| &mut g[row * vocab..(row + 1) * vocab]);
                match self {
                    TokenLoss::CrossEntropy => {
                        let max = row_logits
                            .iter()
                            .copied()
                            .fold(f32::NEG_INFINITY, f32::max) as f64;
                        let sum: f64 = row_logits.iter().map(|&v| (v as f64 - max).exp()).sum();
                        let log_z = max + sum.ln();
                        total += log_z - row_logits[target] as f64;
                        if let Some(grad_row) = grad_row {
                            for (slot, &value) in grad_row.iter_mut().zip(row_logits) {
                                *slot = ((value as f64 - log_z).exp() * inv) as f32;
                            }
                            grad_row[target] -= inv as f32;
                        }
                    }
                    TokenLoss::CorrectLogit => {
                        total += row_logits[target] as f64;
                        if let Some(grad_row) = grad_row {
                            grad_row[target] = inv as f32;
                        }
                    }
                    TokenLoss::ClippedCorrectLogit => {
                        let value = row_logits[target];
                        total += value.max(0.0) as f64;
                        if let Some(grad_row) = grad_row {
                            if value >= 0.0 {
                                grad_row[target] = inv as f32;
                            }
                        }
                    }
                }
            }
        }

        let value = (total * inv) as f32;
        let grad = match grad {
            Some(data) => Some(Tensor::from_vec(rows, vocab, data)?),
            None => None,
        };
        Ok((value, grad))
    }
}

impl fmt::Display for TokenLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenLoss {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TokenLoss::ALL
            .into_iter()
            .find(|loss| loss.as_str() == s)
            .ok_or(TensorError::InvalidValue { label: "token_loss" })
    }
}
