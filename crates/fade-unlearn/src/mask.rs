// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Selection of the weights an unlearn sub-step may move.
//!
//! Ratio strategies derive a per-weight score, pool the scores of every
//! intervened parameter, and keep the weights below one global quantile. The
//! angle strategy needs no threshold: it keeps weights whose forget direction
//! sits inside an angular band relative to the retain gradient.

use crate::config::{MaskKind, TrialParams};
use crate::intervention::InterveneParameter;
use fade_nn::{PureResult, Tensor, TensorError};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MaskStrategy {
    /// `disruption / |to_forget|^forget_amp`.
    Ratio { forget_amp: f32 },
    /// `disruption / |forget_grad|^forget_amp`.
    GradientRatio { forget_amp: f32 },
    /// `alpha_low < angle < alpha_high` and `|to_forget| > forget_thresh`,
    /// with the angle in degrees modulo 180.
    Angle {
        forget_thresh: f32,
        alpha_low: f32,
        alpha_high: f32,
    },
}

impl MaskStrategy {
    pub fn from_params(kind: MaskKind, params: &TrialParams) -> Self {
        match kind {
            MaskKind::Ratio => MaskStrategy::Ratio {
                forget_amp: params.forget_amp,
            },
            MaskKind::GradientRatio => MaskStrategy::GradientRatio {
                forget_amp: params.forget_amp,
            },
            MaskKind::Angle => MaskStrategy::Angle {
                forget_thresh: params.forget_thresh,
                alpha_low: params.alpha_low_thresh,
                alpha_high: params.alpha_thresh,
            },
        }
    }
}

/// Boolean selection with the shape of one intervened parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mask {
    data: Vec<bool>,
    rows: usize,
    cols: usize,
}

impl Mask {
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn data(&self) -> &[bool] {
        &self.data
    }

    /// Number of selected weights.
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&keep| keep).count()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn all(&self) -> bool {
        self.data.iter().all(|&keep| keep)
    }

    pub fn as_tensor(&self) -> PureResult<Tensor> {
        Tensor::from_vec(
            self.rows,
            self.cols,
            self.data.iter().map(|&keep| if keep { 1.0 } else { 0.0 }).collect(),
        )
    }

    /// `self ⊙ tensor`, with unselected entries set to exactly zero.
    pub fn apply(&self, tensor: &Tensor) -> PureResult<Tensor> {
        if tensor.shape() != self.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: tensor.shape(),
            });
        }
        let mut data = tensor.data().to_vec();
        for (value, &keep) in data.iter_mut().zip(&self.data) {
            if !keep {
                *value = 0.0;
            }
        }
        Tensor::from_vec(self.rows, self.cols, data)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CircuitMaskSelector {
    strategy: MaskStrategy,
}

impl CircuitMaskSelector {
    pub fn new(strategy: MaskStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> MaskStrategy {
        self.strategy
    }

    pub fn needs_threshold(&self) -> bool {
        !matches!(self.strategy, MaskStrategy::Angle { .. })
    }

    /// Per-weight score compared against the pooled threshold. `None` for
    /// strategies that do not threshold. `forget_grad` is the gradient of
    /// the unlearning loss, required by [`MaskStrategy::GradientRatio`].
    pub fn derived_score(
        &self,
        param: &InterveneParameter,
        forget_grad: Option<&Tensor>,
    ) -> PureResult<Option<Tensor>> {
        let (denominator, amp) = match self.strategy {
            MaskStrategy::Ratio { forget_amp } => (param.to_forget(), forget_amp),
            MaskStrategy::GradientRatio { forget_amp } => {
                let grad = forget_grad.ok_or(TensorError::EmptyInput("forget gradient"))?;
                (grad, forget_amp)
            }
            MaskStrategy::Angle { .. } => return Ok(None),
        };
        let score = param
            .disruption_score()
            .zip_map(denominator, |disruption, d| disruption / d.abs().powf(amp))?;
        Ok(Some(score))
    }

    /// Value at sorted index `floor(quantile * N)` of the pooled scores.
    ///
    /// For `N` distinct values exactly `floor(quantile * N)` of them lie
    /// strictly below the result; ties at the threshold are all excluded.
    /// NaN scores order above every number and are never selected.
    pub fn threshold(quantile: f64, scores: &[Tensor]) -> PureResult<f32> {
        if !(quantile > 0.0 && quantile < 1.0) {
            return Err(TensorError::InvalidValue { label: "quantile" });
        }
        let mut pooled: Vec<f32> = scores
            .iter()
            .flat_map(|tensor| tensor.data().iter().copied())
            .map(|v| if v.is_nan() { f32::NAN } else { v })
            .collect();
        if pooled.is_empty() {
            return Err(TensorError::EmptyInput("mask threshold"));
        }
        let k = ((pooled.len() as f64 * quantile).floor() as usize).min(pooled.len() - 1);
        let (_, kth, _) = pooled.select_nth_unstable_by(k, f32::total_cmp);
        Ok(*kth)
    }

    /// Selection for one parameter. Ratio strategies need the pooled
    /// `threshold`; the angle strategy needs the retain gradient stored by
    /// the last disruption update.
    pub fn mask(
        &self,
        param: &InterveneParameter,
        forget_grad: Option<&Tensor>,
        threshold: Option<f32>,
    ) -> PureResult<Mask> {
        let (rows, cols) = param.shape();
        let data = match self.strategy {
            MaskStrategy::Ratio { .. } | MaskStrategy::GradientRatio { .. } => {
                let threshold = threshold.ok_or(TensorError::EmptyInput("mask threshold"))?;
                let score = self
                    .derived_score(param, forget_grad)?
                    .ok_or(TensorError::EmptyInput("derived score"))?;
                score.data().iter().map(|&s| s < threshold).collect()
            }
            MaskStrategy::Angle {
                forget_thresh,
                alpha_low,
                alpha_high,
            } => {
                let retain_grad = param
                    .retain_grad()
                    .ok_or(TensorError::EmptyInput("retain gradient"))?;
                if retain_grad.shape() != param.shape() {
                    return Err(TensorError::ShapeMismatch {
                        left: param.shape(),
                        right: retain_grad.shape(),
                    });
                }
                param
                    .to_forget()
                    .data()
                    .iter()
                    .zip(retain_grad.data())
                    .map(|(&forget, &grad)| {
                        let alpha = forget.atan2(grad).to_degrees().rem_euclid(180.0);
                        (alpha_low <= 0.0 || alpha > alpha_low)
                            && (alpha_high >= 180.0 || alpha < alpha_high)
                            && (forget_thresh <= 0.0 || forget.abs() > forget_thresh)
                    })
                    .collect()
            }
        };
        Ok(Mask { data, rows, cols })
    }
}
