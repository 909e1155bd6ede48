// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{UnlearnError, UnlearnResult};
use crate::intervention::ParameterInterventionSet;
use fade_nn::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Exponentially decayed retain-gradient magnitude per intervened weight:
/// `score <- score * decay + |grad|^amp`.
///
/// Non-finite gradients flow into the score unchanged; the evaluation gate
/// is what notices the resulting NaNs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisruptionScoreTracker {
    decay: f32,
    amp: f32,
}

impl DisruptionScoreTracker {
    pub fn new(decay: f32, amp: f32) -> UnlearnResult<Self> {
        if !(0.0..1.0).contains(&decay) {
            return Err(UnlearnError::config(
                "disruption_score_decay",
                format!("{decay} not in [0, 1)"),
            ));
        }
        if !amp.is_finite() || amp <= 0.0 {
            return Err(UnlearnError::config("retain_amp", format!("{amp} must be positive")));
        }
        Ok(Self { decay, amp })
    }

    pub fn decay(&self) -> f32 {
        self.decay
    }

    pub fn amp(&self) -> f32 {
        self.amp
    }

    /// Folds one retain backward pass into every score. `grads` must hold a
    /// gradient for each intervened weight; the gradient is also kept on the
    /// parameter for angle-based masks.
    pub fn update(
        &self,
        set: &mut ParameterInterventionSet,
        grads: &HashMap<String, Tensor>,
    ) -> PureResult<()> {
        for param in set.iter_mut() {
            let Some(grad) = grads.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            let (decay, amp) = (self.decay, self.amp);
            param.disruption_score = param
                .disruption_score
                .zip_map(grad, |score, g| score * decay + g.abs().powf(amp))?;
            param.retain_grad = Some(grad.clone());
        }
        Ok(())
    }
}
