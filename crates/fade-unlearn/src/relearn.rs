// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::alternating::{accumulate, EvalBatches};
use crate::config::RelearnConfig;
use crate::error::{UnlearnError, UnlearnResult};
use crate::subset::{SubsetPartition, TrainableSubset, RELEARN_ADAPTER};
use fade_config::determinism;
use fade_nn::{Adam, BatchSource, LanguageModel, LoraConfig, Optimizer, TokenLoss};
use serde::{Deserialize, Serialize};

/// Loss trajectory of one relearning attack. Each entry is `(step, loss)`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RelearnReport {
    pub forget_losses: Vec<(usize, f32)>,
    pub retain_losses: Vec<(usize, f32)>,
}

impl RelearnReport {
    /// Lowest forget loss seen. NaN anywhere makes the result NaN.
    pub fn min_forget(&self) -> Option<f32> {
        self.forget_losses
            .iter()
            .map(|&(_, loss)| loss)
            .reduce(|acc, loss| {
                if acc.is_nan() || loss.is_nan() {
                    f32::NAN
                } else {
                    acc.min(loss)
                }
            })
    }

    pub fn final_forget(&self) -> Option<f32> {
        self.forget_losses.last().map(|&(_, loss)| loss)
    }
}

/// Fine-tunes a fresh low-rank adapter on forget and retain batches and
/// records how quickly the forget loss comes back.
#[derive(Clone, Debug)]
pub struct RelearnAttack {
    config: RelearnConfig,
    eval: EvalBatches,
}

impl RelearnAttack {
    pub fn new(config: RelearnConfig, eval: EvalBatches) -> UnlearnResult<Self> {
        if config.rank == 0 {
            return Err(UnlearnError::config("relearn.rank", "must be positive"));
        }
        if config.eval_every == 0 {
            return Err(UnlearnError::config("relearn.eval_every", "must be positive"));
        }
        Ok(Self { config, eval })
    }

    pub fn config(&self) -> &RelearnConfig {
        &self.config
    }

    fn record<M: LanguageModel>(
        &self,
        model: &mut M,
        partition: &mut SubsetPartition,
        step: usize,
        report: &mut RelearnReport,
    ) -> UnlearnResult<()> {
        partition.freeze_with(model, &[RELEARN_ADAPTER])?;
        let (forget, retain) = self.eval.losses(model)?;
        tracing::info!(
            step,
            forget_loss = forget,
            retain_loss = retain,
            forget_ppl = forget.exp(),
            "relearn eval"
        );
        report.forget_losses.push((step, forget));
        report.retain_losses.push((step, retain));
        Ok(())
    }

    /// Runs the attack. Each step sums the cross-entropy gradients of one
    /// forget and one retain batch before a single Adam step. The adapter is
    /// removed again afterwards, leaving `model` as it was handed in.
    pub fn run<M: LanguageModel>(
        &self,
        model: &mut M,
        forget: &mut dyn BatchSource,
        retain: &mut dyn BatchSource,
    ) -> UnlearnResult<RelearnReport> {
        let config = &self.config;
        let lora = LoraConfig::new(config.rank)
            .with_alpha(config.alpha)
            .with_targets(config.target_modules.iter().cloned())
            .with_seed(determinism::derive_seed(config.seed, RELEARN_ADAPTER));
        model.add_adapter(RELEARN_ADAPTER, &lora)?;

        let result = self.attack(model, forget, retain);

        model.delete_adapter(RELEARN_ADAPTER)?;
        model.set_active_adapters(&[])?;
        model.only_grad_on(&|_: &str| false)?;
        result
    }

    fn attack<M: LanguageModel>(
        &self,
        model: &mut M,
        forget: &mut dyn BatchSource,
        retain: &mut dyn BatchSource,
    ) -> UnlearnResult<RelearnReport> {
        let steps = self.config.steps;
        let mut partition = SubsetPartition::new(model, std::iter::empty())?;
        let mut optimizer = Adam::new(partition.relearn_group(), self.config.lr)?;
        let mut report = RelearnReport::default();
        if steps == 0 {
            self.record(model, &mut partition, 0, &mut report)?;
            return Ok(report);
        }
        for step in 1..=steps {
            partition.activate(model, TrainableSubset::Relearn)?;
            let forget_batch = forget.next_batch()?;
            let retain_batch = retain.next_batch()?;
            let forget_loss = accumulate(model, &forget_batch, TokenLoss::CrossEntropy)?;
            let retain_loss = accumulate(model, &retain_batch, TokenLoss::CrossEntropy)?;
            optimizer.step(model)?;
            tracing::trace!(step, forget_loss, retain_loss, "relearn step");
            if step % self.config.eval_every == 0 || step == steps {
                self.record(model, &mut partition, step, &mut report)?;
            }
        }
        Ok(report)
    }
}
