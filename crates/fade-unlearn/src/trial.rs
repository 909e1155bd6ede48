// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! One end-to-end trial: unlearn, collapse adapters, relearn, score.

use crate::alternating::{AlternatingTrainingLoop, EvalBatches, LoopOutcome};
use crate::circuit::Circuit;
use crate::config::{TrialParams, UnlearnConfig};
use crate::error::UnlearnResult;
use crate::gate::{EvalSnapshot, PruneReason};
use crate::relearn::{RelearnAttack, RelearnReport};
use fade_config::determinism;
use fade_hpo::TrialOutcome;
use fade_nn::{LanguageModel, LoopingBatches, PureResult, TokenDataset};

/// Train and validation splits of both distributions.
#[derive(Clone, Debug)]
pub struct TrialData {
    pub forget_train: TokenDataset,
    pub retain_train: TokenDataset,
    pub forget_val: TokenDataset,
    pub retain_val: TokenDataset,
}

impl TrialData {
    /// First `batch_size` validation sequences of each split.
    pub fn eval_batches(&self, batch_size: usize) -> PureResult<EvalBatches> {
        Ok(EvalBatches {
            forget: self.forget_val.head(batch_size)?,
            retain: self.retain_val.head(batch_size)?,
        })
    }

    /// Shuffled infinite `(forget, retain)` training streams.
    pub fn train_sources(
        &self,
        batch_size: usize,
        seed: u64,
        label: &str,
    ) -> PureResult<(LoopingBatches, LoopingBatches)> {
        let forget_seed = determinism::derive_seed(seed, &format!("{label}.forget"));
        let retain_seed = determinism::derive_seed(seed, &format!("{label}.retain"));
        Ok((
            self.forget_train.batches(batch_size, Some(forget_seed))?,
            self.retain_train.batches(batch_size, Some(retain_seed))?,
        ))
    }
}

#[derive(Debug)]
pub enum TrialReport<M> {
    Completed {
        /// Lowest forget loss the relearning attack reached.
        fitness: f64,
        /// Unlearned model with the retain adapter merged in.
        model: M,
        relearn: RelearnReport,
        history: Vec<EvalSnapshot>,
    },
    Pruned {
        reason: PruneReason,
        step: usize,
        history: Vec<EvalSnapshot>,
    },
}

impl<M> TrialReport<M> {
    pub fn outcome(&self) -> TrialOutcome {
        match self {
            TrialReport::Completed { fitness, .. } => TrialOutcome::Complete(*fitness),
            TrialReport::Pruned { reason, .. } => TrialOutcome::pruned(reason.as_str()),
        }
    }

    pub fn prune_reason(&self) -> Option<PruneReason> {
        match self {
            TrialReport::Pruned { reason, .. } => Some(*reason),
            TrialReport::Completed { .. } => None,
        }
    }

    pub fn history(&self) -> &[EvalSnapshot] {
        match self {
            TrialReport::Completed { history, .. } | TrialReport::Pruned { history, .. } => {
                history
            }
        }
    }
}

/// Runs the alternating loop on `model` and, if the gate lets it finish,
/// the relearning attack on a copy of the collapsed result.
pub fn run_trial<M>(
    mut model: M,
    config: &UnlearnConfig,
    params: &TrialParams,
    circuit: &Circuit,
    data: &TrialData,
) -> UnlearnResult<TrialReport<M>>
where
    M: LanguageModel + Clone,
{
    let eval = data.eval_batches(config.eval_batch_size)?;
    let baseline = eval.baseline(&mut model)?;
    tracing::info!(
        init_forget = baseline.forget,
        init_retain = baseline.retain,
        "baseline"
    );

    let mut unlearning =
        AlternatingTrainingLoop::new(&mut model, config, params, circuit, baseline, eval.clone())?;
    let (mut forget, mut retain) = data.train_sources(config.batch_size, config.seed, "unlearn")?;
    let outcome = unlearning.run(&mut model, &mut forget, &mut retain)?;
    let history = unlearning.history().to_vec();
    if let LoopOutcome::Pruned { step, reason } = outcome {
        return Ok(TrialReport::Pruned {
            reason,
            step,
            history,
        });
    }
    unlearning.finalize(&mut model)?;

    let attack = RelearnAttack::new(config.relearn.clone(), eval)?;
    let (mut forget, mut retain) =
        data.train_sources(config.relearn.batch_size, config.relearn.seed, "relearn")?;
    let mut attacked = model.clone();
    let relearn = attack.run(&mut attacked, &mut forget, &mut retain)?;
    let fitness = relearn.min_forget().map_or(f64::NAN, f64::from);
    tracing::info!(fitness, final_forget = relearn.final_forget(), "trial complete");
    Ok(TrialReport::Completed {
        fitness,
        model,
        relearn,
        history,
    })
}
