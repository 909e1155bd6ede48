// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Step-level unlearning state machine.
//!
//! Every step runs three sub-steps in a fixed order, each under its own
//! [`TrainableSubset`]:
//!
//! 1. retain: cross-entropy on a retain batch, disruption update, then the
//!    retain optimiser once warmup is over;
//! 2. unlearn: backward on a forget batch for the mask signal, then the
//!    intervened weights move along `mask ⊙ direction` with plain SGD;
//! 3. adversary: the adversary adapter trains on the same forget batch.
//!
//! During warmup only the disruption scores move. Every `eval_every` steps
//! the [`EvaluationGate`] inspects held-out losses and may prune the trial.

use crate::circuit::Circuit;
use crate::config::{OptimizerKind, RetainMode, TrialParams, UnlearnConfig, UpdateDirection};
use crate::disruption::DisruptionScoreTracker;
use crate::error::UnlearnResult;
use crate::gate::{Baseline, EvalSnapshot, EvaluationGate, GateVerdict, PruneReason};
use crate::intervention::ParameterInterventionSet;
use crate::mask::{CircuitMaskSelector, MaskStrategy};
use crate::subset::{SubsetPartition, TrainableSubset, ADVERSARY_ADAPTER, RETAIN_ADAPTER};
use fade_config::determinism;
use fade_nn::{
    Adam, BatchSource, LanguageModel, LoraConfig, LrScheduler, Optimizer, ParamGroup, PureResult,
    Sgd, Tensor, TensorError, TokenBatch, TokenLoss, WarmupGrowthScheduler,
};
use std::collections::HashMap;

/// Fixed held-out batches every evaluation runs on.
#[derive(Clone, Debug)]
pub struct EvalBatches {
    pub forget: TokenBatch,
    pub retain: TokenBatch,
}

impl EvalBatches {
    /// `(forget, retain)` cross-entropy under whatever adapters are active.
    pub fn losses<M: LanguageModel + ?Sized>(&self, model: &M) -> PureResult<(f32, f32)> {
        Ok((eval_loss(model, &self.forget)?, eval_loss(model, &self.retain)?))
    }

    /// Losses of `model` with every adapter switched off.
    pub fn baseline<M: LanguageModel + ?Sized>(&self, model: &mut M) -> PureResult<Baseline> {
        let previous = model.active_adapters()?;
        model.set_active_adapters(&[])?;
        let (forget, retain) = self.losses(model)?;
        let previous: Vec<&str> = previous.iter().map(String::as_str).collect();
        model.set_active_adapters(&previous)?;
        Ok(Baseline { forget, retain })
    }
}

pub fn eval_loss<M: LanguageModel + ?Sized>(model: &M, batch: &TokenBatch) -> PureResult<f32> {
    TokenLoss::CrossEntropy.forward(&model.logits(batch)?, batch)
}

/// Forward and backward of `loss` on `batch` into the currently tracked
/// parameters. Returns the loss value.
pub(crate) fn accumulate<M: LanguageModel + ?Sized>(
    model: &mut M,
    batch: &TokenBatch,
    loss: TokenLoss,
) -> PureResult<f32> {
    let logits = model.logits(batch)?;
    let (value, grad) = loss.forward_backward(&logits, batch)?;
    model.backward_logits(batch, &grad)?;
    Ok(value)
}

pub(crate) fn build_optimizer(
    kind: OptimizerKind,
    group: ParamGroup,
    lr: f32,
) -> PureResult<Box<dyn Optimizer>> {
    Ok(match kind {
        OptimizerKind::Sgd => Box::new(Sgd::new(group, lr)?),
        OptimizerKind::Adam => Box::new(Adam::new(group, lr)?),
    })
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnlearnStats {
    pub loss: f32,
    pub lr: f32,
    pub selected: usize,
    pub total: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopOutcome {
    Completed,
    Pruned { step: usize, reason: PruneReason },
}

pub struct AlternatingTrainingLoop {
    unlearn_steps: usize,
    warmup: usize,
    direction: UpdateDirection,
    unlearn_loss: TokenLoss,
    quantile: f64,
    interventions: ParameterInterventionSet,
    partition: SubsetPartition,
    tracker: DisruptionScoreTracker,
    selector: CircuitMaskSelector,
    retain_opt: Box<dyn Optimizer>,
    base_opt: Sgd,
    scheduler: WarmupGrowthScheduler,
    adversary_opt: Option<Box<dyn Optimizer>>,
    gate: EvaluationGate,
    eval: EvalBatches,
    retain_ok: bool,
    step: usize,
    history: Vec<EvalSnapshot>,
}

impl AlternatingTrainingLoop {
    /// Attaches the retain and adversary adapters the configuration asks for,
    /// selects the intervened weights, and builds one optimiser per subset.
    pub fn new<M: LanguageModel>(
        model: &mut M,
        config: &UnlearnConfig,
        params: &TrialParams,
        circuit: &Circuit,
        baseline: Baseline,
        eval: EvalBatches,
    ) -> UnlearnResult<Self> {
        params.validate()?;
        let interventions =
            ParameterInterventionSet::select(model, &config.target_modules, circuit)?;

        if config.retain_mode == RetainMode::Adapter {
            let lora = LoraConfig::new(params.ret_lora_rank)
                .with_alpha(config.ret_lora.alpha)
                .with_targets(config.ret_lora.target_modules.iter().cloned())
                .with_seed(determinism::derive_seed(config.seed, RETAIN_ADAPTER));
            model.add_adapter(RETAIN_ADAPTER, &lora)?;
        }
        if let Some(adversary) = &config.adversary {
            let lora = LoraConfig::new(params.adv_lora_rank)
                .with_alpha(adversary.alpha)
                .with_targets(adversary.target_modules.iter().cloned())
                .with_seed(determinism::derive_seed(config.seed, ADVERSARY_ADAPTER));
            model.add_adapter(ADVERSARY_ADAPTER, &lora)?;
        }

        let mut partition = SubsetPartition::new(model, interventions.names())?;
        let retain_opt = match config.retain_mode {
            RetainMode::Adapter => build_optimizer(
                config.ret_lora.optimizer,
                partition.retain_adapter_group(),
                params.retaining_rate,
            )?,
            RetainMode::Intervened => Box::new(Sgd::new(
                partition.intervened_group(),
                params.retaining_rate,
            )?),
        };
        let adversary_opt = match &config.adversary {
            Some(adversary) => Some(build_optimizer(
                adversary.optimizer,
                partition.adversary_group(),
                params.adv_lora_lr,
            )?),
            None => None,
        };
        let base_opt = Sgd::new(partition.intervened_group(), params.unlearning_rate)?;
        let scheduler = WarmupGrowthScheduler::new(
            params.unlearning_rate,
            params.unlearn_lr_mult,
            config.unlearn_lr_warmup,
        )?;
        partition.activate(model, TrainableSubset::Frozen)?;

        tracing::debug!(
            intervened = interventions.len(),
            retain_mode = ?config.retain_mode,
            adversary = config.adversary.is_some(),
            "unlearning loop ready"
        );
        Ok(Self {
            unlearn_steps: config.unlearn_steps,
            warmup: config.disruption_score_warmup,
            direction: config.update_direction,
            unlearn_loss: config.unlearn_loss,
            quantile: params.quantile,
            interventions,
            partition,
            tracker: DisruptionScoreTracker::new(params.disruption_score_decay, params.retain_amp)?,
            selector: CircuitMaskSelector::new(MaskStrategy::from_params(config.mask, params)),
            retain_opt,
            base_opt,
            scheduler,
            adversary_opt,
            gate: EvaluationGate::new(config.gate.clone(), baseline, config.eval_every),
            eval,
            retain_ok: true,
            step: 0,
            history: Vec::new(),
        })
    }

    /// Completed steps so far.
    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn in_warmup(&self) -> bool {
        self.step < self.warmup
    }

    pub fn retain_ok(&self) -> bool {
        self.retain_ok
    }

    pub fn history(&self) -> &[EvalSnapshot] {
        &self.history
    }

    pub fn interventions(&self) -> &ParameterInterventionSet {
        &self.interventions
    }

    pub fn partition(&self) -> &SubsetPartition {
        &self.partition
    }

    pub fn gate(&self) -> &EvaluationGate {
        &self.gate
    }

    pub fn unlearning_rate(&self) -> f32 {
        self.base_opt.learning_rate()
    }

    /// Retain backward, disruption update, and (after warmup) the retain
    /// optimiser step. Returns the retain loss.
    pub fn retain_substep<M: LanguageModel>(
        &mut self,
        model: &mut M,
        batch: &TokenBatch,
    ) -> UnlearnResult<f32> {
        self.partition.activate(model, TrainableSubset::Retain)?;
        let loss = accumulate(model, batch, TokenLoss::CrossEntropy)?;
        let grads = model.gradients()?;
        self.tracker.update(&mut self.interventions, &grads)?;
        if !self.in_warmup() {
            self.retain_opt.step(model)?;
        }
        Ok(loss)
    }

    /// Masked update of the intervened weights. `None` when the soft retain
    /// valve is closed and the sub-step was skipped.
    pub fn unlearn_substep<M: LanguageModel>(
        &mut self,
        model: &mut M,
        batch: &TokenBatch,
    ) -> UnlearnResult<Option<UnlearnStats>> {
        if !self.retain_ok {
            return Ok(None);
        }
        self.partition.activate(model, TrainableSubset::Intervened)?;
        let loss = accumulate(model, batch, self.unlearn_loss)?;
        let grads = model.gradients()?;
        let lr = self.scheduler.step_optimizer(&mut self.base_opt)?;

        let threshold = if self.selector.needs_threshold() {
            let mut scores = Vec::with_capacity(self.interventions.len());
            for param in self.interventions.iter() {
                if let Some(score) = self.selector.derived_score(param, grads.get(param.name()))? {
                    scores.push(score);
                }
            }
            Some(CircuitMaskSelector::threshold(self.quantile, &scores)?)
        } else {
            None
        };

        let mut updates: HashMap<String, Tensor> = HashMap::new();
        let (mut selected, mut total) = (0usize, 0usize);
        for param in self.interventions.iter() {
            let grad = grads.get(param.name());
            let mask = self.selector.mask(param, grad, threshold)?;
            selected += mask.count();
            total += mask.len();
            let direction = match self.direction {
                UpdateDirection::Circuit => param.to_forget(),
                UpdateDirection::Gradient { .. } => grad.ok_or_else(|| {
                    TensorError::MissingParameter {
                        name: param.name().to_string(),
                    }
                })?,
            };
            updates.insert(param.name().to_string(), mask.apply(direction)?);
        }
        if let UpdateDirection::Gradient { normalize: true } = self.direction {
            let norm = updates
                .values()
                .map(|t| t.squared_l2_norm() as f64)
                .sum::<f64>()
                .sqrt() as f32;
            if norm > 0.0 && norm.is_finite() {
                for update in updates.values_mut() {
                    *update = update.scale(1.0 / norm)?;
                }
            }
        }

        model.visit_parameters_mut(&mut |param| {
            if let Some(update) = updates.remove(param.name()) {
                param.set_gradient(Some(update))?;
            }
            Ok(())
        })?;
        self.base_opt.step(model)?;
        tracing::trace!(step = self.step, lr, selected, total, "unlearn sub-step");
        Ok(Some(UnlearnStats {
            loss,
            lr,
            selected,
            total,
        }))
    }

    /// Cross-entropy step of the adversary adapter. `None` without adversary.
    pub fn adversary_substep<M: LanguageModel>(
        &mut self,
        model: &mut M,
        batch: &TokenBatch,
    ) -> UnlearnResult<Option<f32>> {
        let Some(optimizer) = self.adversary_opt.as_mut() else {
            return Ok(None);
        };
        self.partition.activate(model, TrainableSubset::Adversary)?;
        let loss = accumulate(model, batch, TokenLoss::CrossEntropy)?;
        optimizer.step(model)?;
        Ok(Some(loss))
    }

    /// Held-out losses with the retain adapter alone and, when present, with
    /// the adversary on top.
    pub fn evaluate<M: LanguageModel>(&mut self, model: &mut M) -> UnlearnResult<EvalSnapshot> {
        let retain_only: &[&str] = if self.partition.has_retain_adapter() {
            &[RETAIN_ADAPTER]
        } else {
            &[]
        };
        self.partition.freeze_with(model, retain_only)?;
        let (base_forget, base_retain) = self.eval.losses(model)?;
        let (adv_forget, adv_retain) = if self.partition.has_adversary() {
            let adapters = self.partition.forward_adapters(TrainableSubset::Adversary);
            self.partition.freeze_with(model, &adapters)?;
            let (forget, retain) = self.eval.losses(model)?;
            (Some(forget), Some(retain))
        } else {
            (None, None)
        };
        Ok(EvalSnapshot {
            step: self.step,
            base_forget,
            base_retain,
            adv_forget,
            adv_retain,
        })
    }

    /// One full step followed by the gate when it is due. Returns the prune
    /// reason if the gate stopped the trial.
    pub fn step<M: LanguageModel>(
        &mut self,
        model: &mut M,
        forget: &mut dyn BatchSource,
        retain: &mut dyn BatchSource,
    ) -> UnlearnResult<Option<PruneReason>> {
        let retain_batch = retain.next_batch()?;
        let retain_loss = self.retain_substep(model, &retain_batch)?;
        if !self.in_warmup() {
            let forget_batch = forget.next_batch()?;
            let unlearn = self.unlearn_substep(model, &forget_batch)?;
            let adversary = self.adversary_substep(model, &forget_batch)?;
            tracing::debug!(
                step = self.step + 1,
                retain_loss,
                unlearn_loss = unlearn.map(|s| s.loss),
                coverage = unlearn.map(|s| s.selected as f32 / s.total.max(1) as f32),
                adversary_loss = adversary,
                "step"
            );
        }
        self.partition.activate(model, TrainableSubset::Frozen)?;
        self.step += 1;

        if !self.gate.should_evaluate(self.step) {
            return Ok(None);
        }
        let snapshot = self.evaluate(model)?;
        self.partition.activate(model, TrainableSubset::Frozen)?;
        tracing::info!(
            step = snapshot.step,
            base_forget = snapshot.base_forget,
            base_retain = snapshot.base_retain,
            adv_forget = snapshot.adv_forget,
            adv_retain = snapshot.adv_retain,
            forget_ppl = snapshot.base_forget_ppl(),
            retain_ppl = snapshot.base_retain_ppl(),
            "eval"
        );
        self.history.push(snapshot);
        match self.gate.judge(self.step, &snapshot) {
            GateVerdict::Prune(reason) => Ok(Some(reason)),
            GateVerdict::Continue { retain_ok } => {
                if self.retain_ok != retain_ok {
                    tracing::debug!(step = self.step, retain_ok, "retain valve changed");
                }
                self.retain_ok = retain_ok;
                Ok(None)
            }
        }
    }

    /// Steps until `unlearn_steps` or until the gate prunes.
    pub fn run<M: LanguageModel>(
        &mut self,
        model: &mut M,
        forget: &mut dyn BatchSource,
        retain: &mut dyn BatchSource,
    ) -> UnlearnResult<LoopOutcome> {
        while self.step < self.unlearn_steps {
            if let Some(reason) = self.step(model, forget, retain)? {
                tracing::warn!(step = self.step, reason = reason.as_str(), "pruning trial");
                return Ok(LoopOutcome::Pruned {
                    step: self.step,
                    reason,
                });
            }
        }
        Ok(LoopOutcome::Completed)
    }

    /// Drops the adversary and folds the retain adapter into the base
    /// weights, leaving a plain model with nothing tracking gradients.
    pub fn finalize<M: LanguageModel>(&mut self, model: &mut M) -> UnlearnResult<()> {
        model.delete_adapter(ADVERSARY_ADAPTER)?;
        model.merge_adapter(RETAIN_ADAPTER)?;
        model.set_active_adapters(&[])?;
        self.partition = SubsetPartition::new(model, self.interventions.names())?;
        self.partition.activate(model, TrainableSubset::Frozen)?;
        self.adversary_opt = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fade_nn::{ConstantBatches, Module, TinyLm, TinyLmConfig};

    fn model() -> TinyLm {
        TinyLm::new(TinyLmConfig {
            vocab_size: 6,
            d_model: 4,
            d_hidden: 5,
            seed: Some(3),
        })
        .unwrap()
    }

    fn batch(offset: u32) -> TokenBatch {
        TokenBatch::new(vec![
            vec![offset % 6, (offset + 1) % 6, (offset + 2) % 6],
            vec![(offset + 3) % 6, (offset + 4) % 6, (offset + 5) % 6],
        ])
        .unwrap()
    }

    fn circuit(model: &TinyLm) -> Circuit {
        Circuit::new(
            model
                .state_dict()
                .unwrap()
                .into_iter()
                .map(|(name, value)| (name, value.map(|v| v.signum() * 0.1)))
                .collect(),
        )
    }

    fn config() -> UnlearnConfig {
        UnlearnConfig {
            unlearn_steps: 6,
            eval_every: 3,
            disruption_score_warmup: 2,
            gate: crate::config::GateConfig {
                retain_margin: 100.0,
                soft_retain_margin: None,
                stagnation_step: 1000,
                adversary_ceiling: None,
                ..Default::default()
            },
            ..UnlearnConfig::default()
        }
    }

    fn params() -> TrialParams {
        TrialParams {
            quantile: 0.5,
            unlearning_rate: 0.05,
            disruption_score_decay: 0.5,
            ret_lora_rank: 1,
            ..TrialParams::default()
        }
    }

    fn setup(config: &UnlearnConfig) -> (TinyLm, AlternatingTrainingLoop) {
        let mut model = model();
        let circuit = circuit(&model);
        let eval = EvalBatches {
            forget: batch(0),
            retain: batch(1),
        };
        let baseline = eval.baseline(&mut model).unwrap();
        let lp =
            AlternatingTrainingLoop::new(&mut model, config, &params(), &circuit, baseline, eval)
                .unwrap();
        (model, lp)
    }

    #[test]
    fn warmup_only_moves_disruption_scores() {
        let (mut model, mut lp) = setup(&config());
        let before = model.state_dict().unwrap();
        let mut forget = ConstantBatches::new(batch(0));
        let mut retain = ConstantBatches::new(batch(1));
        lp.step(&mut model, &mut forget, &mut retain).unwrap();
        assert_eq!(model.state_dict().unwrap(), before);
        let score = lp.interventions().get("mlp.up.weight").unwrap().disruption_score();
        assert!(score.data().iter().any(|&v| v > 0.0));
    }

    #[test]
    fn unlearning_moves_only_masked_weights() {
        let (mut model, mut lp) = setup(&config());
        let mut forget = ConstantBatches::new(batch(0));
        let mut retain = ConstantBatches::new(batch(1));
        for _ in 0..2 {
            lp.step(&mut model, &mut forget, &mut retain).unwrap();
        }
        assert!(!lp.in_warmup());
        lp.retain_substep(&mut model, &batch(1)).unwrap();
        let before = model.state_dict().unwrap();
        let stats = lp.unlearn_substep(&mut model, &batch(0)).unwrap().unwrap();
        let after = model.state_dict().unwrap();
        assert!(stats.selected > 0 && stats.selected < stats.total);
        let moved: usize = ["mlp.up.weight", "mlp.down.weight"]
            .iter()
            .map(|name| {
                before[*name]
                    .data()
                    .iter()
                    .zip(after[*name].data())
                    .filter(|(a, b)| a != b)
                    .count()
            })
            .sum();
        assert!(moved <= stats.selected);
        assert!(moved > 0);
    }

    #[test]
    fn run_completes_and_records_history() {
        let (mut model, mut lp) = setup(&config());
        let mut forget = ConstantBatches::new(batch(0));
        let mut retain = ConstantBatches::new(batch(1));
        let outcome = lp.run(&mut model, &mut forget, &mut retain).unwrap();
        assert_eq!(outcome, LoopOutcome::Completed);
        assert_eq!(lp.step_count(), 6);
        let steps: Vec<usize> = lp.history().iter().map(|s| s.step).collect();
        assert_eq!(steps, vec![3, 6]);
        assert!(lp.history().iter().all(|s| s.adv_forget.is_some()));

        lp.finalize(&mut model).unwrap();
        let names = model.parameter_names().unwrap();
        assert!(names.iter().all(|n| !n.contains("lora")));
        assert!(model.active_adapters().unwrap().is_empty());
    }

    #[test]
    fn closed_retain_valve_skips_unlearning() {
        let (mut model, mut lp) = setup(&config());
        lp.retain_ok = false;
        assert!(lp.unlearn_substep(&mut model, &batch(0)).unwrap().is_none());
    }
}
