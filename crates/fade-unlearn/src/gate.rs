// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::config::GateConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Losses of the untouched model on the held-out batches.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub forget: f32,
    pub retain: f32,
}

/// One evaluation row. Adversary columns are absent when the trial runs
/// without an adversary.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvalSnapshot {
    pub step: usize,
    pub base_forget: f32,
    pub base_retain: f32,
    pub adv_forget: Option<f32>,
    pub adv_retain: Option<f32>,
}

impl EvalSnapshot {
    pub fn losses(&self) -> impl Iterator<Item = f32> {
        [self.base_forget, self.base_retain]
            .into_iter()
            .chain(self.adv_forget)
            .chain(self.adv_retain)
    }

    pub fn has_nan(&self) -> bool {
        self.losses().any(|loss| !loss.is_finite())
    }

    pub fn base_forget_ppl(&self) -> f32 {
        self.base_forget.exp()
    }

    pub fn base_retain_ppl(&self) -> f32 {
        self.base_retain.exp()
    }
}

/// Why a trial was abandoned. The string codes are what the study records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneReason {
    Nan,
    RetainBroken,
    ForgetStagnation,
    AdversaryVictory,
    ForgetExploded,
}

impl PruneReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PruneReason::Nan => "nan",
            PruneReason::RetainBroken => "retain_broken",
            PruneReason::ForgetStagnation => "forget_stagnation",
            PruneReason::AdversaryVictory => "adversary_victory",
            PruneReason::ForgetExploded => "forget_exploded",
        }
    }

    pub fn retain_broken(&self) -> bool {
        matches!(self, PruneReason::RetainBroken)
    }

    /// The adversary adapter recovered the forget task.
    pub fn lora_defeaten(&self) -> bool {
        matches!(self, PruneReason::AdversaryVictory)
    }
}

impl fmt::Display for PruneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateVerdict {
    /// Keep going. `retain_ok` is false while retain loss sits above the
    /// soft margin; the loop then skips unlearning until it recovers.
    Continue { retain_ok: bool },
    Prune(PruneReason),
}

#[derive(Clone, Debug)]
pub struct EvaluationGate {
    config: GateConfig,
    baseline: Baseline,
    eval_every: usize,
}

impl EvaluationGate {
    pub fn new(config: GateConfig, baseline: Baseline, eval_every: usize) -> Self {
        Self {
            config,
            baseline,
            eval_every: eval_every.max(1),
        }
    }

    pub fn baseline(&self) -> Baseline {
        self.baseline
    }

    /// Steps count from 1; the gate looks at every `eval_every`-th one.
    pub fn should_evaluate(&self, step: usize) -> bool {
        step > 0 && step % self.eval_every == 0
    }

    /// First matching rule wins: NaN, retain collapse, forget stagnation,
    /// adversary victory, forget explosion.
    pub fn judge(&self, step: usize, snapshot: &EvalSnapshot) -> GateVerdict {
        let config = &self.config;
        let init = self.baseline;
        if snapshot.has_nan() {
            return GateVerdict::Prune(PruneReason::Nan);
        }
        if snapshot.base_retain > init.retain + config.retain_margin {
            return GateVerdict::Prune(PruneReason::RetainBroken);
        }
        if step >= config.stagnation_step
            && snapshot.base_forget < init.forget + config.stagnation_margin
        {
            return GateVerdict::Prune(PruneReason::ForgetStagnation);
        }
        if let Some(adv_forget) = snapshot.adv_forget {
            if config.adversary_floor.is_some_and(|floor| adv_forget < floor) {
                return GateVerdict::Prune(PruneReason::AdversaryVictory);
            }
            if config.adversary_ceiling.is_some_and(|ceiling| adv_forget > ceiling) {
                return GateVerdict::Prune(PruneReason::ForgetExploded);
            }
        }
        let retain_ok = config
            .soft_retain_margin
            .map_or(true, |soft| snapshot.base_retain <= init.retain + soft);
        GateVerdict::Continue { retain_ok }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> EvaluationGate {
        EvaluationGate::new(
            GateConfig {
                adversary_floor: Some(2.0),
                ..GateConfig::default()
            },
            Baseline {
                forget: 3.0,
                retain: 2.5,
            },
            10,
        )
    }

    fn row(
        step: usize,
        base_forget: f32,
        base_retain: f32,
        adv_forget: Option<f32>,
    ) -> EvalSnapshot {
        EvalSnapshot {
            step,
            base_forget,
            base_retain,
            adv_forget,
            adv_retain: adv_forget.map(|_| base_retain),
        }
    }

    #[test]
    fn evaluation_schedule_skips_step_zero() {
        let gate = gate();
        let steps: Vec<usize> = (0..=35).filter(|&s| gate.should_evaluate(s)).collect();
        assert_eq!(steps, vec![10, 20, 30]);
    }

    #[test]
    fn nan_wins_over_every_other_rule() {
        let verdict = gate().judge(40, &row(40, 1.0, 100.0, Some(f32::NAN)));
        assert_eq!(verdict, GateVerdict::Prune(PruneReason::Nan));
    }

    #[test]
    fn rules_apply_in_order() {
        let gate = gate();
        assert_eq!(
            gate.judge(10, &row(10, 3.0, 2.7, Some(1.0))),
            GateVerdict::Prune(PruneReason::RetainBroken)
        );
        assert_eq!(
            gate.judge(10, &row(10, 3.0, 2.5, Some(1.0))),
            GateVerdict::Prune(PruneReason::AdversaryVictory)
        );
        // Stagnation only counts from step 30.
        assert_eq!(
            gate.judge(30, &row(30, 3.02, 2.5, Some(1.0))),
            GateVerdict::Prune(PruneReason::ForgetStagnation)
        );
        assert_eq!(
            gate.judge(30, &row(30, 3.5, 2.5, Some(60.0))),
            GateVerdict::Prune(PruneReason::ForgetExploded)
        );
        assert_eq!(
            gate.judge(30, &row(30, 3.5, 2.5, None)),
            GateVerdict::Continue { retain_ok: true }
        );
    }

    #[test]
    fn soft_margin_pauses_unlearning() {
        assert_eq!(
            gate().judge(10, &row(10, 3.5, 2.58, Some(4.0))),
            GateVerdict::Continue { retain_ok: false }
        );
    }

    #[test]
    fn prune_flags() {
        assert!(PruneReason::RetainBroken.retain_broken());
        assert!(PruneReason::AdversaryVictory.lora_defeaten());
        assert!(!PruneReason::ForgetExploded.lora_defeaten());
        assert_eq!(PruneReason::ForgetStagnation.to_string(), "forget_stagnation");
    }
}
