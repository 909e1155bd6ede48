// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use fade_nn::{ConstantBatches, Module, Tensor, TinyLm, TinyLmConfig, TokenBatch};
use fade_unlearn::{
    AlternatingTrainingLoop, Circuit, EvalBatches, GateConfig, RetainMode, TrainableSubset,
    TrialParams, UnlearnConfig,
};
use std::collections::{BTreeSet, HashMap};

fn batch(shift: u32) -> TokenBatch {
    TokenBatch::new(
        (0..3)
            .map(|row| (0..5).map(|col| (row * 2 + col + shift) % 7).collect())
            .collect(),
    )
    .unwrap()
}

fn model() -> TinyLm {
    TinyLm::new(TinyLmConfig {
        vocab_size: 7,
        d_model: 4,
        d_hidden: 6,
        seed: Some(21),
    })
    .unwrap()
}

fn config(retain_mode: RetainMode) -> UnlearnConfig {
    UnlearnConfig {
        unlearn_steps: 10,
        eval_every: 100,
        disruption_score_warmup: 1,
        retain_mode,
        gate: GateConfig {
            soft_retain_margin: None,
            ..GateConfig::default()
        },
        ..UnlearnConfig::default()
    }
}

fn params() -> TrialParams {
    TrialParams {
        quantile: 0.3,
        unlearning_rate: 0.02,
        retaining_rate: 0.02,
        adv_lora_lr: 0.02,
        disruption_score_decay: 0.5,
        ret_lora_rank: 2,
        ..TrialParams::default()
    }
}

fn changed(before: &HashMap<String, Tensor>, after: &HashMap<String, Tensor>) -> BTreeSet<String> {
    assert_eq!(
        before.keys().collect::<BTreeSet<_>>(),
        after.keys().collect::<BTreeSet<_>>()
    );
    before
        .iter()
        .filter(|(name, value)| after[*name].data() != value.data())
        .map(|(name, _)| name.clone())
        .collect()
}

fn check_isolation(retain_mode: RetainMode) {
    let mut model = model();
    let circuit = Circuit::new(
        model
            .state_dict()
            .unwrap()
            .into_iter()
            .map(|(name, value)| (name, value.map(|v| 0.5 * v)))
            .collect(),
    );
    let eval = EvalBatches {
        forget: batch(0),
        retain: batch(3),
    };
    let baseline = eval.baseline(&mut model).unwrap();
    let config = config(retain_mode);
    let mut unlearning =
        AlternatingTrainingLoop::new(&mut model, &config, &params(), &circuit, baseline, eval)
            .unwrap();
    let mut forget = ConstantBatches::new(batch(0));
    let mut retain = ConstantBatches::new(batch(3));
    unlearning.step(&mut model, &mut forget, &mut retain).unwrap();
    assert!(!unlearning.in_warmup());

    for round in 0..3 {
        let before = model.state_dict().unwrap();
        unlearning.retain_substep(&mut model, &batch(3)).unwrap();
        let after_retain = model.state_dict().unwrap();
        let moved = changed(&before, &after_retain);
        let allowed = unlearning.partition().members(TrainableSubset::Retain);
        assert!(moved.is_subset(&allowed), "round {round}: retain moved {moved:?}");

        let stats = unlearning.unlearn_substep(&mut model, &batch(0)).unwrap();
        assert!(stats.is_some());
        let after_unlearn = model.state_dict().unwrap();
        let moved = changed(&after_retain, &after_unlearn);
        let allowed = unlearning.partition().members(TrainableSubset::Intervened);
        assert!(!moved.is_empty());
        assert!(moved.is_subset(&allowed), "round {round}: unlearn moved {moved:?}");

        unlearning.adversary_substep(&mut model, &batch(0)).unwrap();
        let after_adversary = model.state_dict().unwrap();
        let moved = changed(&after_unlearn, &after_adversary);
        let allowed = unlearning.partition().members(TrainableSubset::Adversary);
        assert!(!moved.is_empty());
        assert!(moved.is_subset(&allowed), "round {round}: adversary moved {moved:?}");
    }

    let frozen = ["embed.weight", "head.weight", "mlp.up.bias", "mlp.down.bias"];
    let fresh = self::model().state_dict().unwrap();
    let now = model.state_dict().unwrap();
    for name in frozen {
        assert_eq!(now[name], fresh[name], "{name} moved");
    }
}

#[test]
fn sub_steps_only_touch_their_subset_with_retain_adapter() {
    check_isolation(RetainMode::Adapter);
}

#[test]
fn sub_steps_only_touch_their_subset_when_retaining_on_intervened_weights() {
    check_isolation(RetainMode::Intervened);
}

#[test]
fn subsets_are_disjoint_apart_from_retain() {
    let mut model = model();
    let circuit = Circuit::new(model.state_dict().unwrap());
    let eval = EvalBatches {
        forget: batch(0),
        retain: batch(3),
    };
    let baseline = eval.baseline(&mut model).unwrap();
    let unlearning = AlternatingTrainingLoop::new(
        &mut model,
        &config(RetainMode::Adapter),
        &params(),
        &circuit,
        baseline,
        eval,
    )
    .unwrap();
    let partition = unlearning.partition();
    let intervened = partition.members(TrainableSubset::Intervened);
    let adversary = partition.members(TrainableSubset::Adversary);
    assert_eq!(
        intervened,
        BTreeSet::from(["mlp.down.weight".to_string(), "mlp.up.weight".to_string()])
    );
    assert!(intervened.is_disjoint(&adversary));
    assert!(partition
        .members(TrainableSubset::Retain)
        .is_disjoint(&adversary));
    assert!(partition.members(TrainableSubset::Relearn).is_empty());
}
