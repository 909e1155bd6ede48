// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use fade_hpo::{LoggingTracker, Objective, Strategy, Study, TrialState};
use fade_nn::{BatchSource, Module, TinyLm, TinyLmConfig, TokenDataset};
use fade_unlearn::{
    run_trial, AlternatingTrainingLoop, Circuit, GateConfig, LoopOutcome, PruneReason,
    RelearnConfig, SearchSpaceConfig, TrialData, TrialOrchestrator, TrialParams, TrialReport,
    UnlearnConfig, UnlearnResult, BEST_MODEL_FILE,
};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::cell::Cell;
use std::rc::Rc;

static SHAPE: Lazy<TinyLmConfig> = Lazy::new(|| TinyLmConfig {
    vocab_size: 8,
    d_model: 4,
    d_hidden: 6,
    seed: Some(11),
});

static DATA: Lazy<TrialData> = Lazy::new(|| {
    let split = |offset: u32| {
        TokenDataset::new(
            (0..8)
                .map(|row| (0..5).map(|col| (row * 5 + col + offset) % 8).collect())
                .collect(),
        )
    };
    TrialData {
        forget_train: split(0),
        retain_train: split(2),
        forget_val: split(4),
        retain_val: split(6),
    }
});

/// Lenient gate: only the fields a test overrides can prune.
fn config(gate: GateConfig) -> UnlearnConfig {
    UnlearnConfig {
        unlearn_steps: 6,
        batch_size: 4,
        eval_batch_size: 4,
        eval_every: 2,
        disruption_score_warmup: 1,
        gate,
        relearn: RelearnConfig {
            steps: 2,
            eval_every: 1,
            batch_size: 4,
            ..RelearnConfig::default()
        },
        ..UnlearnConfig::default()
    }
}

fn lenient() -> GateConfig {
    GateConfig {
        retain_margin: 1e3,
        soft_retain_margin: None,
        stagnation_step: usize::MAX,
        adversary_floor: None,
        adversary_ceiling: None,
        ..GateConfig::default()
    }
}

fn model() -> TinyLm {
    TinyLm::new(SHAPE.clone()).unwrap()
}

fn factory() -> UnlearnResult<TinyLm> {
    Ok(TinyLm::new(SHAPE.clone())?)
}

/// Forget direction pointing away from every weight with magnitude `scale`.
fn circuit(scale: f32) -> Circuit {
    Circuit::new(
        model()
            .state_dict()
            .unwrap()
            .into_iter()
            .map(|(name, value)| (name, value.map(|v| v.signum() * scale)))
            .collect(),
    )
}

fn params() -> TrialParams {
    TrialParams {
        quantile: 0.9,
        unlearning_rate: 1.0,
        disruption_score_decay: 0.5,
        ret_lora_rank: 1,
        ..TrialParams::default()
    }
}

/// Runs `trials` trials and returns the study with the number of cache
/// releases observed.
fn search(gate: GateConfig, trials: usize) -> (Study, usize) {
    let dir = tempfile::tempdir().unwrap();
    let study = Study::load_or_create(
        dir.path().join("study.json"),
        "pruning",
        Objective::Maximize,
        Strategy::random(5),
        5,
    )
    .unwrap()
    .with_tracker(Box::new(LoggingTracker));
    let released = Rc::new(Cell::new(0usize));
    let counter = released.clone();
    let mut orchestrator = TrialOrchestrator::new(
        factory as fn() -> UnlearnResult<TinyLm>,
        config(gate),
        SearchSpaceConfig::default(),
        circuit(0.1),
        DATA.clone(),
        study,
        dir.path().join("models"),
    )
    .unwrap()
    .with_release_cache(move || counter.set(counter.get() + 1));
    orchestrator.run_search(trials).unwrap();
    assert!(orchestrator.state().best_value.is_none());
    assert!(!dir.path().join("models").join(BEST_MODEL_FILE).exists());
    (orchestrator.into_study(), released.get())
}

#[test]
fn broken_retain_prunes_every_trial_at_the_first_evaluation() {
    let (study, released) = search(
        GateConfig {
            retain_margin: -1e3,
            ..lenient()
        },
        3,
    );
    assert_eq!(released, 3);
    assert_eq!(study.trials().len(), 3);
    for trial in study.trials() {
        assert_eq!(trial.state, TrialState::Pruned);
        assert_eq!(trial.prune_reason.as_deref(), Some("retain_broken"));
        assert_eq!(trial.metric, None);
        assert_eq!(trial.user_attrs["retain_broken"], Value::Bool(true));
        assert_eq!(trial.user_attrs["lora_defeaten"], Value::Bool(false));
        assert_eq!(trial.user_attrs["prune_step"], Value::from(2));
        assert!(trial.user_attrs.contains_key("last_base_retain"));
    }
    assert!(study.best_trial().is_none());
}

#[test]
fn adversary_below_the_floor_defeats_the_trial() {
    let (study, released) = search(
        GateConfig {
            adversary_floor: Some(1e9),
            ..lenient()
        },
        2,
    );
    assert_eq!(released, 2);
    for trial in study.trials() {
        assert_eq!(trial.state, TrialState::Pruned);
        assert_eq!(trial.prune_reason.as_deref(), Some("adversary_victory"));
        assert_eq!(trial.user_attrs["lora_defeaten"], Value::Bool(true));
        assert_eq!(trial.user_attrs["retain_broken"], Value::Bool(false));
    }
}

#[test]
fn exploding_weights_prune_as_nan() {
    let report = run_trial(
        model(),
        &config(lenient()),
        &params(),
        &circuit(3e38),
        &DATA,
    )
    .unwrap();
    let TrialReport::Pruned {
        reason,
        step,
        history,
    } = report
    else {
        panic!("trial with exploding weights completed");
    };
    assert_eq!(reason, PruneReason::Nan);
    assert_eq!(reason.as_str(), "nan");
    assert_eq!(step, 2);
    assert!(history.last().unwrap().has_nan());
}

#[test]
fn loop_stops_at_the_evaluation_that_prunes() {
    let config = UnlearnConfig {
        eval_every: 3,
        ..config(GateConfig {
            retain_margin: -1e3,
            ..lenient()
        })
    };
    let mut model = model();
    let eval = DATA.eval_batches(config.eval_batch_size).unwrap();
    let baseline = eval.baseline(&mut model).unwrap();
    let mut lp = AlternatingTrainingLoop::new(
        &mut model,
        &config,
        &params(),
        &circuit(0.1),
        baseline,
        eval,
    )
    .unwrap();
    let (mut forget, mut retain) = DATA.train_sources(4, 1, "unlearn").unwrap();
    let outcome = lp.run(&mut model, &mut forget, &mut retain).unwrap();
    assert_eq!(
        outcome,
        LoopOutcome::Pruned {
            step: 3,
            reason: PruneReason::RetainBroken
        }
    );
    assert_eq!(lp.step_count(), 3);
    assert_eq!(lp.history().len(), 1);
    assert_eq!(lp.history()[0].step, 3);
}

#[test]
fn soft_margin_pauses_unlearning_without_pruning() {
    let config = config(GateConfig {
        soft_retain_margin: Some(-1e3),
        ..lenient()
    });
    let mut model = model();
    let eval = DATA.eval_batches(config.eval_batch_size).unwrap();
    let baseline = eval.baseline(&mut model).unwrap();
    let mut lp = AlternatingTrainingLoop::new(
        &mut model,
        &config,
        &params(),
        &circuit(0.1),
        baseline,
        eval,
    )
    .unwrap();
    let (mut forget, mut retain) = DATA.train_sources(4, 1, "unlearn").unwrap();
    for _ in 0..2 {
        assert_eq!(lp.step(&mut model, &mut forget, &mut retain).unwrap(), None);
    }
    assert!(!lp.retain_ok());

    let before = model.state_dict().unwrap();
    let batch = forget.next_batch().unwrap();
    assert!(lp.unlearn_substep(&mut model, &batch).unwrap().is_none());
    assert_eq!(model.state_dict().unwrap(), before);

    let outcome = lp.run(&mut model, &mut forget, &mut retain).unwrap();
    assert_eq!(outcome, LoopOutcome::Completed);
    assert_eq!(lp.history().len(), 3);
}
