// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use fade_hpo::{LoggingTracker, Objective, ReplayTrial, Strategy, Study, TrialState};
use fade_nn::{Module, TinyLm, TinyLmConfig, TokenDataset};
use fade_unlearn::{
    Circuit, GateConfig, RelearnConfig, SearchSpaceConfig, TrialData, TrialOrchestrator,
    TrialReport, UnlearnConfig, UnlearnResult, BEST_MODEL_FILE,
};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::path::Path;

static SHAPE: Lazy<TinyLmConfig> = Lazy::new(|| TinyLmConfig {
    vocab_size: 8,
    d_model: 4,
    d_hidden: 6,
    seed: Some(9),
});

static DATA: Lazy<TrialData> = Lazy::new(|| {
    let split = |offset: u32| {
        TokenDataset::new(
            (0..8)
                .map(|row| (0..5).map(|col| (row + col * 3 + offset) % 8).collect())
                .collect(),
        )
    };
    TrialData {
        forget_train: split(0),
        retain_train: split(1),
        forget_val: split(2),
        retain_val: split(3),
    }
});

fn config() -> UnlearnConfig {
    UnlearnConfig {
        unlearn_steps: 4,
        batch_size: 4,
        eval_batch_size: 4,
        eval_every: 2,
        disruption_score_warmup: 1,
        gate: GateConfig {
            retain_margin: 1e3,
            soft_retain_margin: None,
            stagnation_step: usize::MAX,
            adversary_floor: None,
            adversary_ceiling: None,
            ..GateConfig::default()
        },
        relearn: RelearnConfig {
            steps: 4,
            eval_every: 2,
            batch_size: 4,
            ..RelearnConfig::default()
        },
        ..UnlearnConfig::default()
    }
}

fn factory() -> UnlearnResult<TinyLm> {
    Ok(TinyLm::new(SHAPE.clone())?)
}

fn orchestrator(
    store: &Path,
    out: &Path,
) -> TrialOrchestrator<TinyLm, fn() -> UnlearnResult<TinyLm>> {
    let circuit = Circuit::new(factory().unwrap().state_dict().unwrap());
    let strategy = Strategy::random(4);
    let study = Study::load_or_create(store, "unlearn", Objective::Maximize, strategy, 4)
        .unwrap()
        .with_tracker(Box::new(LoggingTracker));
    TrialOrchestrator::new(
        factory as fn() -> UnlearnResult<TinyLm>,
        config(),
        SearchSpaceConfig::default(),
        circuit,
        DATA.clone(),
        study,
        out,
    )
    .unwrap()
}

#[test]
fn search_records_flags_and_keeps_the_best_model() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("study.json");
    let out = dir.path().join("models");
    let released = std::rc::Rc::new(std::cell::Cell::new(0usize));
    let counter = released.clone();
    let mut search =
        orchestrator(&store, &out).with_release_cache(move || counter.set(counter.get() + 1));
    search.run_search(2).unwrap();
    assert_eq!(released.get(), 2);

    let study = search.study();
    assert_eq!(study.trials().len(), 2);
    for trial in study.trials() {
        assert_eq!(trial.state, TrialState::Complete);
        assert_eq!(trial.user_attrs["lora_defeaten"], Value::Bool(false));
        assert_eq!(trial.user_attrs["retain_broken"], Value::Bool(false));
        assert!(trial.suggestion.contains_key("quantile"));
        assert!(!trial.suggestion.contains_key("alpha_thresh"));
    }

    let best = study.best_trial().unwrap().metric.unwrap();
    assert_eq!(search.state().best_value, Some(best));
    let path = search.state().best_model_path.clone().unwrap();
    assert_eq!(path, out.join(BEST_MODEL_FILE));

    let mut restored = TinyLm::new(SHAPE.clone()).unwrap();
    fade_nn::load_bincode(&mut restored, &path).unwrap();
    assert!(restored.parameter_names().unwrap().iter().all(|n| !n.contains("lora")));
}

#[test]
fn replay_reproduces_a_recorded_trial() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("study.json");
    let mut search = orchestrator(&store, &dir.path().join("models"));
    search.run_search(1).unwrap();
    let record = search.study().trials()[0].clone();

    let report = search
        .replay(ReplayTrial::new(record.suggestion.clone()).with_number(record.id))
        .unwrap();
    let TrialReport::Completed { fitness, .. } = report else {
        panic!("replay was pruned");
    };
    assert_eq!(Some(fitness), record.metric);
    assert_eq!(search.study().trials().len(), 1);
}

#[test]
fn resumed_search_continues_numbering_and_best() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("study.json");
    let out = dir.path().join("models");
    let first_best = {
        let mut search = orchestrator(&store, &out);
        search.run_search(1).unwrap();
        search.state().best_value
    };
    assert!(first_best.is_some());

    let mut search = orchestrator(&store, &out);
    assert_eq!(search.state().best_value, first_best);
    assert!(search.state().best_model_path.is_some());
    search.run_search(1).unwrap();
    let ids: Vec<usize> = search.study().trials().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![0, 1]);
    let best = search.state().best_value.unwrap();
    assert!(best >= first_best.unwrap());
}
