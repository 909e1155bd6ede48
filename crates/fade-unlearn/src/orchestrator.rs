// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Hyperparameter search over whole unlearning trials.
//!
//! The orchestrator owns everything that outlives a single trial: the
//! immutable run configuration, the circuit, the datasets, the study store,
//! and the [`SearchState`] tracking the best model written so far. Each trial
//! gets a fresh model from the factory, so no trial sees another's weights.

use crate::circuit::Circuit;
use crate::config::{SearchSpaceConfig, TrialParams, UnlearnConfig};
use crate::error::UnlearnResult;
use crate::trial::{run_trial, TrialData, TrialReport};
use fade_hpo::{ReplayTrial, Study, TrialHandle, TrialOutcome};
use fade_nn::LanguageModel;
use serde_json::Value;
use std::path::{Path, PathBuf};

pub const BEST_MODEL_FILE: &str = "best_model.bin";

/// Best fitness seen by this search and where its model lives.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchState {
    pub best_value: Option<f64>,
    pub best_model_path: Option<PathBuf>,
}

pub struct TrialOrchestrator<M, F>
where
    F: FnMut() -> UnlearnResult<M>,
{
    factory: F,
    config: UnlearnConfig,
    space: SearchSpaceConfig,
    circuit: Circuit,
    data: TrialData,
    study: Study,
    out_dir: PathBuf,
    state: SearchState,
    release_cache: Option<Box<dyn FnMut()>>,
}

impl<M, F> TrialOrchestrator<M, F>
where
    M: LanguageModel + Clone,
    F: FnMut() -> UnlearnResult<M>,
{
    /// A resumed study seeds [`SearchState`] from its best recorded trial.
    pub fn new(
        factory: F,
        config: UnlearnConfig,
        space: SearchSpaceConfig,
        circuit: Circuit,
        data: TrialData,
        study: Study,
        out_dir: impl Into<PathBuf>,
    ) -> UnlearnResult<Self> {
        config.validate()?;
        let out_dir = out_dir.into();
        let best_path = out_dir.join(BEST_MODEL_FILE);
        let state = SearchState {
            best_value: study.best_trial().and_then(|trial| trial.metric),
            best_model_path: best_path.exists().then_some(best_path),
        };
        Ok(Self {
            factory,
            config,
            space,
            circuit,
            data,
            study,
            out_dir,
            state,
            release_cache: None,
        })
    }

    /// Called after every trial to give back memory held by the substrate.
    pub fn with_release_cache(mut self, hook: impl FnMut() + 'static) -> Self {
        self.release_cache = Some(Box::new(hook));
        self
    }

    pub fn study(&self) -> &Study {
        &self.study
    }

    pub fn study_mut(&mut self) -> &mut Study {
        &mut self.study
    }

    pub fn state(&self) -> &SearchState {
        &self.state
    }

    pub fn config(&self) -> &UnlearnConfig {
        &self.config
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn into_study(self) -> Study {
        self.study
    }

    /// Runs `n_trials` more trials. Pruned trials are recorded with their
    /// reason code; configuration and I/O errors end the search.
    pub fn run_search(&mut self, n_trials: usize) -> UnlearnResult<()> {
        let Self {
            factory,
            config,
            space,
            circuit,
            data,
            study,
            out_dir,
            state,
            release_cache,
        } = self;
        let objective = study.objective();
        study.optimize(n_trials, |trial: &mut dyn TrialHandle| {
            let result = (|| -> UnlearnResult<TrialOutcome> {
                let params = TrialParams::suggest(trial, space, config)?;
                tracing::info!(trial = trial.number(), ?params, "starting trial");
                let report = run_trial(factory()?, config, &params, circuit, data)?;
                record(trial, &report);
                if let TrialReport::Completed { fitness, model, .. } = &report {
                    let improved = fitness.is_finite()
                        && state
                            .best_value
                            .map_or(true, |best| objective.prefers(*fitness, best));
                    if improved {
                        state.best_model_path = Some(save_best(model, out_dir)?);
                        state.best_value = Some(*fitness);
                        tracing::info!(trial = trial.number(), fitness, "new best model");
                    }
                }
                Ok(report.outcome())
            })();
            if let Some(hook) = release_cache.as_mut() {
                hook();
            }
            result
        })
    }

    /// Re-runs one configuration from fixed parameters without touching the
    /// study or the best model.
    pub fn replay(&mut self, mut trial: ReplayTrial) -> UnlearnResult<TrialReport<M>> {
        let params = TrialParams::suggest(&mut trial, &self.space, &self.config)?;
        let model = (self.factory)()?;
        let report = run_trial(model, &self.config, &params, &self.circuit, &self.data)?;
        record(&mut trial, &report);
        if let Some(hook) = self.release_cache.as_mut() {
            hook();
        }
        Ok(report)
    }
}

fn save_best<M: LanguageModel>(model: &M, out_dir: &Path) -> UnlearnResult<PathBuf> {
    std::fs::create_dir_all(out_dir)?;
    let path = out_dir.join(BEST_MODEL_FILE);
    fade_nn::save_bincode(model, &path)?;
    tracing::debug!(path = %path.display(), "best model written");
    Ok(path)
}

fn record<M>(trial: &mut dyn TrialHandle, report: &TrialReport<M>) {
    let reason = report.prune_reason();
    trial.set_user_attr(
        "lora_defeaten",
        Value::Bool(reason.is_some_and(|r| r.lora_defeaten())),
    );
    trial.set_user_attr(
        "retain_broken",
        Value::Bool(reason.is_some_and(|r| r.retain_broken())),
    );
    match report {
        TrialReport::Pruned { reason, step, .. } => {
            trial.set_user_attr("prune_step", Value::from(*step));
            tracing::warn!(
                trial = trial.number(),
                step,
                reason = reason.as_str(),
                "trial pruned"
            );
        }
        TrialReport::Completed { relearn, .. } => {
            if let Some(last) = relearn.final_forget() {
                trial.set_user_attr("final_forget", Value::from(f64::from(last)));
            }
        }
    }
    if let Some(last) = report.history().last() {
        trial.set_user_attr("last_base_forget", Value::from(f64::from(last.base_forget)));
        trial.set_user_attr("last_base_retain", Value::from(f64::from(last.base_retain)));
    }
}
