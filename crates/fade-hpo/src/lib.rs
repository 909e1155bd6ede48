//! Define-by-run hyperparameter search.
//!
//! Objectives receive a [`TrialHandle`] and ask it for values as they need
//! them; the [`Study`] drives the trials, records completed, pruned, and
//! failed outcomes, and persists everything to a JSON store so a search can
//! be inspected or resumed later.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;
use thiserror::Error;

pub mod analysis;
pub mod space;
pub mod strategies;
pub mod study;
pub mod trial;

pub use analysis::TrialSummary;
pub use space::{ParamSpec, ParamValue, SearchSpace, TrialSuggestion};
pub use study::{Study, StudyState, TrialOutcome, TrialRecord, TrialState};
pub use trial::{LiveTrial, ReplayTrial, TrialHandle};

use strategies::{BayesianStrategy, PopulationStrategy, RandomStrategy};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    #[default]
    Minimize,
    Maximize,
}

impl Objective {
    pub fn from_maximize(maximize: bool) -> Self {
        if maximize {
            Objective::Maximize
        } else {
            Objective::Minimize
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Objective::Minimize => "minimize",
            Objective::Maximize => "maximize",
        }
    }

    /// Orders metrics best first.
    pub fn ordering(&self, lhs: f64, rhs: f64) -> Ordering {
        match self {
            Objective::Minimize => lhs.total_cmp(&rhs),
            Objective::Maximize => rhs.total_cmp(&lhs),
        }
    }

    pub fn prefers(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Objective::Minimize => candidate < incumbent,
            Objective::Maximize => candidate > incumbent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub suggestion: TrialSuggestion,
    pub metric: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StrategyState {
    Bayesian(strategies::BayesianState),
    Population(strategies::PopulationState),
    Random(strategies::RandomState),
}

#[derive(Debug, Clone)]
pub enum Strategy {
    Bayesian(BayesianStrategy),
    Population(PopulationStrategy),
    Random(RandomStrategy),
}

impl Strategy {
    pub fn random(seed: u64) -> Self {
        Strategy::Random(RandomStrategy::new(seed))
    }

    pub fn bayesian(seed: u64, exploration: f64) -> Self {
        Strategy::Bayesian(BayesianStrategy::new(seed, exploration))
    }

    pub fn population(seed: u64, size: usize, elite_fraction: f64, mutation_rate: f64) -> Self {
        Strategy::Population(PopulationStrategy::new(
            seed,
            size,
            elite_fraction,
            mutation_rate,
        ))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Bayesian(_) => "bayesian",
            Strategy::Population(_) => "population",
            Strategy::Random(_) => "random",
        }
    }

    pub fn suggest(&mut self, space: &SearchSpace, objective: Objective) -> TrialSuggestion {
        match self {
            Strategy::Bayesian(strategy) => strategy.suggest(space, objective),
            Strategy::Population(strategy) => strategy.suggest(space, objective),
            Strategy::Random(strategy) => strategy.suggest(space),
        }
    }

    pub fn observe(&mut self, observation: Observation, objective: Objective) {
        match self {
            Strategy::Bayesian(strategy) => strategy.observe(observation, objective),
            Strategy::Population(strategy) => strategy.observe(observation, objective),
            Strategy::Random(strategy) => strategy.observe(observation),
        }
    }

    pub fn state(&self) -> StrategyState {
        match self {
            Strategy::Bayesian(strategy) => StrategyState::Bayesian(strategy.state()),
            Strategy::Population(strategy) => StrategyState::Population(strategy.state()),
            Strategy::Random(strategy) => StrategyState::Random(strategy.state()),
        }
    }

    pub fn restore(state: StrategyState) -> Strategy {
        match state {
            StrategyState::Bayesian(state) => Strategy::Bayesian(BayesianStrategy::restore(state)),
            StrategyState::Population(state) => {
                Strategy::Population(PopulationStrategy::restore(state))
            }
            StrategyState::Random(state) => Strategy::Random(RandomStrategy::restore(state)),
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("parameter `{name}` has an invalid range: {reason}")]
    InvalidSpec { name: String, reason: String },
    #[error("parameter `{name}` was already declared with different bounds")]
    ConflictingSpec { name: String },
    #[error("replayed trial has no value for `{0}`")]
    MissingReplayParam(String),
    #[error("replayed value for `{name}` is not a valid {expected}")]
    ReplayMismatch { name: String, expected: &'static str },
    #[error("study store {} already exists", .0.display())]
    StudyExists(PathBuf),
    #[error("study store holds `{found}` but `{expected}` was requested")]
    StudyMismatch { expected: String, found: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub trait ExperimentTracker: Send {
    fn on_trial_start(&mut self, _trial: usize, _suggestion: &TrialSuggestion) {}
    fn on_trial_end(&mut self, _trial: &TrialRecord) {}
    fn on_checkpoint(&mut self, _state: &StudyState) {}
}

pub struct NoOpTracker;
impl ExperimentTracker for NoOpTracker {}

/// Emits one `tracing` event per trial boundary.
pub struct LoggingTracker;

impl ExperimentTracker for LoggingTracker {
    fn on_trial_start(&mut self, trial: usize, suggestion: &TrialSuggestion) {
        tracing::info!(trial, proposed = suggestion.len(), "trial started");
    }

    fn on_trial_end(&mut self, trial: &TrialRecord) {
        match trial.state {
            TrialState::Complete => {
                tracing::info!(trial = trial.id, metric = ?trial.metric, "trial complete")
            }
            TrialState::Pruned => tracing::info!(
                trial = trial.id,
                reason = trial.prune_reason.as_deref().unwrap_or("unspecified"),
                "trial pruned"
            ),
            TrialState::Failed => tracing::warn!(trial = trial.id, "trial failed"),
        }
    }
}
