use crate::analysis::{best_trial, TrialSummary};
use crate::space::{SearchSpace, TrialSuggestion};
use crate::trial::{LiveTrial, TrialHandle};
use crate::{ExperimentTracker, NoOpTracker, Objective, Observation, SearchError, Strategy, StrategyState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrialState {
    Complete,
    Pruned,
    Failed,
}

/// What an objective returns for a trial that ran to a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum TrialOutcome {
    Complete(f64),
    Pruned { reason: String },
}

impl TrialOutcome {
    pub fn pruned(reason: impl Into<String>) -> Self {
        TrialOutcome::Pruned {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialRecord {
    pub id: usize,
    pub suggestion: TrialSuggestion,
    pub metric: Option<f64>,
    pub state: TrialState,
    #[serde(default)]
    pub prune_reason: Option<String>,
    #[serde(default)]
    pub user_attrs: BTreeMap<String, Value>,
}

/// Everything persisted for a study.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyState {
    pub name: String,
    pub objective: Objective,
    pub strategy: StrategyState,
    pub space: SearchSpace,
    pub trials: Vec<TrialRecord>,
    pub next_trial_id: usize,
    pub sampler_seed: u64,
    #[serde(default)]
    pub user_attrs: BTreeMap<String, Value>,
}

pub struct Study {
    state: StudyState,
    strategy: Strategy,
    store: Option<PathBuf>,
    tracker: Box<dyn ExperimentTracker>,
}

impl Study {
    /// Study kept in memory only.
    pub fn new(name: impl Into<String>, objective: Objective, strategy: Strategy, seed: u64) -> Self {
        Self {
            state: StudyState {
                name: name.into(),
                objective,
                strategy: strategy.state(),
                space: SearchSpace::default(),
                trials: Vec::new(),
                next_trial_id: 0,
                sampler_seed: seed,
                user_attrs: BTreeMap::new(),
            },
            strategy,
            store: None,
            tracker: Box::new(NoOpTracker),
        }
    }

    /// New study persisted at `path`. An existing store is never overwritten.
    pub fn create(
        path: impl AsRef<Path>,
        name: impl Into<String>,
        objective: Objective,
        strategy: Strategy,
        seed: u64,
    ) -> Result<Self, SearchError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(SearchError::StudyExists(path.to_path_buf()));
        }
        let mut study = Self::new(name, objective, strategy, seed);
        study.store = Some(path.to_path_buf());
        study.persist()?;
        Ok(study)
    }

    /// Reopens the study at `path` if present, otherwise creates it. A store
    /// holding another study name or direction is rejected.
    pub fn load_or_create(
        path: impl AsRef<Path>,
        name: impl Into<String>,
        objective: Objective,
        strategy: Strategy,
        seed: u64,
    ) -> Result<Self, SearchError> {
        let path = path.as_ref();
        let name = name.into();
        if !path.exists() {
            return Self::create(path, name, objective, strategy, seed);
        }
        let state = Self::read_state(path)?;
        if state.name != name || state.objective != objective {
            return Err(SearchError::StudyMismatch {
                expected: format!("{name} ({})", objective.as_str()),
                found: format!("{} ({})", state.name, state.objective.as_str()),
            });
        }
        tracing::info!(
            study = %state.name,
            trials = state.trials.len(),
            "resuming study"
        );
        Ok(Self {
            strategy: Strategy::restore(state.strategy.clone()),
            state,
            store: Some(path.to_path_buf()),
            tracker: Box::new(NoOpTracker),
        })
    }

    /// Reads a persisted store without attaching to it.
    pub fn read_state(path: impl AsRef<Path>) -> Result<StudyState, SearchError> {
        let file = File::open(path.as_ref())?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn with_tracker(mut self, tracker: Box<dyn ExperimentTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn objective(&self) -> Objective {
        self.state.objective
    }

    pub fn state(&self) -> &StudyState {
        &self.state
    }

    pub fn trials(&self) -> &[TrialRecord] {
        &self.state.trials
    }

    pub fn store(&self) -> Option<&Path> {
        self.store.as_deref()
    }

    pub fn set_user_attr(&mut self, key: &str, value: Value) -> Result<(), SearchError> {
        self.state.user_attrs.insert(key.to_string(), value);
        self.persist()
    }

    pub fn best_trial(&self) -> Option<&TrialRecord> {
        best_trial(&self.state.trials, self.state.objective)
    }

    pub fn summary(&self) -> TrialSummary {
        TrialSummary::from_state(&self.state)
    }

    /// Runs `n_trials` trials of `objective`.
    ///
    /// Pruned outcomes and non-finite metrics are recorded and the search
    /// moves on. An `Err` from the objective is recorded as a failed trial,
    /// persisted, and returned, ending the search.
    pub fn optimize<F, E>(&mut self, n_trials: usize, mut objective: F) -> Result<(), E>
    where
        F: FnMut(&mut dyn TrialHandle) -> Result<TrialOutcome, E>,
        E: From<SearchError>,
    {
        for _ in 0..n_trials {
            let id = self.state.next_trial_id;
            self.state.next_trial_id += 1;
            let proposal = self.strategy.suggest(&self.state.space, self.state.objective);
            self.tracker.on_trial_start(id, &proposal);

            let seed = self
                .state
                .sampler_seed
                .wrapping_add((id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
            let mut trial = LiveTrial::new(id, proposal, &mut self.state.space, seed);
            let result = objective(&mut trial);
            let (suggestion, user_attrs) = trial.into_parts();

            let mut record = TrialRecord {
                id,
                suggestion,
                metric: None,
                state: TrialState::Failed,
                prune_reason: None,
                user_attrs,
            };
            let failure = match result {
                Ok(TrialOutcome::Complete(metric)) if metric.is_finite() => {
                    record.metric = Some(metric);
                    record.state = TrialState::Complete;
                    self.strategy.observe(
                        Observation {
                            suggestion: record.suggestion.clone(),
                            metric,
                        },
                        self.state.objective,
                    );
                    None
                }
                Ok(TrialOutcome::Complete(_)) => {
                    record.state = TrialState::Pruned;
                    record.prune_reason = Some("non_finite_metric".into());
                    None
                }
                Ok(TrialOutcome::Pruned { reason }) => {
                    record.state = TrialState::Pruned;
                    record.prune_reason = Some(reason);
                    None
                }
                Err(err) => Some(err),
            };

            self.tracker.on_trial_end(&record);
            self.state.trials.push(record);
            self.state.strategy = self.strategy.state();
            self.persist()?;
            self.tracker.on_checkpoint(&self.state);
            if let Some(err) = failure {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Writes the store through a sibling temp file and a rename.
    fn persist(&self) -> Result<(), SearchError> {
        let Some(path) = self.store.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut staging = path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        {
            let mut writer = BufWriter::new(File::create(&staging)?);
            serde_json::to_writer_pretty(&mut writer, &self.state)?;
            writer.flush()?;
        }
        fs::rename(&staging, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use serde_json::json;
    use tempfile::tempdir;

    static CHOICES: Lazy<Vec<&'static str>> = Lazy::new(|| vec!["ratio", "angle"]);

    fn objective(trial: &mut dyn TrialHandle) -> Result<TrialOutcome, SearchError> {
        let x = trial.suggest_float("x", -1.0, 1.0, false)?;
        let rank = trial.suggest_int("rank", 1, 3)?;
        let mode = trial.suggest_categorical("mode", &CHOICES)?;
        trial.set_user_attr("mode_seen", json!(mode));
        if rank == 3 {
            return Ok(TrialOutcome::pruned("retain_broken"));
        }
        Ok(TrialOutcome::Complete(-(x * x)))
    }

    #[test]
    fn optimize_records_complete_and_pruned_trials() {
        let mut study = Study::new("quad", Objective::Maximize, Strategy::random(4), 7);
        study.optimize(12, objective).unwrap();
        assert_eq!(study.trials().len(), 12);
        assert_eq!(study.state().space.len(), 3);
        for trial in study.trials() {
            let rank = trial.suggestion["rank"].as_i64().unwrap();
            if rank == 3 {
                assert_eq!(trial.state, TrialState::Pruned);
                assert_eq!(trial.prune_reason.as_deref(), Some("retain_broken"));
            } else {
                assert_eq!(trial.state, TrialState::Complete);
            }
            assert!(trial.user_attrs.contains_key("mode_seen"));
        }
        let summary = study.summary();
        assert_eq!(summary.total_trials, 12);
        assert_eq!(summary.completed_trials + summary.pruned_trials, 12);
    }

    #[test]
    fn non_finite_metrics_are_pruned() {
        let mut study = Study::new("nan", Objective::Minimize, Strategy::random(0), 0);
        study
            .optimize(1, |_trial| -> Result<TrialOutcome, SearchError> {
                Ok(TrialOutcome::Complete(f64::NAN))
            })
            .unwrap();
        assert_eq!(study.trials()[0].state, TrialState::Pruned);
        assert!(study.best_trial().is_none());
    }

    #[test]
    fn fatal_errors_are_recorded_then_returned() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("study.json");
        let mut study =
            Study::create(&path, "fatal", Objective::Minimize, Strategy::random(1), 1).unwrap();
        let result = study.optimize(5, |trial| -> Result<TrialOutcome, SearchError> {
            trial.suggest_int("n", 0, 1)?;
            Err(SearchError::MissingReplayParam("boom".into()))
        });
        assert!(result.is_err());
        let stored = Study::read_state(&path).unwrap();
        assert_eq!(stored.trials.len(), 1);
        assert_eq!(stored.trials[0].state, TrialState::Failed);
    }

    #[test]
    fn resumed_study_continues_numbering_and_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("study.json");

        let mut straight = Study::new("resume", Objective::Maximize, Strategy::random(9), 3);
        straight.optimize(4, objective).unwrap();

        {
            let mut first =
                Study::load_or_create(&path, "resume", Objective::Maximize, Strategy::random(9), 3)
                    .unwrap();
            first.set_user_attr("commit", json!("abc123")).unwrap();
            first.optimize(2, objective).unwrap();
        }
        let mut resumed =
            Study::load_or_create(&path, "resume", Objective::Maximize, Strategy::random(9), 3)
                .unwrap();
        resumed.optimize(2, objective).unwrap();

        let ids: Vec<usize> = resumed.trials().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(resumed.state().user_attrs["commit"], json!("abc123"));
        for (a, b) in straight.trials().iter().zip(resumed.trials()) {
            assert_eq!(a.suggestion, b.suggestion);
        }

        assert!(matches!(
            Study::load_or_create(&path, "resume", Objective::Minimize, Strategy::random(9), 3),
            Err(SearchError::StudyMismatch { .. })
        ));
        assert!(matches!(
            Study::create(&path, "resume", Objective::Maximize, Strategy::random(9), 3),
            Err(SearchError::StudyExists(_))
        ));
    }
}
