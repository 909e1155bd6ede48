use crate::study::{StudyState, TrialRecord, TrialState};
use crate::Objective;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialSummary {
    pub total_trials: usize,
    pub completed_trials: usize,
    pub pruned_trials: usize,
    pub failed_trials: usize,
    pub objective: Objective,
    pub best_trial: Option<TrialRecord>,
    /// Pruned trials per reason code.
    pub prune_reasons: BTreeMap<String, usize>,
}

impl TrialSummary {
    pub fn new(trials: &[TrialRecord], objective: Objective) -> Self {
        let count = |state: TrialState| trials.iter().filter(|t| t.state == state).count();
        let mut prune_reasons = BTreeMap::new();
        for trial in trials.iter().filter(|t| t.state == TrialState::Pruned) {
            let reason = trial
                .prune_reason
                .clone()
                .unwrap_or_else(|| "unspecified".to_string());
            *prune_reasons.entry(reason).or_insert(0) += 1;
        }
        Self {
            total_trials: trials.len(),
            completed_trials: count(TrialState::Complete),
            pruned_trials: count(TrialState::Pruned),
            failed_trials: count(TrialState::Failed),
            objective,
            best_trial: best_trial(trials, objective).cloned(),
            prune_reasons,
        }
    }

    pub fn from_state(state: &StudyState) -> Self {
        Self::new(&state.trials, state.objective)
    }

    pub fn has_best(&self) -> bool {
        self.best_trial.is_some()
    }
}

/// Best completed trial under `objective`. Earlier trials win ties.
pub fn best_trial(trials: &[TrialRecord], objective: Objective) -> Option<&TrialRecord> {
    trials
        .iter()
        .filter(|record| record.state == TrialState::Complete)
        .filter_map(|record| record.metric.map(|metric| (record, metric)))
        .fold(None, |best, (record, metric)| match best {
            None => Some((record, metric)),
            Some((best_record, best_metric)) => {
                if objective.prefers(metric, best_metric) {
                    Some((record, metric))
                } else {
                    Some((best_record, best_metric))
                }
            }
        })
        .map(|(record, _)| record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::TrialSuggestion;

    fn record(id: usize, metric: Option<f64>, state: TrialState) -> TrialRecord {
        TrialRecord {
            id,
            suggestion: TrialSuggestion::new(),
            metric,
            state,
            prune_reason: match state {
                TrialState::Pruned => Some("stagnation".into()),
                _ => None,
            },
            user_attrs: BTreeMap::new(),
        }
    }

    #[test]
    fn best_trial_respects_objective() {
        let trials = vec![
            record(0, Some(0.8), TrialState::Complete),
            record(1, Some(0.2), TrialState::Complete),
            record(2, Some(0.95), TrialState::Complete),
        ];
        assert_eq!(best_trial(&trials, Objective::Minimize).unwrap().id, 1);
        assert_eq!(best_trial(&trials, Objective::Maximize).unwrap().id, 2);
    }

    #[test]
    fn best_trial_ignores_pruned_and_failed() {
        let trials = vec![
            record(0, None, TrialState::Pruned),
            record(1, None, TrialState::Failed),
        ];
        assert!(best_trial(&trials, Objective::Minimize).is_none());
    }

    #[test]
    fn summary_counts_states_and_reasons() {
        let trials = vec![
            record(0, Some(0.8), TrialState::Complete),
            record(1, None, TrialState::Pruned),
            record(2, None, TrialState::Pruned),
            record(3, None, TrialState::Failed),
        ];
        let summary = TrialSummary::new(&trials, Objective::Maximize);
        assert_eq!(summary.total_trials, 4);
        assert_eq!(summary.completed_trials, 1);
        assert_eq!(summary.pruned_trials, 2);
        assert_eq!(summary.failed_trials, 1);
        assert_eq!(summary.prune_reasons["stagnation"], 2);
        assert!(summary.has_best());
    }
}
