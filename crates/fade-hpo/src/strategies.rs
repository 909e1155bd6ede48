use crate::space::{ParamSpec, ParamValue, SearchSpace, TrialSuggestion};
use crate::{Objective, Observation};
use rand::prelude::*;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Rebuilds the generator for the next suggestion by skipping the draws every
/// earlier suggestion consumed, so a restored strategy continues the stream.
fn rng_for(seed: u64, suggestion_count: u64, draws: usize) -> StdRng {
    let mut rng = StdRng::seed_from_u64(seed);
    let skips = suggestion_count as usize * draws;
    for _ in 0..skips {
        let _: f64 = rng.gen();
    }
    rng
}

/// Moves one parameter of `suggestion` around its current value. Floats and
/// ints get Gaussian noise of `width` times their range (in `ln` space for
/// log-scaled floats); categoricals switch to a uniform pick with probability
/// `swap`.
fn perturb(
    spec: &ParamSpec,
    suggestion: &mut TrialSuggestion,
    rng: &mut StdRng,
    width: f64,
    swap: f64,
) {
    let Some(value) = suggestion.get_mut(spec.name()) else {
        return;
    };
    match (spec, value) {
        (ParamSpec::Float { low, high, log, .. }, ParamValue::Float(v)) => {
            let noise: f64 = rng.sample(StandardNormal);
            *v = if *log && *v > 0.0 {
                let sigma = (high.ln() - low.ln()).abs() * width;
                (v.ln() + noise * sigma).exp()
            } else {
                *v + noise * (high - low).abs() * width
            }
            .clamp(*low, *high);
        }
        (ParamSpec::Int { low, high, .. }, ParamValue::Int(v)) => {
            let noise: f64 = rng.sample(StandardNormal);
            let span = (*high - *low).max(1) as f64;
            *v = (*v + (noise * span * width).round() as i64).clamp(*low, *high);
        }
        (ParamSpec::Categorical { choices, .. }, ParamValue::Categorical(v)) => {
            if !choices.is_empty() && rng.gen::<f64>() < swap {
                *v = choices[rng.gen_range(0..choices.len())].clone();
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomState {
    pub seed: u64,
    pub suggestion_count: u64,
}

#[derive(Debug, Clone)]
pub struct RandomStrategy {
    pub(crate) state: RandomState,
}

impl RandomStrategy {
    pub fn new(seed: u64) -> Self {
        Self {
            state: RandomState {
                seed,
                suggestion_count: 0,
            },
        }
    }

    pub fn suggest(&mut self, space: &SearchSpace) -> TrialSuggestion {
        let draws = space.draws_per_suggestion();
        let mut rng = rng_for(self.state.seed, self.state.suggestion_count, draws);
        self.state.suggestion_count += 1;
        space.sample(&mut rng)
    }

    pub fn observe(&mut self, _observation: Observation) {}

    pub fn state(&self) -> RandomState {
        self.state.clone()
    }

    pub fn restore(state: RandomState) -> Self {
        Self { state }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BayesianState {
    pub seed: u64,
    pub suggestion_count: u64,
    pub observations: Vec<Observation>,
    pub exploration: f64,
}

/// Exploit-with-jitter around the best observation, falling back to a fresh
/// sample with probability `exploration`.
#[derive(Debug, Clone)]
pub struct BayesianStrategy {
    pub(crate) state: BayesianState,
}

impl BayesianStrategy {
    pub fn new(seed: u64, exploration: f64) -> Self {
        Self {
            state: BayesianState {
                seed,
                suggestion_count: 0,
                observations: Vec::new(),
                exploration,
            },
        }
    }

    pub fn suggest(&mut self, space: &SearchSpace, objective: Objective) -> TrialSuggestion {
        let draws = space.draws_per_suggestion();
        let mut rng = rng_for(self.state.seed, self.state.suggestion_count, draws);
        let mut suggestion = space.sample(&mut rng);
        self.state.suggestion_count += 1;
        if self.state.observations.is_empty() {
            return suggestion;
        }

        if rng.gen::<f64>() < self.state.exploration {
            return suggestion;
        }

        let best = self
            .state
            .observations
            .iter()
            .min_by(|a, b| objective.ordering(a.metric, b.metric))
            .map(|obs| obs.suggestion.clone());
        if let Some(best) = best {
            // Names the best trial never asked for keep their fresh sample.
            suggestion.extend(best);
            for spec in &space.params {
                perturb(spec, &mut suggestion, &mut rng, 0.1, 0.25);
            }
        }
        space.clamp(&mut suggestion);
        suggestion
    }

    pub fn observe(&mut self, observation: Observation, objective: Objective) {
        self.state.observations.push(observation);
        self.state
            .observations
            .sort_by(|a, b| objective.ordering(a.metric, b.metric));
    }

    pub fn state(&self) -> BayesianState {
        self.state.clone()
    }

    pub fn restore(state: BayesianState) -> Self {
        Self { state }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationState {
    pub seed: u64,
    pub suggestion_count: u64,
    pub population: Vec<Observation>,
    pub population_size: usize,
    pub elite_fraction: f64,
    pub mutation_rate: f64,
}

#[derive(Debug, Clone)]
pub struct PopulationStrategy {
    pub(crate) state: PopulationState,
}

impl PopulationStrategy {
    pub fn new(seed: u64, population_size: usize, elite_fraction: f64, mutation_rate: f64) -> Self {
        Self {
            state: PopulationState {
                seed,
                suggestion_count: 0,
                population: Vec::new(),
                population_size: population_size.max(2),
                elite_fraction: elite_fraction.clamp(0.05, 0.5),
                mutation_rate: mutation_rate.clamp(0.0, 1.0),
            },
        }
    }

    pub fn suggest(&mut self, space: &SearchSpace, _objective: Objective) -> TrialSuggestion {
        let draws = space.draws_per_suggestion();
        let mut rng = rng_for(self.state.seed, self.state.suggestion_count, draws);
        self.state.suggestion_count += 1;

        let fresh = space.sample(&mut rng);
        if self.state.population.len() < self.state.population_size {
            return fresh;
        }

        // `observe` keeps the population sorted best first.
        let elite = (self.state.population_size as f64 * self.state.elite_fraction).ceil() as usize;
        let elite = elite.clamp(1, self.state.population.len());
        let parent = &self.state.population[rng.gen_range(0..elite)];
        let mut suggestion = fresh;
        suggestion.extend(parent.suggestion.clone());

        for spec in &space.params {
            if rng.gen::<f64>() < self.state.mutation_rate {
                perturb(spec, &mut suggestion, &mut rng, 0.2, 1.0);
            }
        }

        space.clamp(&mut suggestion);
        suggestion
    }

    pub fn observe(&mut self, observation: Observation, objective: Objective) {
        self.state.population.push(observation);
        self.state
            .population
            .sort_by(|a, b| objective.ordering(a.metric, b.metric));
        self.state.population.truncate(self.state.population_size);
    }

    pub fn state(&self) -> PopulationState {
        self.state.clone()
    }

    pub fn restore(state: PopulationState) -> Self {
        Self { state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> SearchSpace {
        SearchSpace::new(vec![
            ParamSpec::Float {
                name: "lr".into(),
                low: 1e-4,
                high: 1e-1,
                log: true,
            },
            ParamSpec::Int {
                name: "rank".into(),
                low: 1,
                high: 8,
            },
        ])
    }

    #[test]
    fn restored_random_strategy_continues_the_stream() {
        let space = space();
        let mut a = RandomStrategy::new(5);
        a.suggest(&space);
        let mut b = RandomStrategy::restore(a.state());
        assert_eq!(a.suggest(&space), b.suggest(&space));
    }

    #[test]
    fn population_keeps_best_members() {
        let mut strategy = PopulationStrategy::new(0, 2, 0.5, 0.0);
        let obs = |metric: f64| Observation {
            suggestion: TrialSuggestion::new(),
            metric,
        };
        for metric in [0.5, 0.1, 0.9] {
            strategy.observe(obs(metric), Objective::Maximize);
        }
        let kept: Vec<f64> = strategy.state.population.iter().map(|o| o.metric).collect();
        assert_eq!(kept, vec![0.9, 0.5]);
    }

    #[test]
    fn exploitation_stays_near_log_scaled_incumbent() {
        let space = space();
        let mut strategy = BayesianStrategy::new(9, 0.0);
        let mut best = TrialSuggestion::new();
        best.insert("lr".into(), ParamValue::Float(1e-3));
        best.insert("rank".into(), ParamValue::Int(4));
        strategy.observe(
            Observation {
                suggestion: best,
                metric: 1.0,
            },
            Objective::Maximize,
        );
        for _ in 0..20 {
            let next = strategy.suggest(&space, Objective::Maximize);
            let lr = next["lr"].as_f64().unwrap();
            assert!((1e-4..=1e-1).contains(&lr));
            // 0.1 of three decades is a sigma of 0.3 decades.
            assert!(lr > 1e-3 / 100.0 && lr < 1e-3 * 100.0);
        }
    }
}
