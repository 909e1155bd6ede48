use crate::SearchError;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ParamSpec {
    Float {
        name: String,
        low: f64,
        high: f64,
        /// Sample uniformly in `ln` space.
        #[serde(default)]
        log: bool,
    },
    Int {
        name: String,
        low: i64,
        high: i64,
    },
    Categorical {
        name: String,
        choices: Vec<String>,
    },
}

impl ParamSpec {
    pub fn name(&self) -> &str {
        match self {
            ParamSpec::Float { name, .. }
            | ParamSpec::Int { name, .. }
            | ParamSpec::Categorical { name, .. } => name,
        }
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        let invalid = |reason: &str| SearchError::InvalidSpec {
            name: self.name().to_string(),
            reason: reason.to_string(),
        };
        match self {
            ParamSpec::Float { low, high, log, .. } => {
                if !low.is_finite() || !high.is_finite() {
                    return Err(invalid("bounds must be finite"));
                }
                if low > high {
                    return Err(invalid("low exceeds high"));
                }
                if *log && *low <= 0.0 {
                    return Err(invalid("log-scaled bounds must be positive"));
                }
            }
            ParamSpec::Int { low, high, .. } => {
                if low > high {
                    return Err(invalid("low exceeds high"));
                }
            }
            ParamSpec::Categorical { choices, .. } => {
                if choices.is_empty() {
                    return Err(invalid("no choices"));
                }
            }
        }
        Ok(())
    }

    /// Draws one value using exactly one `f64` from `rng`.
    pub fn sample(&self, rng: &mut StdRng) -> ParamValue {
        let raw = rng.gen::<f64>();
        match self {
            ParamSpec::Float {
                low, high, log, ..
            } => {
                let v = if *log {
                    let (ln_low, ln_high) = (low.ln(), high.ln());
                    (ln_low + (ln_high - ln_low) * raw).exp()
                } else {
                    low + (high - low) * raw
                };
                ParamValue::Float(v.clamp(*low, *high))
            }
            ParamSpec::Int { low, high, .. } => {
                let range = (*high - *low + 1) as f64;
                let v = *low + (raw * range).floor() as i64;
                ParamValue::Int(v.clamp(*low, *high))
            }
            ParamSpec::Categorical { choices, .. } => {
                let idx = ((choices.len() as f64) * raw).floor() as usize;
                let idx = idx.min(choices.len().saturating_sub(1));
                ParamValue::Categorical(choices[idx].clone())
            }
        }
    }

    /// Whether `value` has the right kind and lies inside the bounds.
    pub fn contains(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (ParamSpec::Float { low, high, .. }, ParamValue::Float(v)) => *v >= *low && *v <= *high,
            (ParamSpec::Int { low, high, .. }, ParamValue::Int(v)) => *v >= *low && *v <= *high,
            (ParamSpec::Categorical { choices, .. }, ParamValue::Categorical(v)) => {
                choices.contains(v)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum ParamValue {
    Float(f64),
    Int(i64),
    Categorical(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Categorical(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Categorical(v) => Some(v),
            _ => None,
        }
    }

    /// Plain JSON scalar, as written to user-facing reports.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Float(v) => serde_json::json!(v),
            ParamValue::Int(v) => serde_json::json!(v),
            ParamValue::Categorical(v) => serde_json::json!(v),
        }
    }
}

pub type TrialSuggestion = BTreeMap<String, ParamValue>;

/// Parameters known to a study. Define-by-run objectives grow it as trials
/// ask for new names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchSpace {
    pub params: Vec<ParamSpec>,
}

impl SearchSpace {
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self { params }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|spec| spec.name() == name)
    }

    /// Adds `spec` unless an identical one is already known. A different
    /// spec under the same name is rejected so proposals stay meaningful.
    pub fn register(&mut self, spec: ParamSpec) -> Result<(), SearchError> {
        spec.validate()?;
        match self.get(spec.name()) {
            Some(existing) if *existing == spec => Ok(()),
            Some(_) => Err(SearchError::ConflictingSpec {
                name: spec.name().to_string(),
            }),
            None => {
                self.params.push(spec);
                Ok(())
            }
        }
    }

    pub fn sample(&self, rng: &mut StdRng) -> TrialSuggestion {
        self.params
            .iter()
            .map(|spec| (spec.name().to_string(), spec.sample(rng)))
            .collect()
    }

    pub fn clamp(&self, suggestion: &mut TrialSuggestion) {
        for spec in &self.params {
            if let Some(value) = suggestion.get_mut(spec.name()) {
                match spec {
                    ParamSpec::Float { low, high, .. } => match value {
                        ParamValue::Float(v) => {
                            *v = v.clamp(*low, *high);
                        }
                        ParamValue::Int(v) => {
                            let new_val = (*v as f64).clamp(*low, *high);
                            *value = ParamValue::Float(new_val);
                        }
                        _ => {}
                    },
                    ParamSpec::Int { low, high, .. } => match value {
                        ParamValue::Int(v) => {
                            *v = (*v).clamp(*low, *high);
                        }
                        ParamValue::Float(v) => {
                            let iv = (*v).round().clamp(*low as f64, *high as f64) as i64;
                            *value = ParamValue::Int(iv);
                        }
                        _ => {}
                    },
                    ParamSpec::Categorical { choices, .. } => {
                        if let ParamValue::Categorical(choice) = value {
                            if !choices.contains(choice) && !choices.is_empty() {
                                *choice = choices[0].clone();
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn draws_per_suggestion(&self) -> usize {
        self.params.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_floats_stay_in_bounds_and_spread_by_decade() {
        let spec = ParamSpec::Float {
            name: "quantile".into(),
            low: 1e-4,
            high: 1e-2,
            log: true,
        };
        let mut rng = StdRng::seed_from_u64(3);
        let mut below_1e3 = 0;
        for _ in 0..2000 {
            let v = spec.sample(&mut rng).as_f64().unwrap();
            assert!((1e-4..=1e-2).contains(&v));
            if v < 1e-3 {
                below_1e3 += 1;
            }
        }
        // Half of the mass sits in the lower decade on a log scale.
        assert!((800..1200).contains(&below_1e3));
    }

    #[test]
    fn register_rejects_conflicts_and_bad_bounds() {
        let mut space = SearchSpace::default();
        let rank = ParamSpec::Int {
            name: "rank".into(),
            low: 1,
            high: 10,
        };
        space.register(rank.clone()).unwrap();
        space.register(rank).unwrap();
        assert_eq!(space.len(), 1);
        assert!(matches!(
            space.register(ParamSpec::Int {
                name: "rank".into(),
                low: 1,
                high: 2,
            }),
            Err(SearchError::ConflictingSpec { .. })
        ));
        assert!(space
            .register(ParamSpec::Float {
                name: "lr".into(),
                low: 0.0,
                high: 1.0,
                log: true,
            })
            .is_err());
    }

    #[test]
    fn values_serialise_tagged() {
        let text = serde_json::to_string(&ParamValue::Int(3)).unwrap();
        assert_eq!(text, r#"{"type":"Int","value":3}"#);
        assert_eq!(ParamValue::Float(2.0).as_i64(), Some(2));
        assert_eq!(ParamValue::Categorical("x".into()).as_f64(), None);
    }
}
