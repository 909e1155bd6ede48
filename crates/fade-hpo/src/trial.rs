use crate::space::{ParamSpec, ParamValue, SearchSpace, TrialSuggestion};
use crate::SearchError;
use rand::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;

/// What an objective function sees of the trial it is evaluating.
///
/// Asking twice for the same name returns the first answer.
pub trait TrialHandle {
    fn number(&self) -> usize;

    fn suggest_float(
        &mut self,
        name: &str,
        low: f64,
        high: f64,
        log: bool,
    ) -> Result<f64, SearchError>;

    fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> Result<i64, SearchError>;

    fn suggest_categorical(&mut self, name: &str, choices: &[&str]) -> Result<String, SearchError>;

    fn set_user_attr(&mut self, key: &str, value: Value);

    /// Values handed out so far.
    fn params(&self) -> &TrialSuggestion;

    fn user_attrs(&self) -> &BTreeMap<String, Value>;
}

/// Trial backed by a running study. Names the study already knows take the
/// strategy's proposal; new names are declared in the space and sampled.
pub struct LiveTrial<'a> {
    number: usize,
    proposal: TrialSuggestion,
    space: &'a mut SearchSpace,
    rng: StdRng,
    params: TrialSuggestion,
    user_attrs: BTreeMap<String, Value>,
}

impl<'a> LiveTrial<'a> {
    pub fn new(
        number: usize,
        proposal: TrialSuggestion,
        space: &'a mut SearchSpace,
        seed: u64,
    ) -> Self {
        Self {
            number,
            proposal,
            space,
            rng: StdRng::seed_from_u64(seed),
            params: TrialSuggestion::new(),
            user_attrs: BTreeMap::new(),
        }
    }

    pub fn into_parts(self) -> (TrialSuggestion, BTreeMap<String, Value>) {
        (self.params, self.user_attrs)
    }

    fn resolve(&mut self, spec: ParamSpec) -> Result<ParamValue, SearchError> {
        let name = spec.name().to_string();
        self.space.register(spec.clone())?;
        if let Some(value) = self.params.get(&name) {
            return Ok(value.clone());
        }
        let value = match self.proposal.get(&name) {
            Some(value) if spec.contains(value) => value.clone(),
            _ => spec.sample(&mut self.rng),
        };
        self.params.insert(name, value.clone());
        Ok(value)
    }
}

impl TrialHandle for LiveTrial<'_> {
    fn number(&self) -> usize {
        self.number
    }

    fn suggest_float(
        &mut self,
        name: &str,
        low: f64,
        high: f64,
        log: bool,
    ) -> Result<f64, SearchError> {
        let value = self.resolve(ParamSpec::Float {
            name: name.to_string(),
            low,
            high,
            log,
        })?;
        value.as_f64().ok_or_else(|| SearchError::ConflictingSpec {
            name: name.to_string(),
        })
    }

    fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> Result<i64, SearchError> {
        let value = self.resolve(ParamSpec::Int {
            name: name.to_string(),
            low,
            high,
        })?;
        value.as_i64().ok_or_else(|| SearchError::ConflictingSpec {
            name: name.to_string(),
        })
    }

    fn suggest_categorical(&mut self, name: &str, choices: &[&str]) -> Result<String, SearchError> {
        let value = self.resolve(ParamSpec::Categorical {
            name: name.to_string(),
            choices: choices.iter().map(|c| c.to_string()).collect(),
        })?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SearchError::ConflictingSpec {
                name: name.to_string(),
            })
    }

    fn set_user_attr(&mut self, key: &str, value: Value) {
        self.user_attrs.insert(key.to_string(), value);
    }

    fn params(&self) -> &TrialSuggestion {
        &self.params
    }

    fn user_attrs(&self) -> &BTreeMap<String, Value> {
        &self.user_attrs
    }
}

/// Trial that answers from a fixed mapping, for re-running a known
/// configuration offline. Bounds are ignored; a missing name is an error.
#[derive(Debug, Clone, Default)]
pub struct ReplayTrial {
    number: usize,
    fixed: TrialSuggestion,
    params: TrialSuggestion,
    user_attrs: BTreeMap<String, Value>,
}

impl ReplayTrial {
    pub fn new(fixed: TrialSuggestion) -> Self {
        Self {
            fixed,
            ..Self::default()
        }
    }

    pub fn with_number(mut self, number: usize) -> Self {
        self.number = number;
        self
    }

    /// Reads a flat JSON object of numbers and strings. Integral JSON
    /// numbers become `Int`, other numbers `Float`.
    pub fn from_json(value: &Value) -> Result<Self, SearchError> {
        let Some(object) = value.as_object() else {
            return Err(SearchError::ReplayMismatch {
                name: "<root>".into(),
                expected: "object",
            });
        };
        let mut fixed = TrialSuggestion::new();
        for (name, raw) in object {
            let parsed = if let Some(i) = raw.as_i64() {
                ParamValue::Int(i)
            } else if let Some(f) = raw.as_f64() {
                ParamValue::Float(f)
            } else if let Some(s) = raw.as_str() {
                ParamValue::Categorical(s.to_string())
            } else {
                return Err(SearchError::ReplayMismatch {
                    name: name.clone(),
                    expected: "scalar",
                });
            };
            fixed.insert(name.clone(), parsed);
        }
        Ok(Self::new(fixed))
    }

    pub fn into_parts(self) -> (TrialSuggestion, BTreeMap<String, Value>) {
        (self.params, self.user_attrs)
    }

    fn lookup(&mut self, name: &str) -> Result<ParamValue, SearchError> {
        let value = self
            .fixed
            .get(name)
            .cloned()
            .ok_or_else(|| SearchError::MissingReplayParam(name.to_string()))?;
        self.params.insert(name.to_string(), value.clone());
        Ok(value)
    }
}

impl TrialHandle for ReplayTrial {
    fn number(&self) -> usize {
        self.number
    }

    fn suggest_float(
        &mut self,
        name: &str,
        _low: f64,
        _high: f64,
        _log: bool,
    ) -> Result<f64, SearchError> {
        self.lookup(name)?
            .as_f64()
            .ok_or_else(|| SearchError::ReplayMismatch {
                name: name.to_string(),
                expected: "float",
            })
    }

    fn suggest_int(&mut self, name: &str, _low: i64, _high: i64) -> Result<i64, SearchError> {
        self.lookup(name)?
            .as_i64()
            .ok_or_else(|| SearchError::ReplayMismatch {
                name: name.to_string(),
                expected: "int",
            })
    }

    fn suggest_categorical(
        &mut self,
        name: &str,
        _choices: &[&str],
    ) -> Result<String, SearchError> {
        self.lookup(name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SearchError::ReplayMismatch {
                name: name.to_string(),
                expected: "category",
            })
    }

    fn set_user_attr(&mut self, key: &str, value: Value) {
        self.user_attrs.insert(key.to_string(), value);
    }

    fn params(&self) -> &TrialSuggestion {
        &self.params
    }

    fn user_attrs(&self) -> &BTreeMap<String, Value> {
        &self.user_attrs
    }
}
