// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Run constants and per-trial knobs.
//!
//! [`UnlearnConfig`] is fixed for a whole search. [`TrialParams`] is sampled
//! once per trial from a [`SearchSpaceConfig`] through a [`TrialHandle`], so
//! the same code path serves live search and offline replay.

use crate::error::{UnlearnError, UnlearnResult};
use fade_hpo::{SearchError, TrialHandle};
use fade_nn::TokenLoss;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Derived-score family used to build the unlearning mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskKind {
    /// `disruption / |to_forget|^forget_amp` below a pooled quantile.
    #[default]
    Ratio,
    /// `disruption / |forget_grad|^forget_amp` below a pooled quantile.
    GradientRatio,
    /// Angle between forget direction and retain gradient inside a band.
    Angle,
}

impl MaskKind {
    pub fn needs_threshold(&self) -> bool {
        !matches!(self, MaskKind::Angle)
    }
}

/// What replaces the gradient of intervened weights before the base step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateDirection {
    /// `mask ⊙ to_forget`.
    #[default]
    Circuit,
    /// `mask ⊙ forget_grad`, optionally divided by the global norm.
    Gradient {
        #[serde(default)]
        normalize: bool,
    },
}

/// Where retain updates land.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetainMode {
    /// A dedicated `ret_lora` adapter, merged into the base at the end.
    #[default]
    Adapter,
    /// Directly on the intervened weights.
    Intervened,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

/// Placement of a low-rank adapter; the rank comes from the trial.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub target_modules: Vec<String>,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    pub optimizer: OptimizerKind,
}

fn default_alpha() -> f32 {
    8.0
}

impl AdapterSpec {
    fn retain_default() -> Self {
        Self {
            target_modules: vec!["mlp.up".into(), "mlp.down".into()],
            alpha: default_alpha(),
            optimizer: OptimizerKind::Sgd,
        }
    }

    fn adversary_default() -> Self {
        Self {
            target_modules: vec!["mlp.up".into(), "mlp.down".into()],
            alpha: default_alpha(),
            optimizer: OptimizerKind::Adam,
        }
    }
}

/// Early-termination thresholds. Every margin is relative to the losses of
/// the untouched model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub retain_margin: f32,
    /// Unlearning pauses while retain loss sits above `init + soft margin`.
    pub soft_retain_margin: Option<f32>,
    pub stagnation_step: usize,
    pub stagnation_margin: f32,
    /// Adversary forget loss below this means the adversary relearned.
    pub adversary_floor: Option<f32>,
    /// Adversary forget loss above this means the trial diverged.
    pub adversary_ceiling: Option<f32>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            retain_margin: 0.1,
            soft_retain_margin: Some(0.05),
            stagnation_step: 30,
            stagnation_margin: 0.05,
            adversary_floor: None,
            adversary_ceiling: Some(50.0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelearnConfig {
    pub steps: usize,
    pub lr: f32,
    pub rank: usize,
    pub alpha: f32,
    pub target_modules: Vec<String>,
    pub eval_every: usize,
    pub batch_size: usize,
    pub seed: u64,
}

impl Default for RelearnConfig {
    fn default() -> Self {
        Self {
            steps: 100,
            lr: 3e-4,
            rank: 1,
            alpha: 8.0,
            target_modules: vec!["mlp.up".into()],
            eval_every: 10,
            batch_size: 16,
            seed: 42,
        }
    }
}

/// Constants shared by every trial of a search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnlearnConfig {
    pub unlearn_steps: usize,
    pub batch_size: usize,
    pub eval_batch_size: usize,
    pub eval_every: usize,
    pub disruption_score_warmup: usize,
    /// Linear warmup of the unlearning rate, in unlearn sub-steps.
    pub unlearn_lr_warmup: u32,
    pub target_modules: Vec<String>,
    pub mask: MaskKind,
    pub update_direction: UpdateDirection,
    pub unlearn_loss: TokenLoss,
    pub retain_mode: RetainMode,
    pub ret_lora: AdapterSpec,
    pub adversary: Option<AdapterSpec>,
    pub gate: GateConfig,
    pub relearn: RelearnConfig,
    pub seed: u64,
}

impl Default for UnlearnConfig {
    fn default() -> Self {
        Self {
            unlearn_steps: 100,
            batch_size: 16,
            eval_batch_size: 16,
            eval_every: 10,
            disruption_score_warmup: 10,
            unlearn_lr_warmup: 0,
            target_modules: vec!["mlp.up".into(), "mlp.down".into()],
            mask: MaskKind::Ratio,
            update_direction: UpdateDirection::Circuit,
            unlearn_loss: TokenLoss::CorrectLogit,
            retain_mode: RetainMode::Adapter,
            ret_lora: AdapterSpec::retain_default(),
            adversary: Some(AdapterSpec::adversary_default()),
            gate: GateConfig::default(),
            relearn: RelearnConfig::default(),
            seed: 42,
        }
    }
}

impl UnlearnConfig {
    /// Rejects configurations that could never run a trial.
    pub fn validate(&self) -> UnlearnResult<()> {
        if self.batch_size == 0 {
            return Err(UnlearnError::config("batch_size", "must be positive"));
        }
        if self.eval_batch_size == 0 {
            return Err(UnlearnError::config("eval_batch_size", "must be positive"));
        }
        if self.eval_every == 0 {
            return Err(UnlearnError::config("eval_every", "must be positive"));
        }
        if self.target_modules.is_empty() {
            return Err(UnlearnError::config("target_modules", "no intervention targets"));
        }
        if self.retain_mode == RetainMode::Adapter && self.ret_lora.target_modules.is_empty() {
            return Err(UnlearnError::config("ret_lora.target_modules", "empty"));
        }
        if let Some(adversary) = &self.adversary {
            if adversary.target_modules.is_empty() {
                return Err(UnlearnError::config("adversary.target_modules", "empty"));
            }
        }
        let relearn = &self.relearn;
        if relearn.rank == 0 {
            return Err(UnlearnError::config("relearn.rank", "must be positive"));
        }
        if relearn.eval_every == 0 || relearn.batch_size == 0 {
            return Err(UnlearnError::config(
                "relearn",
                "eval_every and batch_size must be positive",
            ));
        }
        if !relearn.lr.is_finite() || relearn.lr < 0.0 {
            return Err(UnlearnError::config("relearn.lr", "must be finite and non-negative"));
        }
        let gate = &self.gate;
        for (field, value) in [
            ("gate.retain_margin", Some(gate.retain_margin)),
            ("gate.stagnation_margin", Some(gate.stagnation_margin)),
            ("gate.soft_retain_margin", gate.soft_retain_margin),
            ("gate.adversary_floor", gate.adversary_floor),
            ("gate.adversary_ceiling", gate.adversary_ceiling),
        ] {
            if value.is_some_and(|v| !v.is_finite()) {
                return Err(UnlearnError::config(field, "must be finite"));
            }
        }
        if let (Some(floor), Some(ceiling)) = (gate.adversary_floor, gate.adversary_ceiling) {
            if floor >= ceiling {
                return Err(UnlearnError::config(
                    "gate.adversary_floor",
                    format!("{floor} is not below the ceiling {ceiling}"),
                ));
            }
        }
        Ok(())
    }

    /// Flat `field -> value` view recorded next to every study.
    pub fn flatten(&self) -> UnlearnResult<Map<String, Value>> {
        let mut out = Map::new();
        flatten_into("", &serde_json::to_value(self)?, &mut out);
        Ok(out)
    }
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(&path, child, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

/// Bounds of one tunable knob, or a pinned value.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Knob {
    Fixed {
        value: f64,
    },
    Float {
        low: f64,
        high: f64,
        #[serde(default)]
        log: bool,
    },
    Int {
        low: i64,
        high: i64,
    },
}

impl Knob {
    pub const fn fixed(value: f64) -> Self {
        Knob::Fixed { value }
    }

    pub const fn uniform(low: f64, high: f64) -> Self {
        Knob::Float {
            low,
            high,
            log: false,
        }
    }

    pub const fn log_uniform(low: f64, high: f64) -> Self {
        Knob::Float {
            low,
            high,
            log: true,
        }
    }

    pub fn float(&self, trial: &mut dyn TrialHandle, name: &str) -> Result<f64, SearchError> {
        match *self {
            Knob::Fixed { value } => Ok(value),
            Knob::Float { low, high, log } => trial.suggest_float(name, low, high, log),
            Knob::Int { low, high } => Ok(trial.suggest_int(name, low, high)? as f64),
        }
    }

    pub fn int(&self, trial: &mut dyn TrialHandle, name: &str) -> Result<i64, SearchError> {
        match *self {
            Knob::Fixed { value } => Ok(value.round() as i64),
            Knob::Int { low, high } => trial.suggest_int(name, low, high),
            Knob::Float { .. } => Err(SearchError::InvalidSpec {
                name: name.to_string(),
                reason: "integer knob declared with float bounds".into(),
            }),
        }
    }
}

/// Declared ranges for every knob a trial may sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSpaceConfig {
    pub quantile: Knob,
    pub unlearning_rate: Knob,
    pub unlearn_lr_mult: Knob,
    pub retaining_rate: Knob,
    pub adv_lora_lr: Knob,
    pub retain_amp: Knob,
    pub forget_amp: Knob,
    pub disruption_score_decay: Knob,
    pub ret_lora_rank: Knob,
    pub adv_lora_rank: Knob,
    pub forget_thresh: Knob,
    pub alpha_low_thresh: Knob,
    pub alpha_thresh: Knob,
}

impl Default for SearchSpaceConfig {
    fn default() -> Self {
        Self {
            quantile: Knob::log_uniform(1e-4, 1e-2),
            unlearning_rate: Knob::log_uniform(5e-4, 1e-2),
            unlearn_lr_mult: Knob::fixed(1.0),
            retaining_rate: Knob::log_uniform(3e-4, 1e-3),
            adv_lora_lr: Knob::log_uniform(1e-4, 1e-3),
            retain_amp: Knob::uniform(1.2, 2.0),
            forget_amp: Knob::uniform(0.8, 1.2),
            disruption_score_decay: Knob::uniform(0.0, 0.5),
            ret_lora_rank: Knob::Int { low: 1, high: 10 },
            adv_lora_rank: Knob::Int { low: 1, high: 2 },
            forget_thresh: Knob::log_uniform(1e-3, 1.0),
            alpha_low_thresh: Knob::uniform(0.0, 70.0),
            alpha_thresh: Knob::uniform(88.0, 95.0),
        }
    }
}

/// Hyperparameters of one trial.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialParams {
    pub quantile: f64,
    pub unlearning_rate: f32,
    pub unlearn_lr_mult: f32,
    pub retaining_rate: f32,
    pub adv_lora_lr: f32,
    pub retain_amp: f32,
    pub forget_amp: f32,
    pub disruption_score_decay: f32,
    pub ret_lora_rank: usize,
    pub adv_lora_rank: usize,
    pub forget_thresh: f32,
    pub alpha_low_thresh: f32,
    pub alpha_thresh: f32,
}

impl Default for TrialParams {
    fn default() -> Self {
        Self {
            quantile: 1e-3,
            unlearning_rate: 1e-3,
            unlearn_lr_mult: 1.0,
            retaining_rate: 5e-4,
            adv_lora_lr: 3e-4,
            retain_amp: 1.6,
            forget_amp: 1.0,
            disruption_score_decay: 0.95,
            ret_lora_rank: 4,
            adv_lora_rank: 1,
            forget_thresh: 0.0,
            alpha_low_thresh: 0.0,
            alpha_thresh: 180.0,
        }
    }
}

impl TrialParams {
    /// Asks `trial` for every knob the configuration actually uses. Knobs
    /// that play no role keep their defaults and never enter the study.
    pub fn suggest(
        trial: &mut dyn TrialHandle,
        space: &SearchSpaceConfig,
        config: &UnlearnConfig,
    ) -> UnlearnResult<Self> {
        let mut params = TrialParams::default();
        if config.mask.needs_threshold() {
            params.quantile = space.quantile.float(trial, "quantile")?;
        }
        params.unlearning_rate = space.unlearning_rate.float(trial, "unlearning_rate")? as f32;
        params.unlearn_lr_mult = space.unlearn_lr_mult.float(trial, "unlearn_lr_mult")? as f32;
        params.retaining_rate = space.retaining_rate.float(trial, "retaining_rate")? as f32;
        params.retain_amp = space.retain_amp.float(trial, "retain_amp")? as f32;
        params.disruption_score_decay = space
            .disruption_score_decay
            .float(trial, "disruption_score_decay")? as f32;
        match config.mask {
            MaskKind::Ratio | MaskKind::GradientRatio => {
                params.forget_amp = space.forget_amp.float(trial, "forget_amp")? as f32;
            }
            MaskKind::Angle => {
                params.forget_thresh = space.forget_thresh.float(trial, "forget_thresh")? as f32;
                params.alpha_low_thresh =
                    space.alpha_low_thresh.float(trial, "alpha_low_thresh")? as f32;
                params.alpha_thresh = space.alpha_thresh.float(trial, "alpha_thresh")? as f32;
            }
        }
        if config.retain_mode == RetainMode::Adapter {
            params.ret_lora_rank = rank(space.ret_lora_rank.int(trial, "ret_lora_rank")?)?;
        }
        if config.adversary.is_some() {
            params.adv_lora_lr = space.adv_lora_lr.float(trial, "adv_lora_lr")? as f32;
            params.adv_lora_rank = rank(space.adv_lora_rank.int(trial, "adv_lora_rank")?)?;
        }
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> UnlearnResult<()> {
        if !(self.quantile > 0.0 && self.quantile < 1.0) {
            return Err(UnlearnError::config("quantile", format!("{} not in (0, 1)", self.quantile)));
        }
        if !(0.0..1.0).contains(&self.disruption_score_decay) {
            return Err(UnlearnError::config(
                "disruption_score_decay",
                format!("{} not in [0, 1)", self.disruption_score_decay),
            ));
        }
        for (field, value) in [
            ("retain_amp", self.retain_amp),
            ("forget_amp", self.forget_amp),
            ("unlearn_lr_mult", self.unlearn_lr_mult),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(UnlearnError::config(field, format!("{value} must be positive")));
            }
        }
        for (field, value) in [
            ("unlearning_rate", self.unlearning_rate),
            ("retaining_rate", self.retaining_rate),
            ("adv_lora_lr", self.adv_lora_lr),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(UnlearnError::config(field, format!("{value} is not a learning rate")));
            }
        }
        if self.ret_lora_rank == 0 || self.adv_lora_rank == 0 {
            return Err(UnlearnError::config("lora_rank", "ranks must be positive"));
        }
        Ok(())
    }
}

fn rank(value: i64) -> UnlearnResult<usize> {
    usize::try_from(value)
        .ok()
        .filter(|&r| r > 0)
        .ok_or_else(|| UnlearnError::config("lora_rank", format!("{value} must be positive")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fade_hpo::{LiveTrial, ParamValue, ReplayTrial, SearchSpace, TrialSuggestion};

    #[test]
    fn defaults_validate() {
        UnlearnConfig::default().validate().unwrap();
        TrialParams::default().validate().unwrap();
    }

    #[test]
    fn ratio_mask_never_asks_for_angle_knobs() {
        let mut space = SearchSpace::default();
        let mut trial = LiveTrial::new(0, TrialSuggestion::new(), &mut space, 3);
        let params = TrialParams::suggest(
            &mut trial,
            &SearchSpaceConfig::default(),
            &UnlearnConfig::default(),
        )
        .unwrap();
        assert!(trial.params().contains_key("quantile"));
        assert!(!trial.params().contains_key("alpha_thresh"));
        assert!(!trial.params().contains_key("unlearn_lr_mult"));
        assert!((1e-4..=1e-2).contains(&params.quantile));
        assert!((1..=10).contains(&params.ret_lora_rank));
    }

    #[test]
    fn angle_mask_replays_from_fixed_mapping() {
        let config = UnlearnConfig {
            mask: MaskKind::Angle,
            retain_mode: RetainMode::Intervened,
            adversary: None,
            ..UnlearnConfig::default()
        };
        let mut fixed = TrialSuggestion::new();
        for (name, value) in [
            ("unlearning_rate", 1e-3),
            ("retaining_rate", 4e-4),
            ("retain_amp", 1.5),
            ("disruption_score_decay", 0.2),
            ("forget_thresh", 0.01),
            ("alpha_low_thresh", 10.0),
            ("alpha_thresh", 90.0),
        ] {
            fixed.insert(name.into(), ParamValue::Float(value));
        }
        let mut trial = ReplayTrial::new(fixed);
        let params =
            TrialParams::suggest(&mut trial, &SearchSpaceConfig::default(), &config).unwrap();
        assert_eq!(params.alpha_thresh, 90.0);
        assert_eq!(params.quantile, TrialParams::default().quantile);
    }

    #[test]
    fn out_of_range_decay_is_a_config_error() {
        let params = TrialParams {
            disruption_score_decay: 1.0,
            ..TrialParams::default()
        };
        assert!(matches!(
            params.validate(),
            Err(UnlearnError::InvalidConfig { field, .. }) if field == "disruption_score_decay"
        ));
    }

    #[test]
    fn adversary_floor_must_sit_below_the_ceiling() {
        let mut config = UnlearnConfig::default();
        config.gate.adversary_floor = Some(3.0);
        config.validate().unwrap();
        config.gate.adversary_floor = Some(60.0);
        assert!(matches!(
            config.validate(),
            Err(UnlearnError::InvalidConfig { field, .. }) if field == "gate.adversary_floor"
        ));
    }

    #[test]
    fn knobs_deserialize_from_tagged_tables() {
        let space: SearchSpaceConfig = serde_json::from_value(serde_json::json!({
            "quantile": {"kind": "fixed", "value": 0.01},
            "ret_lora_rank": {"kind": "int", "low": 2, "high": 3}
        }))
        .unwrap();
        assert_eq!(space.quantile, Knob::fixed(0.01));
        assert_eq!(space.unlearning_rate, SearchSpaceConfig::default().unlearning_rate);
    }

    #[test]
    fn flatten_uses_dotted_paths() {
        let flat = UnlearnConfig::default().flatten().unwrap();
        assert_eq!(flat["gate.retain_margin"], serde_json::json!(0.1f32));
        assert_eq!(flat["unlearn_steps"], serde_json::json!(100));
    }
}
