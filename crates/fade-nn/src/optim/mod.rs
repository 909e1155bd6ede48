// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Optimisers bound to a named group of parameters.
//!
//! Several optimisers share one model during unlearning, each owning a
//! disjoint [`ParamGroup`]. A step only touches parameters in its group that
//! currently hold a gradient, so a group whose gradients were cleared is left
//! bit-identical.

use crate::module::Module;
use crate::{PureResult, TensorError};
use std::collections::{BTreeSet, HashMap};

fn validate_lr(lr: f32) -> PureResult<f32> {
    if !lr.is_finite() || lr < 0.0 {
        return Err(TensorError::NonPositiveLearningRate { rate: lr });
    }
    Ok(lr)
}

/// Set of parameter names an optimiser is allowed to update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParamGroup {
    names: BTreeSet<String>,
}

impl ParamGroup {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Collects every parameter of `module` whose name satisfies `predicate`.
    pub fn select<M: Module + ?Sized>(
        module: &M,
        predicate: impl Fn(&str) -> bool,
    ) -> PureResult<Self> {
        let mut names = BTreeSet::new();
        module.visit_parameters(&mut |param| {
            if predicate(param.name()) {
                names.insert(param.name().to_string());
            }
            Ok(())
        })?;
        Ok(Self { names })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// Common surface of the group-bound optimisers.
pub trait Optimizer {
    fn group(&self) -> &ParamGroup;

    fn learning_rate(&self) -> f32;

    /// Zero is accepted and turns the step into a no-op.
    fn set_learning_rate(&mut self, lr: f32) -> PureResult<()>;

    /// Applies one update to every parameter in the group holding a gradient.
    fn step(&mut self, module: &mut dyn Module) -> PureResult<()>;
}

/// Plain stochastic gradient descent.
#[derive(Clone, Debug)]
pub struct Sgd {
    lr: f32,
    group: ParamGroup,
}

impl Sgd {
    pub fn new(group: ParamGroup, lr: f32) -> PureResult<Self> {
        Ok(Self {
            lr: validate_lr(lr)?,
            group,
        })
    }
}

impl Optimizer for Sgd {
    fn group(&self) -> &ParamGroup {
        &self.group
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) -> PureResult<()> {
        self.lr = validate_lr(lr)?;
        Ok(())
    }

    fn step(&mut self, module: &mut dyn Module) -> PureResult<()> {
        let lr = self.lr;
        let group = &self.group;
        module.visit_parameters_mut(&mut |param| {
            if group.contains(param.name()) {
                param.apply_step(lr)?;
            }
            Ok(())
        })
    }
}

/// Adam hyperparameters.
#[derive(Clone, Debug, PartialEq)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        AdamConfig {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Moment buffers for a single parameter plus its own step count for bias
/// correction.
#[derive(Clone, Debug)]
struct MomentBuf {
    m: Vec<f32>,
    v: Vec<f32>,
    step: u32,
}

impl MomentBuf {
    fn zeros(n: usize) -> Self {
        MomentBuf {
            m: vec![0.0; n],
            v: vec![0.0; n],
            step: 0,
        }
    }
}

#[inline]
#[allow(clippy::too_many_arguments)]
fn adam_step_buf(
    params: &mut [f32],
    grads: &[f32],
    m: &mut [f32],
    v: &mut [f32],
    lr: f32,
    config: &AdamConfig,
    bc1_inv: f32,
    bc2_inv: f32,
) {
    debug_assert_eq!(params.len(), grads.len());
    for i in 0..params.len() {
        let g = grads[i];
        m[i] = config.beta1 * m[i] + (1.0 - config.beta1) * g;
        v[i] = config.beta2 * v[i] + (1.0 - config.beta2) * g * g;
        let m_hat = m[i] * bc1_inv;
        let v_hat = v[i] * bc2_inv;
        params[i] -= lr * (m_hat / (v_hat.sqrt() + config.eps) + config.weight_decay * params[i]);
    }
}

/// Adam with decoupled weight decay.
#[derive(Clone, Debug)]
pub struct Adam {
    lr: f32,
    config: AdamConfig,
    group: ParamGroup,
    state: HashMap<String, MomentBuf>,
}

impl Adam {
    pub fn new(group: ParamGroup, lr: f32) -> PureResult<Self> {
        Self::with_config(group, lr, AdamConfig::default())
    }

    pub fn with_config(group: ParamGroup, lr: f32, config: AdamConfig) -> PureResult<Self> {
        Ok(Self {
            lr: validate_lr(lr)?,
            config,
            group,
            state: HashMap::new(),
        })
    }
}

impl Optimizer for Adam {
    fn group(&self) -> &ParamGroup {
        &self.group
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) -> PureResult<()> {
        self.lr = validate_lr(lr)?;
        Ok(())
    }

    fn step(&mut self, module: &mut dyn Module) -> PureResult<()> {
        let lr = self.lr;
        let config = &self.config;
        let group = &self.group;
        let state = &mut self.state;
        module.visit_parameters_mut(&mut |param| {
            if !group.contains(param.name()) {
                return Ok(());
            }
            let Some(grad) = param.gradient().cloned() else {
                return Ok(());
            };
            let buf = state
                .entry(param.name().to_string())
                .or_insert_with(|| MomentBuf::zeros(grad.len()));
            buf.step += 1;
            let t = buf.step as f32;
            let bc1_inv = 1.0 / (1.0 - config.beta1.powf(t));
            let bc2_inv = 1.0 / (1.0 - config.beta2.powf(t));
            adam_step_buf(
                param.value_mut().data_mut(),
                grad.data(),
                &mut buf.m,
                &mut buf.v,
                lr,
                config,
                bc1_inv,
                bc2_inv,
            );
            Ok(())
        })
    }
}

/// Learning rate schedule advanced once per optimiser step.
pub trait LrScheduler {
    /// Advances the schedule returning the new learning rate.
    fn step(&mut self) -> f32;
    /// Returns the most recent learning rate produced by [`LrScheduler::step`].
    fn current_lr(&self) -> f32;
    /// Resets the scheduler to its initial state.
    fn reset(&mut self);

    /// Advances the schedule and pushes the new rate into `optimizer`.
    fn step_optimizer(&mut self, optimizer: &mut dyn Optimizer) -> PureResult<f32> {
        let lr = self.step();
        optimizer.set_learning_rate(lr)?;
        Ok(lr)
    }
}

/// Linear warmup followed by geometric growth `base * growth^(t - warmup)`.
///
/// With `growth > 1` this compensates for a mask that covers fewer weights
/// as training goes on.
#[derive(Debug, Clone)]
pub struct WarmupGrowthScheduler {
    base_lr: f32,
    growth: f32,
    warmup_steps: u32,
    step: u32,
    last_lr: f32,
}

impl WarmupGrowthScheduler {
    pub fn new(base_lr: f32, growth: f32, warmup_steps: u32) -> PureResult<Self> {
        let base_lr = validate_lr(base_lr)?;
        if !growth.is_finite() || growth <= 0.0 {
            return Err(TensorError::NonFiniteValue {
                label: "scheduler_growth",
                value: growth,
            });
        }
        Ok(Self {
            base_lr,
            growth,
            warmup_steps,
            step: 0,
            last_lr: Self::initial_lr(base_lr, warmup_steps),
        })
    }

    /// Constant rate.
    pub fn constant(lr: f32) -> PureResult<Self> {
        Self::new(lr, 1.0, 0)
    }

    fn initial_lr(base_lr: f32, warmup_steps: u32) -> f32 {
        if warmup_steps > 0 {
            0.0
        } else {
            base_lr
        }
    }
}

impl LrScheduler for WarmupGrowthScheduler {
    fn step(&mut self) -> f32 {
        self.step = self.step.saturating_add(1);
        let lr = if self.warmup_steps > 0 && self.step <= self.warmup_steps {
            self.base_lr * self.step as f32 / self.warmup_steps as f32
        } else {
            let exponent = (self.step - self.warmup_steps) as i32;
            self.base_lr * self.growth.powi(exponent)
        };
        self.last_lr = if lr.is_finite() { lr } else { self.last_lr };
        self.last_lr
    }

    fn current_lr(&self) -> f32 {
        self.last_lr
    }

    fn reset(&mut self) {
        self.step = 0;
        self.last_lr = Self::initial_lr(self.base_lr, self.warmup_steps);
    }
}
